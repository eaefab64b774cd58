//! Key/value serializers
//!
//! A serializer must be deterministic and must write exactly the number of bytes
//! it declares through `serialized_size`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Converts values to and from the byte form stored in the table
pub trait CacheSerializer<T>: Send + Sync {
    /// Exact number of bytes `serialize` will write for `value`
    fn serialized_size(&self, value: &T) -> usize;

    /// Append the encoded form of `value` to `buf`
    fn serialize(&self, value: &T, buf: &mut BytesMut) -> Result<()>;

    /// Decode a value from the front of `buf`, advancing it
    fn deserialize(&self, buf: &mut Bytes) -> Result<T>;
}

fn take_prefixed(buf: &mut Bytes, what: &str) -> Result<Bytes> {
    if buf.remaining() < 4 {
        return Err(Error::eof(format!("{} length prefix", what)));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(Error::eof(format!(
            "{} of {} bytes, {} available",
            what,
            len,
            buf.remaining()
        )));
    }
    Ok(buf.split_to(len))
}

fn put_prefixed(bytes: &[u8], buf: &mut BytesMut) -> Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| Error::Config(format!("{} bytes exceed the u32 length prefix", bytes.len())))?;
    buf.put_u32(len);
    buf.put_slice(bytes);
    Ok(())
}

/// Raw bytes with a big-endian u32 length prefix
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer;

impl CacheSerializer<Bytes> for BytesSerializer {
    fn serialized_size(&self, value: &Bytes) -> usize {
        4 + value.len()
    }

    fn serialize(&self, value: &Bytes, buf: &mut BytesMut) -> Result<()> {
        put_prefixed(value, buf)
    }

    fn deserialize(&self, buf: &mut Bytes) -> Result<Bytes> {
        take_prefixed(buf, "bytes")
    }
}

/// UTF-8 strings with a big-endian u32 length prefix
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl CacheSerializer<String> for StringSerializer {
    fn serialized_size(&self, value: &String) -> usize {
        4 + value.len()
    }

    fn serialize(&self, value: &String, buf: &mut BytesMut) -> Result<()> {
        put_prefixed(value.as_bytes(), buf)
    }

    fn deserialize(&self, buf: &mut Bytes) -> Result<String> {
        let raw = take_prefixed(buf, "string")?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| Error::corrupt(format!("string is not valid UTF-8: {}", e)))
    }
}

/// Encode `value`, enforcing that the declared and written sizes agree
pub fn encode<T, S>(serializer: &S, value: &T) -> Result<Bytes>
where
    S: CacheSerializer<T> + ?Sized,
{
    let declared = serializer.serialized_size(value);
    let mut buf = BytesMut::with_capacity(declared);
    serializer.serialize(value, &mut buf)?;
    if buf.len() != declared {
        return Err(Error::SerializerSizeMismatch {
            declared,
            written: buf.len(),
        });
    }
    Ok(buf.freeze())
}
