//! Typed facade over [`SegmentedTable`]

use bytes::Bytes;
use std::marker::PhantomData;
use std::sync::Arc;

use super::segment::PutOutcome;
use super::serializer::{encode, CacheSerializer};
use super::table::SegmentedTable;
use crate::error::Result;

/// Serializes keys and values on the way in and out of a shared table
pub struct TypedCache<K, V, KS, VS> {
    table: Arc<SegmentedTable>,
    keys: KS,
    values: VS,
    _marker: PhantomData<fn(K, V)>,
}

impl<K, V, KS, VS> TypedCache<K, V, KS, VS>
where
    KS: CacheSerializer<K>,
    VS: CacheSerializer<V>,
{
    /// Wrap `table` with serializers for keys and values
    pub fn new(table: Arc<SegmentedTable>, keys: KS, values: VS) -> Self {
        Self {
            table,
            keys,
            values,
            _marker: PhantomData,
        }
    }

    /// Underlying byte table
    pub fn table(&self) -> &Arc<SegmentedTable> {
        &self.table
    }

    /// Decoded value for `key`, if present
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let raw_key = encode(&self.keys, key)?;
        match self.table.get(&raw_key)? {
            Some(mut raw) => Ok(Some(self.values.deserialize(&mut raw)?)),
            None => Ok(None),
        }
    }

    /// Encode and store a mapping
    pub fn put(&self, key: &K, value: &V) -> Result<PutOutcome> {
        let raw_key = encode(&self.keys, key)?;
        let raw_value = encode(&self.values, value)?;
        self.table.put(&raw_key, &raw_value)
    }

    /// Encode and store a mapping unless `key` is present
    pub fn put_if_absent(&self, key: &K, value: &V) -> Result<bool> {
        let raw_key = encode(&self.keys, key)?;
        let raw_value = encode(&self.values, value)?;
        self.table.put_if_absent(&raw_key, &raw_value)
    }

    /// Remove `key`, returning whether it was present
    pub fn remove(&self, key: &K) -> Result<bool> {
        let raw_key = encode(&self.keys, key)?;
        self.table.remove(&raw_key)
    }

    /// True if `key` is present; does not touch the LRU order
    pub fn contains_key(&self, key: &K) -> Result<bool> {
        let raw_key = encode(&self.keys, key)?;
        self.table.contains_key(&raw_key)
    }

    /// Decoded keys, lazily, one segment at a time
    pub fn keys(&self) -> impl Iterator<Item = Result<K>> + '_ {
        self.table.key_iterator().map(move |raw: Bytes| {
            let mut raw = raw;
            self.keys.deserialize(&mut raw)
        })
    }
}
