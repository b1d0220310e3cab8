//! Shared types for the serverless MapReduce driver. Users describe a
//! computation as a map and a reduce function over key-value pairs; the
//! driver turns it into parallel tasks. Data lives on a local filesystem
//! or an S3-compatible store, unlike Hadoop or GFS.

use std::fmt;
use std::fmt::Formatter;
use std::hash::Hasher;

use bytes::Bytes;

pub mod cache;
pub mod codec;
pub mod fs;
pub mod s3;
pub mod utils;

/////////////////////////////////////////////////////////////////////////////
// MapReduce application types
/////////////////////////////////////////////////////////////////////////////

/// The output of an application map function.
///
/// There are 2 layers of [`anyhow::Result`]s here. The outer layer
/// accounts for errors that arise while creating the iterator.
/// The inner layer accounts for errors that occur during iteration.
///
/// This accomodates both batch (all keys emitted at once) and lazy
/// (keys only emitted when the iterator is consumed) map operations.
pub type MapOutput = anyhow::Result<Box<dyn Iterator<Item = anyhow::Result<KeyValue>>>>;

/// A map function takes a key-value pair and auxiliary arguments.
///
/// It returns an iterator that yields new key-value pairs.
pub type MapFn = fn(kv: KeyValue, aux: Bytes) -> MapOutput;

/// A reduce function takes in a key, an iterator over values for that key,
/// and an auxiliary argument. It returns an [`anyhow::Result`]
/// containing a single output value.
pub type ReduceFn = fn(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    aux: Bytes,
) -> anyhow::Result<Bytes>;

/// A partition function routes an intermediate key to one of `bins`
/// reduce bins. Must be pure: the same key always lands in the same bin.
pub type PartitionFn = fn(key: &[u8], bins: u32) -> u32;

/// A map reduce application.
#[derive(Copy, Clone)]
pub struct Workload {
    pub map_fn: MapFn,
    pub reduce_fn: ReduceFn,
}

/////////////////////////////////////////////////////////////////////////////
// Key-value pairs
/////////////////////////////////////////////////////////////////////////////

/// A single key-value pair.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct KeyValue {
    /// The key.
    pub key: Bytes,

    /// The value.
    pub value: Bytes,
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}",
            String::from_utf8_lossy(&self.key),
            String::from_utf8_lossy(&self.value)
        )
    }
}

impl KeyValue {
    /// Construct a new key-value pair from the given key and value.
    pub fn new(key: Bytes, value: Bytes) -> Self {
        Self { key, value }
    }

    /// Get the key of this key-value pair.
    ///
    /// This method is cheap, since [`Bytes`] are cheaply cloneable.
    #[inline]
    pub fn key(&self) -> Bytes {
        self.key.clone()
    }

    /// Get the value of this key-value pair.
    ///
    /// This method is cheap, since [`Bytes`] are cheaply cloneable.
    #[inline]
    pub fn value(&self) -> Bytes {
        self.value.clone()
    }

    /// Consumes the key-value pair and returns the key.
    #[inline]
    pub fn into_key(self) -> Bytes {
        self.key
    }

    /// Consumes the key-value pair and returns the value.
    #[inline]
    pub fn into_value(self) -> Bytes {
        self.value
    }
}

/// Hashes an intermediate key. Compute a reduce bin for a given key
/// by calculating `ihash(key) % bins`.
pub fn ihash(key: &[u8]) -> u32 {
    let mut hasher = fnv::FnvHasher::with_key(0);
    hasher.write(key);
    let value = hasher.finish() & 0x7fffffff;
    u32::try_from(value).expect("Failed to compute ihash of value")
}

/// The default partitioner: `ihash(key) % bins`.
pub fn default_partition(key: &[u8], bins: u32) -> u32 {
    ihash(key) % bins.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_stays_in_range() {
        for key in ["a", "some longer key", ""] {
            let bin = default_partition(key.as_bytes(), 7);
            assert!(bin < 7);
        }
    }

    #[test]
    fn partition_is_stable() {
        assert_eq!(
            default_partition(b"stable", 16),
            default_partition(b"stable", 16)
        );
    }
}
