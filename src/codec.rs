//! Conversion between typed records and the byte pairs the engine sorts,
//! spills and merges, plus the key order used by every comparison.

use std::cmp::Ordering;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub trait KvCodec: Send + Sync {
    type Key;
    type Value;

    fn encode_key(&self, key: &Self::Key, buf: &mut Vec<u8>) -> Result<()>;
    fn decode_key(&self, bytes: &[u8]) -> Result<Self::Key>;
    fn encode_value(&self, value: &Self::Value, buf: &mut Vec<u8>) -> Result<()>;
    fn decode_value(&self, bytes: &[u8]) -> Result<Self::Value>;
}

/// Serde codec backed by bincode. The encoding is not order preserving, so
/// pair it with [`DecodedKeyComparator`].
pub struct BincodeCodec<K, V> {
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> BincodeCodec<K, V> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<K, V> Default for BincodeCodec<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Clone for BincodeCodec<K, V> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<K, V> KvCodec for BincodeCodec<K, V>
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    type Key = K;
    type Value = V;

    fn encode_key(&self, key: &K, buf: &mut Vec<u8>) -> Result<()> {
        bincode::serialize_into(buf, key)?;
        Ok(())
    }

    fn decode_key(&self, bytes: &[u8]) -> Result<K> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn encode_value(&self, value: &V, buf: &mut Vec<u8>) -> Result<()> {
        bincode::serialize_into(buf, value)?;
        Ok(())
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<V> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Identity codec for callers that already hold byte pairs.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawCodec;

impl KvCodec for RawCodec {
    type Key = Vec<u8>;
    type Value = Vec<u8>;

    fn encode_key(&self, key: &Vec<u8>, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(key);
        Ok(())
    }

    fn decode_key(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }

    fn encode_value(&self, value: &Vec<u8>, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(value);
        Ok(())
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// Total order over encoded keys. The same instance is used for sorting,
/// merging and the zig-zag comparisons.
pub trait KeyComparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

impl<F> KeyComparator for F
where
    F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self(a, b)
    }
}

/// Lexicographic byte order.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytewiseComparator;

impl KeyComparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Decodes both keys with the codec and compares them with `Ord`.
///
/// Keys that fail to decode fall back to byte order; such input already
/// violates the comparator's totality precondition.
pub struct DecodedKeyComparator<C> {
    codec: C,
}

impl<C> DecodedKeyComparator<C> {
    pub fn new(codec: C) -> Self {
        Self { codec }
    }
}

impl<C> KeyComparator for DecodedKeyComparator<C>
where
    C: KvCodec,
    C::Key: Ord,
{
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match (self.codec.decode_key(a), self.codec.decode_key(b)) {
            (Ok(ka), Ok(kb)) => ka.cmp(&kb),
            _ => {
                log_debug!("key decode failed during comparison, using byte order");
                a.cmp(b)
            }
        }
    }
}
