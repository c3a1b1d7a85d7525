//! # Data Model
//!
//! Buckets, their compact cache indices, and the wire handles that stand in for
//! a full bucket on high-cardinality records.

use crate::mapfile::MapKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh3::xxh3_64;

/// Cache indices are confined to 31 bits so they stay non-negative when carried
/// by producers that only have signed 32-bit integers.
pub const CACHE_INDEX_MASK: u32 = 0x7fff_ffff;

/// Compact, content-derived identifier for a bucket definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheIndex(pub u32);

impl CacheIndex {
    /// Derive the index from the bucket's identifying content. The same name
    /// yields the same index in every process and every run.
    pub fn for_name(name: &str) -> Self {
        Self(xxh3_64(name.as_bytes()) as u32 & CACHE_INDEX_MASK)
    }
}

impl fmt::Display for CacheIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

impl MapKey for CacheIndex {
    fn to_key_bytes(&self) -> Vec<u8> {
        self.0.to_key_bytes()
    }

    fn from_key_bytes(bytes: &[u8]) -> Option<Self> {
        u32::from_key_bytes(bytes).map(CacheIndex)
    }
}

/// Hash over a bucket's name and value.
pub fn content_hash(name: &str, value: Option<&str>) -> u64 {
    let value = value.unwrap_or("");
    let mut buf = Vec::with_capacity(name.len() + 1 + value.len());
    buf.extend_from_slice(name.as_bytes());
    buf.push(0);
    buf.extend_from_slice(value.as_bytes());
    xxh3_64(&buf)
}

/// The persisted part of a bucket. The transient value is never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketDefinition {
    pub cache_index: CacheIndex,
    pub name: String,
    pub content_hash: u64,
}

impl BucketDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            cache_index: CacheIndex::for_name(&name),
            content_hash: content_hash(&name, None),
            name,
        }
    }
}

/// A named classification unit plus the value it carries for one use.
///
/// `value` can only change through [`Bucket::set_value`] or
/// [`Bucket::with_value`], both of which recompute the content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    cache_index: CacheIndex,
    name: String,
    value: Option<String>,
    content_hash: u64,
}

impl Bucket {
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_definition(&BucketDefinition::new(name))
    }

    /// Build a bucket carrying `value` from a stored definition.
    pub fn from_definition(definition: &BucketDefinition) -> Self {
        Self {
            cache_index: definition.cache_index,
            name: definition.name.clone(),
            value: None,
            content_hash: content_hash(&definition.name, None),
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.set_value(value);
        self
    }

    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = Some(value.into());
        self.content_hash = content_hash(&self.name, self.value.as_deref());
    }

    pub fn cache_index(&self) -> CacheIndex {
        self.cache_index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn content_hash(&self) -> u64 {
        self.content_hash
    }

    pub fn definition(&self) -> BucketDefinition {
        BucketDefinition {
            cache_index: self.cache_index,
            name: self.name.clone(),
            content_hash: content_hash(&self.name, None),
        }
    }

    /// Strip the bucket down to the handle producers attach to records.
    pub fn to_reference(&self) -> BucketReference {
        BucketReference {
            cache_index: self.cache_index,
            value: self.value.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}({}={})", self.cache_index, self.name, value),
            None => write!(f, "{}({})", self.cache_index, self.name),
        }
    }
}

/// Wire-cheap stand-in for a full bucket: the cache index plus the value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketReference {
    pub cache_index: CacheIndex,
    pub value: String,
}

impl BucketReference {
    pub fn new(cache_index: CacheIndex, value: impl Into<String>) -> Self {
        Self {
            cache_index,
            value: value.into(),
        }
    }
}

impl fmt::Display for BucketReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.cache_index, self.value)
    }
}
