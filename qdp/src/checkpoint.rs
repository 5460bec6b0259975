//! Key/value checkpoint state and its binary encoding.

use std::collections::BTreeMap;

use crate::error::{QdpError, Result};

/// A single checkpoint value.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub enum DictionaryValue {
    Bool(bool),
    U64(u64),
    F64(f64),
    Str(String),
    /// Opaque payload, typically a nested encoded `Dictionary`.
    Bytes(Vec<u8>),
    F64s(Vec<f64>),
}

/// Ordered, string-keyed checkpoint state.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Dictionary {
    entries: BTreeMap<String, DictionaryValue>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: DictionaryValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&DictionaryValue> {
        self.entries.get(key)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.entries.get(key) {
            Some(DictionaryValue::U64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        match self.entries.get(key) {
            Some(DictionaryValue::Bytes(v)) => Some(v),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Encode with rkyv.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|bytes| bytes.to_vec())
            .map_err(|e| QdpError::Checkpoint(format!("encode failed: {e}")))
    }

    /// Decode bytes produced by [`Dictionary::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        // Archived data must be read from an aligned buffer.
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| QdpError::Checkpoint(format!("decode failed: {e}")))
    }
}
