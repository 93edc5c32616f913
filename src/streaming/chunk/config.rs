//! Key/value records carried by config TOCs

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct ConfigEntry {
    key: String,
    value: String,
}

/// Ordered string entries; keys are unique.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChunk {
    entries: Vec<ConfigEntry>,
}

impl ConfigChunk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, keeping its original position if it already exists.
    pub fn set_entry(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|e| e.key == key) {
            Some(entry) => entry.value = value,
            None => self.entries.push(ConfigEntry { key, value }),
        }
    }

    pub fn entry(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|e| (e.key.as_str(), e.value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn resident_size(&self) -> usize {
        self.entries.iter().map(|e| e.key.len() + e.value.len()).sum()
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        serde_json::to_writer(out, self).map_err(|e| Error::Payload(e.to_string()))
    }

    pub(crate) fn read(body: &[u8], offset: u64) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| Error::corrupt(offset, format!("config payload: {}", e)))
    }
}
