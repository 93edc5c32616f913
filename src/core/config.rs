//! Pager configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;

/// How stub heat reacts to paging events.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatConfig {
    /// Heat is clamped to this value before decay each sync.
    pub cap: f32,
    /// Added when a stub first gains interest.
    pub on_request: f32,
    /// Added when a loaded chunk is purged.
    pub on_purge: f32,
    /// Added when a chunk is instated.
    pub on_instate: f32,
}

impl Default for HeatConfig {
    fn default() -> Self {
        Self {
            cap: 5.0,
            on_request: 0.1,
            on_purge: 0.5,
            on_instate: 1.0,
        }
    }
}

/// Tuning for a container's scheduler and worker threads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagerConfig {
    /// Minimum accumulated time between two scheduler passes, in milliseconds.
    pub sync_interval_ms: u64,
    /// Candidates fetched from each TOC per scheduler pass.
    pub candidates_per_toc: usize,
    /// Pause of the deserializer thread after each chunk, in milliseconds.
    pub deserializer_pause_ms: u64,
    /// Upper bound on a single blocking wait inside `precache`, in milliseconds.
    pub precache_wait_ms: u64,
    /// Log every stub as it is deserialized.
    pub log_stub_load_status: bool,
    pub heat: HeatConfig,
}

impl Default for PagerConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 10,
            candidates_per_toc: 5,
            deserializer_pause_ms: 1,
            precache_wait_ms: 32,
            log_stub_load_status: false,
            heat: HeatConfig::default(),
        }
    }
}

impl PagerConfig {
    /// Load a config from a JSON file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("no pager config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parse a config from JSON text; absent fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.candidates_per_toc == 0 {
            return Err(Error::Config("candidates_per_toc must be at least 1".into()));
        }
        if self.heat.cap < 0.0 {
            return Err(Error::Config("heat.cap must not be negative".into()));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn deserializer_pause(&self) -> Duration {
        Duration::from_millis(self.deserializer_pause_ms)
    }

    pub fn precache_wait(&self) -> Duration {
        Duration::from_millis(self.precache_wait_ms.max(1))
    }
}
