//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// How long a ringing call waits for an answer
    pub ring_timeout_ms: u64,
    /// How long peer negotiation may take before the attempt fails
    pub negotiation_timeout_ms: u64,
    /// Interval for the degraded-mode store poll
    pub fallback_poll_interval_ms: u64,
    /// Interval for the in-call network quality sample
    pub quality_sample_interval_ms: u64,
    /// How long a deep-link auto-accept waits for the machine to observe
    /// the incoming call
    pub auto_accept_wait_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout_ms: 30_000,
            negotiation_timeout_ms: 15_000,
            fallback_poll_interval_ms: 5_000,
            quality_sample_interval_ms: 2_000,
            auto_accept_wait_ms: 10_000,
        }
    }
}

impl CallConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_millis(self.ring_timeout_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn fallback_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fallback_poll_interval_ms)
    }

    pub fn quality_sample_interval(&self) -> Duration {
        Duration::from_millis(self.quality_sample_interval_ms)
    }

    pub fn auto_accept_wait(&self) -> Duration {
        Duration::from_millis(self.auto_accept_wait_ms)
    }
}
