//! Engine configuration.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sync engine configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Stanzas per catch-up fetch (and per emitted batch in batch mode).
    /// Default: 50
    pub batch_size: usize,

    /// Max stanzas buffered per merge input before it stops being polled.
    /// Default: 256
    pub merge_buffer: usize,

    /// Capacity of the live push broadcast. Readers lagging further than this
    /// fall back to catch-up.
    /// Default: 1024
    pub live_capacity: usize,

    /// First delay before retrying a failed catch-up fetch.
    /// Default: 1000ms
    pub retry_delay_ms: u64,

    /// Upper bound for the doubling retry delay.
    /// Default: 30000ms
    pub max_retry_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            merge_buffer: 256,
            live_capacity: 1024,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 30_000,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON config; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms.max(self.retry_delay_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json(r#"{"batch_size": 10}"#).unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.merge_buffer, EngineConfig::default().merge_buffer);
    }

    #[test]
    fn test_max_retry_never_below_first() {
        let config = EngineConfig {
            retry_delay_ms: 500,
            max_retry_delay_ms: 100,
            ..Default::default()
        };
        assert_eq!(config.max_retry_delay(), Duration::from_millis(500));
    }
}
