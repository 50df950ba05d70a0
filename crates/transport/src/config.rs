//! Transport timing configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and sizing knobs for the bulk transport
///
/// Defaults match the device's reported 64-byte max packet size and the
/// deadlines the driver layer expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum bytes requested per read iteration
    pub read_chunk_size: usize,
    /// Per-chunk read deadline on the generic library backend (ms)
    pub generic_read_timeout_ms: u32,
    /// Per-chunk read deadline on the native backend (ms)
    pub native_read_timeout_ms: u32,
    /// Pipe transfer timeout policy applied to native pipes (ms)
    pub pipe_timeout_ms: u32,
    /// How long to wait for an aborted native transfer to be acknowledged (ms)
    pub cancel_grace_ms: u32,
    /// Pipe timeout used while draining stale data during flush (ms)
    pub flush_timeout_ms: u32,
    /// Upper bound on drain reads during flush
    pub flush_max_reads: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 64,
            generic_read_timeout_ms: 500,
            native_read_timeout_ms: 1000,
            pipe_timeout_ms: 1000,
            cancel_grace_ms: 100,
            flush_timeout_ms: 50,
            flush_max_reads: 256,
        }
    }
}

impl TransportConfig {
    pub fn generic_read_timeout(&self) -> Duration {
        Duration::from_millis(self.generic_read_timeout_ms as u64)
    }

    pub fn native_read_timeout(&self) -> Duration {
        Duration::from_millis(self.native_read_timeout_ms as u64)
    }

    pub fn pipe_timeout(&self) -> Duration {
        Duration::from_millis(self.pipe_timeout_ms as u64)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms as u64)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms as u64)
    }

    /// Chunk size actually used, never zero
    pub fn chunk_size(&self) -> usize {
        self.read_chunk_size.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.read_chunk_size, 64);
        assert_eq!(config.generic_read_timeout(), Duration::from_millis(500));
        assert_eq!(config.native_read_timeout(), Duration::from_secs(1));
        assert_eq!(config.cancel_grace(), Duration::from_millis(100));
        assert_eq!(config.flush_timeout(), Duration::from_millis(50));
    }

    #[test]
    fn test_zero_chunk_size_clamped() {
        let config = TransportConfig {
            read_chunk_size: 0,
            ..Default::default()
        };
        assert_eq!(config.chunk_size(), 1);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: TransportConfig = toml::from_str("generic_read_timeout_ms = 250").unwrap();
        assert_eq!(config.generic_read_timeout_ms, 250);
        assert_eq!(config.read_chunk_size, 64);
        assert_eq!(config.pipe_timeout_ms, 1000);
    }
}
