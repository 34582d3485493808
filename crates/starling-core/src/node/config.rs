//! Node configuration

use std::time::Duration;

use crate::{DEFAULT_MESSAGE_DURATION, MAX_STREAM_CHUNK};

/// How circuit messages interact with the dedup tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamDedupPolicy {
    /// Circuit messages never consult the tracker
    #[default]
    Bypass,

    /// Circuit messages being relayed for another node are deduplicated;
    /// circuit messages addressed to this node are not
    RelayOnly,
}

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Dedup retention for messages with no live arrival connection
    pub message_duration: Duration,

    /// Upper bound on circuit chunk size (clamped to 65535)
    pub stream_chunk_size: usize,

    /// Maximum inbound messages being dispatched at once
    pub max_inflight_dispatch: usize,

    /// Per-connection outbound queue depth, in envelopes
    pub outbound_queue_depth: usize,

    /// Circuit dedup policy
    pub stream_dedup: StreamDedupPolicy,

    /// Interval of the background sweep that drops expired dedup entries
    pub dedup_sweep_interval: Duration,

    /// Attempts made by `Node::connect` while dial failures are transient
    pub dial_attempts: u32,

    /// Delay before the second dial attempt, doubled after each further one
    pub dial_backoff: Duration,

    /// Socket options for TCP based connectors
    pub transport: starling_transport::TransportConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            message_duration: DEFAULT_MESSAGE_DURATION,
            stream_chunk_size: MAX_STREAM_CHUNK,
            max_inflight_dispatch: 256,
            outbound_queue_depth: 1024,
            stream_dedup: StreamDedupPolicy::Bypass,
            dedup_sweep_interval: Duration::from_secs(10),
            dial_attempts: 3,
            dial_backoff: Duration::from_millis(250),
            transport: starling_transport::TransportConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Chunk size actually used, never above [`MAX_STREAM_CHUNK`] and never zero.
    #[must_use]
    pub fn effective_chunk_size(&self) -> usize {
        self.stream_chunk_size.clamp(1, MAX_STREAM_CHUNK)
    }

    /// Delay before dial attempt `attempt` (1-based) is retried
    #[must_use]
    pub fn dial_delay(&self, attempt: u32) -> Duration {
        self.dial_backoff
            .saturating_mul(1 << attempt.saturating_sub(1).min(6))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.message_duration, Duration::from_secs(60));
        assert_eq!(config.effective_chunk_size(), 65535);
        assert_eq!(config.stream_dedup, StreamDedupPolicy::Bypass);
        assert_eq!(config.dial_attempts, 3);
    }

    #[test]
    fn test_dial_delay_doubles() {
        let config = NodeConfig {
            dial_backoff: Duration::from_millis(100),
            ..NodeConfig::default()
        };
        assert_eq!(config.dial_delay(1), Duration::from_millis(100));
        assert_eq!(config.dial_delay(2), Duration::from_millis(200));
        assert_eq!(config.dial_delay(3), Duration::from_millis(400));
        assert_eq!(config.dial_delay(40), Duration::from_millis(6400));
    }

    #[test]
    fn test_chunk_clamp() {
        let config = NodeConfig {
            stream_chunk_size: 1 << 20,
            ..NodeConfig::default()
        };
        assert_eq!(config.effective_chunk_size(), MAX_STREAM_CHUNK);

        let config = NodeConfig {
            stream_chunk_size: 0,
            ..NodeConfig::default()
        };
        assert_eq!(config.effective_chunk_size(), 1);
    }
}
