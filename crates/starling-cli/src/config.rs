//! Configuration system for the Starling CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroizing;

use starling_core::{NodeConfig, NodeId, StreamDedupPolicy};
use starling_crypto::FrameKey;
use starling_crypto::hash::derive_frame_key;
use starling_transport::TransportConfig;

/// Starling configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node identity
    #[serde(default)]
    pub node: NodeSection,
    /// Addresses and shared key
    #[serde(default)]
    pub network: NetworkSection,
    /// Routing engine tuning
    #[serde(default)]
    pub routing: RoutingSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Node identity
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeSection {
    /// Fixed node id (hex, dashes allowed); random when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Label used in log lines
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Addresses and shared key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    /// Addresses to accept mesh connections on
    #[serde(default)]
    pub listen: Vec<String>,
    /// Peers to dial at startup
    #[serde(default)]
    pub connect: Vec<String>,
    /// File holding the shared passphrase
    #[serde(skip_serializing_if = "Option::is_none")]
    pub psk_file: Option<PathBuf>,
    /// Inline shared passphrase; `psk_file` wins when both are set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    /// TCP keepalive idle time in seconds, 0 to disable
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Dial attempts per peer while failures are transient
    #[serde(default = "default_dial_attempts")]
    pub dial_attempts: u32,
}

/// Routing engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingSection {
    /// Dedup retention window in seconds
    #[serde(default = "default_message_duration_secs")]
    pub message_duration_secs: u64,
    /// Circuit chunk size in bytes
    #[serde(default = "default_stream_chunk_size")]
    pub stream_chunk_size: usize,
    /// Concurrent inbound dispatch slots
    #[serde(default = "default_max_inflight_dispatch")]
    pub max_inflight_dispatch: usize,
    /// Per-connection outbound queue depth
    #[serde(default = "default_outbound_queue_depth")]
    pub outbound_queue_depth: usize,
    /// "bypass" or "relay-only"
    #[serde(default = "default_stream_dedup")]
    pub stream_dedup: String,
    /// Dedup sweep period in seconds
    #[serde(default = "default_dedup_sweep_secs")]
    pub dedup_sweep_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_keepalive_secs() -> u64 {
    30
}

fn default_dial_attempts() -> u32 {
    3
}

fn default_message_duration_secs() -> u64 {
    60
}

fn default_stream_chunk_size() -> usize {
    65535
}

fn default_max_inflight_dispatch() -> usize {
    256
}

fn default_outbound_queue_depth() -> usize {
    1024
}

fn default_stream_dedup() -> String {
    "bypass".to_string()
}

fn default_dedup_sweep_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            listen: Vec::new(),
            connect: Vec::new(),
            psk_file: None,
            passphrase: None,
            keepalive_secs: default_keepalive_secs(),
            dial_attempts: default_dial_attempts(),
        }
    }
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            message_duration_secs: default_message_duration_secs(),
            stream_chunk_size: default_stream_chunk_size(),
            max_inflight_dispatch: default_max_inflight_dispatch(),
            outbound_queue_depth: default_outbound_queue_depth(),
            stream_dedup: default_stream_dedup(),
            dedup_sweep_secs: default_dedup_sweep_secs(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("starling/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(id) = &self.node.id {
            id.parse::<NodeId>()
                .map_err(|e| anyhow::anyhow!("Invalid node id '{}': {}", id, e))?;
        }

        for addr in &self.network.listen {
            validate_host_port(addr, "Listen address")?;
        }
        for addr in &self.network.connect {
            validate_host_port(addr, "Connect address")?;
        }

        let valid_policies = ["bypass", "relay-only"];
        if !valid_policies.contains(&self.routing.stream_dedup.as_str()) {
            anyhow::bail!(
                "Invalid stream dedup policy: {}. Must be one of: {}",
                self.routing.stream_dedup,
                valid_policies.join(", ")
            );
        }

        if self.routing.stream_chunk_size == 0 || self.routing.stream_chunk_size > 65535 {
            anyhow::bail!("Stream chunk size must be between 1 and 65535");
        }

        if self.routing.max_inflight_dispatch == 0 || self.routing.outbound_queue_depth == 0 {
            anyhow::bail!("Dispatch slots and queue depth must be non-zero");
        }

        if self.routing.message_duration_secs == 0 {
            anyhow::bail!("Message duration must be at least one second");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Fixed node id, if configured
    ///
    /// # Errors
    ///
    /// Returns an error if the configured id does not parse.
    pub fn node_id(&self) -> anyhow::Result<Option<NodeId>> {
        self.node
            .id
            .as_deref()
            .map(|id| id.parse().map_err(|e| anyhow::anyhow!("Invalid node id '{}': {}", id, e)))
            .transpose()
    }

    /// Engine configuration derived from `[routing]` and `[network]`
    #[must_use]
    pub fn node_config(&self) -> NodeConfig {
        let stream_dedup = match self.routing.stream_dedup.as_str() {
            "relay-only" => StreamDedupPolicy::RelayOnly,
            _ => StreamDedupPolicy::Bypass,
        };
        NodeConfig {
            message_duration: Duration::from_secs(self.routing.message_duration_secs),
            stream_chunk_size: self.routing.stream_chunk_size,
            max_inflight_dispatch: self.routing.max_inflight_dispatch,
            outbound_queue_depth: self.routing.outbound_queue_depth,
            stream_dedup,
            dedup_sweep_interval: Duration::from_secs(self.routing.dedup_sweep_secs.max(1)),
            dial_attempts: self.network.dial_attempts.max(1),
            transport: TransportConfig {
                keepalive_secs: self.network.keepalive_secs,
                ..TransportConfig::default()
            },
            ..NodeConfig::default()
        }
    }

    /// Frame key from the configured passphrase, or `None` for unsealed
    /// frames
    ///
    /// # Errors
    ///
    /// Returns an error if the passphrase file cannot be read or is empty.
    pub fn frame_key(&self) -> anyhow::Result<Option<FrameKey>> {
        let passphrase = match (&self.network.psk_file, &self.network.passphrase) {
            (Some(path), _) => Zeroizing::new(
                fs::read_to_string(path)
                    .map_err(|e| anyhow::anyhow!("Cannot read {}: {}", path.display(), e))?
                    .trim()
                    .to_string(),
            ),
            (None, Some(inline)) => Zeroizing::new(inline.clone()),
            (None, None) => return Ok(None),
        };
        Ok(Some(derive_frame_key(passphrase.as_bytes())?))
    }
}

/// Validate host:port format
fn validate_host_port(addr: &str, name: &str) -> anyhow::Result<()> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        anyhow::bail!(
            "{} '{}' missing port (expected format: host:port)",
            name,
            addr
        );
    };

    port.parse::<u16>()
        .map_err(|_| anyhow::anyhow!("{} '{}' has invalid port: {}", name, addr, port))?;

    if host.is_empty() {
        anyhow::bail!("{} '{}' has empty hostname", name, addr);
    }

    if host.contains('/') || host.contains('\\') {
        anyhow::bail!("{} '{}' contains invalid characters", name, addr);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.network.listen.is_empty());
        assert_eq!(config.routing.stream_chunk_size, 65535);
        assert_eq!(config.routing.stream_dedup, "bypass");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.routing.stream_dedup = "sometimes".to_string();
        assert!(config.validate().is_err());

        config.routing.stream_dedup = "relay-only".to_string();
        config.routing.stream_chunk_size = 70000;
        assert!(config.validate().is_err());

        config.routing.stream_chunk_size = 4096;
        config.network.connect = vec!["10.0.0.1".to_string()];
        assert!(config.validate().is_err());

        config.network.connect = vec!["10.0.0.1:4444".to_string()];
        assert!(config.validate().is_ok());

        config.node.id = Some("not-hex".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_node_config_mapping() {
        let mut config = Config::default();
        config.routing.stream_dedup = "relay-only".to_string();
        config.routing.message_duration_secs = 5;
        config.network.keepalive_secs = 0;
        config.network.dial_attempts = 0;

        let node = config.node_config();
        assert_eq!(node.dial_attempts, 1);
        assert_eq!(node.stream_dedup, StreamDedupPolicy::RelayOnly);
        assert_eq!(node.message_duration, Duration::from_secs(5));
        assert_eq!(node.transport.keepalive_secs, 0);
    }

    #[test]
    fn test_frame_key_sources() {
        let dir = tempfile::tempdir().unwrap();
        let psk = dir.path().join("psk");
        fs::write(&psk, "correct horse\n").unwrap();

        let mut config = Config::default();
        assert!(config.frame_key().unwrap().is_none());

        config.network.passphrase = Some("correct horse".to_string());
        let inline = config.frame_key().unwrap().unwrap();

        config.network.psk_file = Some(psk);
        let from_file = config.frame_key().unwrap().unwrap();
        assert_eq!(inline.as_bytes(), from_file.as_bytes());
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.network.listen = vec!["0.0.0.0:4444".to_string()];
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.network.listen, config.network.listen);
        assert_eq!(loaded.routing.outbound_queue_depth, 1024);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str("[network]\nconnect = [\"h:1\"]\n").unwrap();
        assert_eq!(config.network.connect, vec!["h:1".to_string()]);
        assert_eq!(config.network.keepalive_secs, 30);
        assert_eq!(config.logging.level, "info");
    }
}
