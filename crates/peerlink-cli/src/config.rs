//! Configuration system for the PeerLink CLI.

use peerlink_core::{ProtocolVersion, SessionConfig, TransferConfig};
use peerlink_transport::DirectConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// PeerLink CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Wire protocol settings
    #[serde(default)]
    pub protocol: ProtocolSection,
    /// Direct connection settings
    #[serde(default)]
    pub direct: DirectSection,
    /// Transfer settings
    #[serde(default)]
    pub transfer: TransferSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Wire protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolSection {
    /// Header format, `v1` or `v2`
    #[serde(default = "default_version")]
    pub version: String,
    /// Acknowledge messages automatically
    #[serde(default = "default_true")]
    pub auto_acknowledge: bool,
    /// Envelopes buffered while no transport is available
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
    /// Producer pause when the buffer is full, in milliseconds
    #[serde(default = "default_producer_pause_ms")]
    pub producer_pause_ms: u64,
}

/// Direct connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectSection {
    /// Listen address for `receive`
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Seconds to wait for the sender to connect
    #[serde(default = "default_listen_timeout_secs")]
    pub listen_timeout_secs: u64,
    /// Compare SHA-1 fingerprints of the nonce instead of the nonce itself
    #[serde(default)]
    pub hashed_nonce: bool,
    /// Insist on the greeting before the handshake
    #[serde(default)]
    pub require_greeting: bool,
    /// Disable Nagle's algorithm
    #[serde(default = "default_true")]
    pub nodelay: bool,
}

/// Transfer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSection {
    /// Delay between data envelopes in milliseconds
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,
    /// Close the output file when the transfer finishes
    #[serde(default = "default_true")]
    pub auto_close: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_version() -> String {
    "v1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_outbox_capacity() -> usize {
    256
}

fn default_producer_pause_ms() -> u64 {
    50
}

fn default_listen_addr() -> String {
    "0.0.0.0:6891".to_string()
}

fn default_listen_timeout_secs() -> u64 {
    peerlink_transport::LISTEN_TIMEOUT.as_secs()
}

fn default_pacing_ms() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            version: default_version(),
            auto_acknowledge: true,
            outbox_capacity: default_outbox_capacity(),
            producer_pause_ms: default_producer_pause_ms(),
        }
    }
}

impl Default for DirectSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_timeout_secs: default_listen_timeout_secs(),
            hashed_nonce: false,
            require_greeting: false,
            nodelay: true,
        }
    }
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            pacing_ms: default_pacing_ms(),
            auto_close: true,
        }
    }
}

impl Default for LoggingConfig {
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

    /// Default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("peerlink/config.toml")
    }

    /// Load config from the default path, or the defaults if there is none
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Negotiated header format
    ///
    /// # Errors
    ///
    /// Returns an error for anything but `v1` or `v2`.
    pub fn protocol_version(&self) -> anyhow::Result<ProtocolVersion> {
        match self.protocol.version.to_lowercase().as_str() {
            "v1" | "1" => Ok(ProtocolVersion::V1),
            "v2" | "2" => Ok(ProtocolVersion::V2),
            other => anyhow::bail!("Invalid protocol version: {other}. Must be v1 or v2"),
        }
    }

    /// Parse the listen address
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.direct.listen_addr.parse()?)
    }

    /// Message session settings
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid protocol version.
    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        Ok(SessionConfig {
            auto_acknowledge: self.protocol.auto_acknowledge,
            outbox_capacity: self.protocol.outbox_capacity,
            producer_pause: Duration::from_millis(self.protocol.producer_pause_ms),
            ..SessionConfig::for_version(self.protocol_version()?)
        })
    }

    /// Transfer session settings
    #[must_use]
    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            pacing: Duration::from_millis(self.transfer.pacing_ms),
            auto_close: self.transfer.auto_close,
        }
    }

    /// Direct socket settings
    #[must_use]
    pub fn direct_config(&self) -> DirectConfig {
        DirectConfig {
            listen_timeout: Duration::from_secs(self.direct.listen_timeout_secs),
            nodelay: self.direct.nodelay,
            ..DirectConfig::default()
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.protocol_version()?;
        self.parse_listen_addr()?;

        if self.protocol.outbox_capacity == 0 {
            anyhow::bail!("Outbox capacity must be at least 1");
        }

        if self.direct.listen_timeout_secs == 0 || self.direct.listen_timeout_secs > 3600 {
            anyhow::bail!("Listen timeout must be between 1 and 3600 seconds");
        }

        if self.transfer.pacing_ms > 1000 {
            anyhow::bail!("Pacing delay must be at most 1000 ms");
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.direct.listen_addr, "0.0.0.0:6891");
        assert_eq!(config.direct.listen_timeout_secs, 12);
        assert_eq!(config.transfer.pacing_ms, 5);
        assert_eq!(config.protocol_version().unwrap(), ProtocolVersion::V1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.protocol.version = "v3".to_string();
        assert!(config.validate().is_err());

        config.protocol.version = "V2".to_string();
        assert!(config.validate().is_ok());

        config.direct.listen_timeout_secs = 0;
        assert!(config.validate().is_err());

        config.direct.listen_timeout_secs = 12;
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str("[protocol]\nversion = \"v2\"\n").unwrap();
        assert_eq!(config.protocol_version().unwrap(), ProtocolVersion::V2);
        assert_eq!(config.protocol.outbox_capacity, 256);
        assert!(config.transfer.auto_close);

        let session = config.session_config().unwrap();
        assert_eq!(session.version, ProtocolVersion::V2);
        assert_eq!(config.transfer_config().pacing, Duration::from_millis(5));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut config = Config::default();
        config.direct.hashed_nonce = true;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert!(loaded.direct.hashed_nonce);
        assert_eq!(loaded.direct.listen_addr, config.direct.listen_addr);
    }
}
