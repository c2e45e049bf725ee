//! Session and transfer configuration

use crate::header::ProtocolVersion;
use std::time::Duration;

/// Largest control message the reassembly pool will buffer
pub const DEFAULT_MAX_CONTROL_MESSAGE: usize = 64 * 1024;

/// Message session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Negotiated wire format
    pub version: ProtocolVersion,

    /// Payload ceiling over the relay
    pub relay_max_payload: usize,

    /// Payload ceiling over a direct socket
    pub direct_max_payload: usize,

    /// Envelopes buffered while no transport can carry them
    pub outbox_capacity: usize,

    /// How long a producer sleeps when the outbox is full
    pub producer_pause: Duration,

    /// Acknowledge inbound messages automatically
    pub auto_acknowledge: bool,

    /// Largest control message accepted for reassembly
    pub max_control_message: usize,

    /// Seed for the session's id generator (random if unset)
    pub id_seed: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::V1,
            relay_max_payload: crate::RELAY_MAX_PAYLOAD,
            direct_max_payload: crate::DIRECT_MAX_PAYLOAD,
            outbox_capacity: 256,
            producer_pause: Duration::from_millis(50),
            auto_acknowledge: true,
            max_control_message: DEFAULT_MAX_CONTROL_MESSAGE,
            id_seed: None,
        }
    }
}

impl SessionConfig {
    /// Default configuration for the given wire format
    #[must_use]
    pub fn for_version(version: ProtocolVersion) -> Self {
        Self {
            version,
            ..Self::default()
        }
    }

    /// Fix the id generator seed
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.id_seed = Some(seed);
        self
    }
}

/// Transfer session configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Delay between outbound data envelopes
    pub pacing: Duration,

    /// Drop the sink once the transfer finishes
    pub auto_close: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            pacing: Duration::from_millis(5),
            auto_close: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.relay_max_payload, 1202);
        assert_eq!(config.direct_max_payload, 1352);
        assert!(config.auto_acknowledge);
        assert!(config.id_seed.is_none());

        let v2 = SessionConfig::for_version(ProtocolVersion::V2).with_seed(9);
        assert_eq!(v2.version, ProtocolVersion::V2);
        assert_eq!(v2.id_seed, Some(9));
    }
}
