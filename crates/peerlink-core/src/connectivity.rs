//! Connectivity classification and connection-direction heuristic.
//!
//! Each peer advertises how reachable it is. The side that can accept
//! inbound connections listens, the other connects; when neither can the
//! transfer stays on the relay.

use std::fmt;
use std::str::FromStr;

/// Advertised reachability of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityType {
    /// Public address, inbound connections accepted
    Direct,
    /// Public address, filtering unknown
    UnknownConnect,
    /// NAT filtering on remote address only
    IpRestrictNat,
    /// NAT filtering on remote address and port
    PortRestrictNat,
    /// Per-destination mapping NAT
    SymmetricNat,
    /// Inbound connections blocked
    Firewall,
    /// Behind a NAT of unknown kind
    UnknownNat,
}

impl ConnectivityType {
    const NAMES: [(Self, &'static str); 7] = [
        (Self::Direct, "Direct-Connect"),
        (Self::UnknownConnect, "Unknown-Connect"),
        (Self::IpRestrictNat, "IP-Restrict-NAT"),
        (Self::PortRestrictNat, "Port-Restrict-NAT"),
        (Self::SymmetricNat, "Symmetric-NAT"),
        (Self::Firewall, "Firewall"),
        (Self::UnknownNat, "Unknown-NAT"),
    ];

    /// Whether the peer accepts inbound connections
    #[must_use]
    pub fn accepts_inbound(self) -> bool {
        matches!(self, Self::Direct | Self::UnknownConnect)
    }

    /// Whether a listener behind this NAT may still be reached
    fn may_accept_inbound(self) -> bool {
        matches!(self, Self::IpRestrictNat | Self::UnknownNat)
    }

    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        Self::NAMES
            .iter()
            .find(|(kind, _)| *kind == self)
            .map_or("Unknown-NAT", |(_, name)| name)
    }
}

impl fmt::Display for ConnectivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognised connectivity type name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown connectivity type: {0}")]
pub struct UnknownConnectivity(pub String);

impl FromStr for ConnectivityType {
    type Err = UnknownConnectivity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::NAMES
            .iter()
            .find(|(_, name)| name.eq_ignore_ascii_case(s.trim()))
            .map(|(kind, _)| *kind)
            .ok_or_else(|| UnknownConnectivity(s.to_string()))
    }
}

/// What the local side should do about a direct connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    /// Open a listener and advertise it
    Listen,
    /// Connect to the peer's listener
    Connect,
    /// Neither side is reachable; stay on the relay
    RelayOnly,
}

/// Decide the local role from both sides' connectivity
#[must_use]
pub fn decide_direction(local: ConnectivityType, remote: ConnectivityType) -> ConnectionDirection {
    if local.accepts_inbound() {
        ConnectionDirection::Listen
    } else if remote.accepts_inbound() {
        ConnectionDirection::Connect
    } else if local.may_accept_inbound() {
        ConnectionDirection::Listen
    } else if remote.may_accept_inbound() {
        ConnectionDirection::Connect
    } else {
        ConnectionDirection::RelayOnly
    }
}
