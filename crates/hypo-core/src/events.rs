//! Connection-state machine and event types exposed to observers.

use serde::{Deserialize, Serialize};

use crate::device::DiscoveredPeer;
use crate::ids::DeviceId;

/// Global connection state as seen by the UI.
///
/// Only cloud transport transitions move this state; LAN connections are
/// tracked per peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Idle,
    ConnectingLan,
    ConnectedLan,
    ConnectingCloud,
    ConnectedCloud,
    Disconnected,
    Error(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::ConnectedLan | ConnectionState::ConnectedCloud
        )
    }
}

/// Which path carried an envelope to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Lan,
    Cloud,
}

/// Telemetry record for a TLS pinning mismatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinningReport {
    pub environment: String,
    pub host: String,
    pub message: String,
}

/// Point-in-time metrics snapshot of one transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMetrics {
    /// Duration of the most recent successful upgrade handshake.
    pub handshake_ms: Option<u64>,
    /// Envelopes sent whose counterpart has not yet arrived.
    pub pending_round_trips: usize,
    /// Most recently observed round-trip duration.
    pub last_round_trip_ms: Option<u64>,
    pub pinning_failures: u64,
}

/// Events published by the transport manager to interested observers.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    PeerDiscovered(DiscoveredPeer),
    PeerResolved(DiscoveredPeer),
    PeerLost(String),
    DeviceOnline { device_id: DeviceId, online: bool },
    PairingCompleted { device_id: DeviceId, name: String },
    ConnectionStateChanged(ConnectionState),
    PinningFailure(PinningReport),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_states() {
        assert!(ConnectionState::ConnectedLan.is_connected());
        assert!(ConnectionState::ConnectedCloud.is_connected());
        assert!(!ConnectionState::ConnectingCloud.is_connected());
        assert!(!ConnectionState::Error("x".into()).is_connected());
    }

    #[test]
    fn test_transport_kind_serialization() {
        assert_eq!(serde_json::to_string(&TransportKind::Lan).unwrap(), "\"lan\"");
        assert_eq!(
            serde_json::to_string(&TransportKind::Cloud).unwrap(),
            "\"cloud\""
        );
    }
}
