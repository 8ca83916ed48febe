//! Shared types for the Parley server.
//!
//! This module defines the data structures that cross module boundaries: the
//! authenticated identity of a socket, the diagnostic views of the registry,
//! per-broadcast delivery counters, and the reasons a connection leaves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Device identifier used when the client does not supply one.
pub const DEFAULT_DEVICE_ID: &str = "default";

/// Numeric user identifier issued by the token verifier.
pub type UserId = i64;

/// The authenticated identity of one connection: its device slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: UserId,
    pub device_id: String,
}

impl Identity {
    /// Builds an identity, falling back to [`DEFAULT_DEVICE_ID`] for a blank device.
    pub fn new(user_id: UserId, device_id: Option<&str>) -> Self {
        let device_id = device_id
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or(DEFAULT_DEVICE_ID);
        Self {
            user_id,
            device_id: device_id.to_string(),
        }
    }
}

/// Lifecycle state of a connection's transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Why a connection left the registry.
///
/// None of these are server errors. They exist so every eviction is logged
/// with a consistent, filterable `reason` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Another socket registered for the same device slot.
    Superseded,
    /// No pong arrived within a full heartbeat interval.
    HeartbeatTimeout,
    /// Queueing a ping or a broadcast frame failed.
    DeliveryFailure,
    /// The connection was found not open during a broadcast pass.
    Stale,
    /// The peer sent a close frame or the stream ended.
    ClientClosed,
    /// Reading from the socket failed.
    TransportError,
    /// The hub is shutting down.
    ServerShutdown,
}

impl DisconnectReason {
    /// Stable label used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Superseded => "superseded",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::DeliveryFailure => "delivery_failure",
            Self::Stale => "stale",
            Self::ClientClosed => "client_closed",
            Self::TransportError => "transport_error",
            Self::ServerShutdown => "server_shutdown",
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic view of one registered connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub user_id: UserId,
    pub device_id: String,
    pub connection_id: Uuid,
    pub is_alive: bool,
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
}

/// Read-only summary of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub user_count: usize,
    pub connections: Vec<ConnectionInfo>,
}

/// Counters for a single broadcast pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    /// Open connections a delivery was attempted to.
    pub attempted: usize,
    /// Deliveries accepted by the connection's outbound queue.
    pub delivered: usize,
    /// Deliveries that failed; those connections were evicted.
    pub failed: usize,
    /// Connections skipped and evicted because they were no longer open.
    pub reaped: usize,
}

impl DeliveryReport {
    /// Returns `true` when the pass touched no connection at all.
    pub fn is_empty(&self) -> bool {
        self.attempted == 0 && self.reaped == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_defaults_device_when_absent() {
        let identity = Identity::new(7, None);
        assert_eq!(identity.device_id, DEFAULT_DEVICE_ID);
    }

    #[test]
    fn identity_defaults_device_when_blank() {
        let identity = Identity::new(7, Some("  "));
        assert_eq!(identity.device_id, DEFAULT_DEVICE_ID);
    }

    #[test]
    fn identity_keeps_supplied_device() {
        let identity = Identity::new(7, Some("phone"));
        assert_eq!(identity.user_id, 7);
        assert_eq!(identity.device_id, "phone");
    }

    #[test]
    fn connection_state_round_trips_through_u8() {
        for state in [
            ConnectionState::Connecting,
            ConnectionState::Open,
            ConnectionState::Closing,
            ConnectionState::Closed,
        ] {
            assert_eq!(ConnectionState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn registry_stats_serializes_camel_case() {
        let stats = RegistryStats {
            user_count: 1,
            connections: vec![ConnectionInfo {
                user_id: 1,
                device_id: "a".to_string(),
                connection_id: Uuid::nil(),
                is_alive: true,
                state: ConnectionState::Open,
                connected_at: DateTime::<Utc>::UNIX_EPOCH,
            }],
        };

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["userCount"], 1);
        assert_eq!(json["connections"][0]["userId"], 1);
        assert_eq!(json["connections"][0]["deviceId"], "a");
        assert_eq!(json["connections"][0]["isAlive"], true);
        assert_eq!(json["connections"][0]["state"], "open");
        assert!(json["connections"][0]["connectionId"].is_string());
    }

    #[test]
    fn delivery_report_is_empty_only_without_any_work() {
        assert!(DeliveryReport::default().is_empty());
        let report = DeliveryReport {
            reaped: 1,
            ..Default::default()
        };
        assert!(!report.is_empty());
    }
}
