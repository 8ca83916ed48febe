//! Event fan-out to registered connections.
//!
//! The [`BroadcastDispatcher`] takes an already persisted record, serializes
//! it once, and hands the identical bytes to every open connection of the
//! target [`Audience`]. Delivery is best effort and at most once per socket:
//!
//! - an open connection gets the frame queued; if queueing fails the
//!   connection is terminated and evicted, and the pass continues
//! - a connection that is no longer open is evicted without delivery
//! - nothing is queued for users that are not connected, and nothing is retried
//!
//! Socket writes happen in each connection's writer task, so one slow peer
//! never holds up the others.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use parley_server::broadcast::BroadcastDispatcher;
//! use parley_server::connection::Connection;
//! use parley_server::registry::ConnectionRegistry;
//! use parley_server::types::Identity;
//! use serde_json::json;
//!
//! let registry = Arc::new(ConnectionRegistry::new());
//! let dispatcher = BroadcastDispatcher::new();
//! dispatcher.bind(registry.clone());
//!
//! let (conn, mut rx) = Connection::channel(Identity::new(1, Some("a")), 8);
//! registry.register(conn);
//!
//! let report = dispatcher.broadcast_to_user(1, &json!({"id": 42}));
//! assert_eq!(report.delivered, 1);
//! assert!(rx.try_recv().is_ok());
//! ```

use std::sync::{Arc, PoisonError, RwLock};

use axum::extract::ws::Utf8Bytes;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, trace};

use crate::connection::Connection;
use crate::registry::ConnectionRegistry;
use crate::types::{DeliveryReport, DisconnectReason, UserId};

/// Errors that prevent a broadcast pass from starting.
///
/// Individual delivery failures are never errors; they are counted in the
/// [`DeliveryReport`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    /// The hub has not been started, or has been shut down.
    #[error("broadcast attempted while the hub is not running")]
    NotStarted,

    /// The event could not be serialized.
    #[error("failed to serialize event: {0}")]
    Serialization(String),
}

/// Which connections a broadcast targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Every registered connection.
    All,
    /// Every device of one user.
    User(UserId),
}

impl Audience {
    fn label(&self) -> String {
        match self {
            Self::All => "all".to_string(),
            Self::User(user_id) => format!("user:{user_id}"),
        }
    }
}

/// Fans events out to the connections of a bound registry.
///
/// The dispatcher starts unbound; [`bind`](Self::bind) is called when the
/// hub starts and [`unbind`](Self::unbind) when it shuts down. Broadcasting
/// while unbound logs an error and delivers to nobody.
#[derive(Debug, Default)]
pub struct BroadcastDispatcher {
    registry: RwLock<Option<Arc<ConnectionRegistry>>>,
}

impl BroadcastDispatcher {
    /// Creates an unbound dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the dispatcher to the registry it delivers through.
    pub fn bind(&self, registry: Arc<ConnectionRegistry>) {
        *self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(registry);
    }

    /// Clears the binding. Returns `true` if the dispatcher was bound.
    pub fn unbind(&self) -> bool {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    pub fn is_bound(&self) -> bool {
        self.bound_registry().is_some()
    }

    fn bound_registry(&self) -> Option<Arc<ConnectionRegistry>> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Delivers `event` to every open connection.
    ///
    /// Never fails; a broadcast while the hub is not running is logged and
    /// yields an empty report.
    pub fn broadcast<T>(&self, event: &T) -> DeliveryReport
    where
        T: Serialize + ?Sized,
    {
        self.dispatch_logged(Audience::All, event)
    }

    /// Delivers `event` to every open connection of `user_id`.
    pub fn broadcast_to_user<T>(&self, user_id: UserId, event: &T) -> DeliveryReport
    where
        T: Serialize + ?Sized,
    {
        self.dispatch_logged(Audience::User(user_id), event)
    }

    fn dispatch_logged<T>(&self, audience: Audience, event: &T) -> DeliveryReport
    where
        T: Serialize + ?Sized,
    {
        match self.dispatch(audience, event) {
            Ok(report) => report,
            Err(BroadcastError::NotStarted) => {
                error!(
                    audience = %audience.label(),
                    "Broadcast attempted before the hub was started, event dropped"
                );
                DeliveryReport::default()
            }
            Err(err) => {
                error!(audience = %audience.label(), error = %err, "Broadcast failed");
                DeliveryReport::default()
            }
        }
    }

    /// Delivers `event` to `audience`, reporting why nothing was sent.
    ///
    /// # Errors
    ///
    /// [`BroadcastError::NotStarted`] if the dispatcher is unbound,
    /// [`BroadcastError::Serialization`] if `event` cannot be serialized.
    pub fn dispatch<T>(&self, audience: Audience, event: &T) -> Result<DeliveryReport, BroadcastError>
    where
        T: Serialize + ?Sized,
    {
        let registry = self.bound_registry().ok_or(BroadcastError::NotStarted)?;

        let json = serde_json::to_string(event)
            .map_err(|err| BroadcastError::Serialization(err.to_string()))?;
        let payload = Utf8Bytes::from(json);

        let targets = match audience {
            Audience::All => registry.snapshot(),
            Audience::User(user_id) => registry.snapshot_user(user_id),
        };

        let report = deliver(&registry, &targets, &payload);
        debug!(
            audience = %audience.label(),
            attempted = report.attempted,
            delivered = report.delivered,
            failed = report.failed,
            reaped = report.reaped,
            "Broadcast complete"
        );
        Ok(report)
    }
}

/// Hands `payload` to each target, evicting the ones that cannot take it.
fn deliver(
    registry: &ConnectionRegistry,
    targets: &[Arc<Connection>],
    payload: &Utf8Bytes,
) -> DeliveryReport {
    let mut report = DeliveryReport::default();

    for conn in targets {
        if !conn.is_open() {
            trace!(
                connection_id = %conn.id(),
                state = ?conn.state(),
                reason = %DisconnectReason::Stale,
                "Reaping connection that is no longer open"
            );
            registry.remove(conn);
            report.reaped += 1;
            continue;
        }

        report.attempted += 1;
        match conn.send_text(payload.clone()) {
            Ok(()) => report.delivered += 1,
            Err(err) => {
                debug!(
                    user_id = conn.user_id(),
                    device_id = %conn.device_id(),
                    connection_id = %conn.id(),
                    reason = %DisconnectReason::DeliveryFailure,
                    error = %err,
                    "Delivery failed, evicting connection"
                );
                conn.terminate();
                registry.remove(conn);
                report.failed += 1;
            }
        }
    }

    report
}
