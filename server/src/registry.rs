//! Connection registry: who is connected, on which device.
//!
//! The registry owns the mapping `user id → (device id → connection)` and is
//! the only code that mutates it. A device slot holds at most one connection;
//! registering a second one for the same slot closes and evicts the first
//! inside the same critical section (takeover).
//!
//! # Thread Safety
//!
//! One [`RwLock`] guards the two-level map. No operation awaits while holding
//! it, and everything done under the write lock is non-blocking (state
//! transitions, `try_send` of a close frame, token cancellation). Broadcast
//! iteration works on a snapshot cloned under the read lock, so concurrent
//! registrations never tear a traversal.
//!
//! A poisoned lock is recovered rather than propagated: the map only ever
//! holds fully inserted entries, so the data is still consistent.
//!
//! # Example
//!
//! ```rust
//! use parley_server::connection::Connection;
//! use parley_server::registry::{ConnectionRegistry, RegisterOutcome};
//! use parley_server::types::Identity;
//!
//! let registry = ConnectionRegistry::new();
//! let (phone, _rx) = Connection::channel(Identity::new(7, Some("phone")), 8);
//!
//! assert!(matches!(registry.register(phone.clone()), RegisterOutcome::Admitted));
//! assert_eq!(registry.stats().user_count, 1);
//!
//! assert!(registry.remove(&phone));
//! assert_eq!(registry.user_count(), 0);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use axum::extract::ws::close_code;
use tracing::{debug, info, trace};

use crate::connection::Connection;
use crate::types::{DisconnectReason, RegistryStats, UserId};

/// Close reason sent to a connection displaced by a newer one on its slot.
pub const SUPERSEDED_REASON: &str = "New connection established";

/// Result of [`ConnectionRegistry::register`].
#[derive(Debug)]
pub enum RegisterOutcome {
    /// The slot was free.
    Admitted,
    /// The slot was taken; the previous occupant was closed and evicted.
    Replaced(Arc<Connection>),
    /// The registry is shut down and no longer admits connections.
    Refused,
}

impl RegisterOutcome {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Self::Refused)
    }
}

#[derive(Debug)]
struct RegistryInner {
    users: HashMap<UserId, HashMap<String, Arc<Connection>>>,
    accepting: bool,
}

/// Thread-safe registry of live connections keyed by device slot.
#[derive(Debug)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    /// Creates an empty registry that accepts registrations.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                users: HashMap::new(),
                accepting: true,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits `connection` into its device slot.
    ///
    /// If the slot is occupied, the previous occupant is told to close
    /// (normal closure, "New connection established") and removed in the same
    /// critical section that installs the new connection, so no snapshot can
    /// see both of them, or neither.
    ///
    /// Returns [`RegisterOutcome::Refused`] after [`drain`](Self::drain), or
    /// when `connection` is already closing and does not hold its slot.
    pub fn register(&self, connection: Arc<Connection>) -> RegisterOutcome {
        let user_id = connection.user_id();
        let device_id = connection.device_id().to_string();

        let mut inner = self.write();
        if !inner.accepting {
            debug!(
                user_id,
                device_id = %device_id,
                connection_id = %connection.id(),
                "Registry not accepting, refusing connection"
            );
            return RegisterOutcome::Refused;
        }

        if !connection.mark_open() {
            let occupies_slot = inner
                .users
                .get(&user_id)
                .and_then(|devices| devices.get(&device_id))
                .is_some_and(|current| Arc::ptr_eq(current, &connection));
            if !occupies_slot {
                debug!(
                    user_id,
                    device_id = %device_id,
                    connection_id = %connection.id(),
                    state = ?connection.state(),
                    "Connection already closing, refusing registration"
                );
                return RegisterOutcome::Refused;
            }
        }

        let previous = inner
            .users
            .entry(user_id)
            .or_default()
            .insert(device_id.clone(), Arc::clone(&connection));

        match previous {
            Some(old) if !Arc::ptr_eq(&old, &connection) => {
                old.close(close_code::NORMAL, SUPERSEDED_REASON);
                drop(inner);
                info!(
                    user_id,
                    device_id = %device_id,
                    connection_id = %connection.id(),
                    previous_connection_id = %old.id(),
                    reason = %DisconnectReason::Superseded,
                    "Device slot taken over"
                );
                RegisterOutcome::Replaced(old)
            }
            _ => {
                drop(inner);
                debug!(
                    user_id,
                    device_id = %device_id,
                    connection_id = %connection.id(),
                    "Connection registered"
                );
                RegisterOutcome::Admitted
            }
        }
    }

    /// Removes `connection` if, and only if, it still occupies its slot.
    ///
    /// A stale reference (already superseded) never removes the newer
    /// occupant. Removing a user's last device drops the user entry. A
    /// removed connection is released, which stops its heartbeat and read
    /// loops. Returns `true` if something was removed.
    pub fn remove(&self, connection: &Arc<Connection>) -> bool {
        let user_id = connection.user_id();

        let mut inner = self.write();
        let Some(devices) = inner.users.get_mut(&user_id) else {
            return false;
        };

        let occupies_slot = devices
            .get(connection.device_id())
            .is_some_and(|current| Arc::ptr_eq(current, connection));
        if !occupies_slot {
            return false;
        }

        devices.remove(connection.device_id());
        if devices.is_empty() {
            inner.users.remove(&user_id);
        }
        drop(inner);

        connection.release();
        trace!(
            user_id,
            device_id = %connection.device_id(),
            connection_id = %connection.id(),
            "Connection removed"
        );
        true
    }

    /// Returns the connection occupying `(user_id, device_id)`, if any.
    pub fn get(&self, user_id: UserId, device_id: &str) -> Option<Arc<Connection>> {
        self.read()
            .users
            .get(&user_id)
            .and_then(|devices| devices.get(device_id))
            .cloned()
    }

    /// Snapshot of every registered connection at call time.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.read()
            .users
            .values()
            .flat_map(|devices| devices.values().cloned())
            .collect()
    }

    /// Snapshot of one user's connections at call time.
    pub fn snapshot_user(&self, user_id: UserId) -> Vec<Arc<Connection>> {
        self.read()
            .users
            .get(&user_id)
            .map(|devices| devices.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Visits every open connection registered at call time.
    ///
    /// The traversal runs over a snapshot and outside the lock, so `f` may
    /// call back into the registry (for example to remove a connection).
    /// Changes made during the traversal are not reflected in it.
    pub fn for_each_open<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Connection>),
    {
        for connection in self.snapshot() {
            if connection.is_open() {
                f(&connection);
            }
        }
    }

    /// Number of users with at least one connection.
    pub fn user_count(&self) -> usize {
        self.read().users.len()
    }

    /// Number of registered connections across all users.
    pub fn connection_count(&self) -> usize {
        self.read().users.values().map(HashMap::len).sum()
    }

    /// Diagnostic summary, ordered by user then device.
    pub fn stats(&self) -> RegistryStats {
        let inner = self.read();
        let mut connections: Vec<_> = inner
            .users
            .values()
            .flat_map(|devices| devices.values().map(|c| c.info()))
            .collect();
        let user_count = inner.users.len();
        drop(inner);

        connections.sort_by(|a, b| {
            a.user_id
                .cmp(&b.user_id)
                .then_with(|| a.device_id.cmp(&b.device_id))
        });

        RegistryStats {
            user_count,
            connections,
        }
    }

    /// Stops admitting connections and empties the registry.
    ///
    /// Returns the former occupants so the caller can close them.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let mut inner = self.write();
        inner.accepting = false;
        let drained: Vec<_> = inner
            .users
            .drain()
            .flat_map(|(_, devices)| devices.into_values())
            .collect();
        drop(inner);

        debug!(count = drained.len(), "Registry drained");
        drained
    }

    /// Admits registrations again after a [`drain`](Self::drain).
    pub fn reopen(&self) {
        self.write().accepting = true;
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::OutboundFrame;
    use crate::types::{ConnectionState, Identity};
    use tokio::sync::mpsc;

    fn connection(user_id: UserId, device: &str) -> (Arc<Connection>, mpsc::Receiver<OutboundFrame>) {
        Connection::channel(Identity::new(user_id, Some(device)), 8)
    }

    #[test]
    fn register_marks_connection_open() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = connection(1, "a");

        assert!(matches!(registry.register(conn.clone()), RegisterOutcome::Admitted));
        assert_eq!(conn.state(), ConnectionState::Open);
        assert!(Arc::ptr_eq(&registry.get(1, "a").unwrap(), &conn));
    }

    #[test]
    fn second_device_adds_connection_for_same_user() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = connection(1, "a");
        let (b, _rx_b) = connection(1, "b");

        registry.register(a);
        registry.register(b);

        let stats = registry.stats();
        assert_eq!(stats.user_count, 1);
        assert_eq!(stats.connections.len(), 2);
        assert_eq!(stats.connections[0].device_id, "a");
        assert_eq!(stats.connections[1].device_id, "b");
        assert!(stats.connections.iter().all(|c| c.is_alive));
    }

    #[test]
    fn takeover_closes_previous_occupant() {
        let registry = ConnectionRegistry::new();
        let (first, mut first_rx) = connection(7, "phone");
        let (second, _second_rx) = connection(7, "phone");

        registry.register(first.clone());
        let outcome = registry.register(second.clone());

        match outcome {
            RegisterOutcome::Replaced(old) => assert!(Arc::ptr_eq(&old, &first)),
            other => panic!("expected Replaced, got {other:?}"),
        }
        assert_eq!(
            first_rx.try_recv().unwrap(),
            OutboundFrame::Close {
                code: close_code::NORMAL,
                reason: SUPERSEDED_REASON,
            }
        );
        assert_eq!(first.state(), ConnectionState::Closing);
        assert!(first.is_evicted());

        let stats = registry.stats();
        assert_eq!(stats.connections.len(), 1);
        assert_eq!(stats.connections[0].connection_id, second.id());
    }

    #[test]
    fn stale_remove_does_not_evict_newer_occupant() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = connection(7, "phone");
        let (second, _rx2) = connection(7, "phone");

        registry.register(first.clone());
        registry.register(second.clone());

        assert!(!registry.remove(&first));
        assert!(Arc::ptr_eq(&registry.get(7, "phone").unwrap(), &second));
    }

    #[test]
    fn superseded_connection_cannot_reclaim_slot() {
        let registry = ConnectionRegistry::new();
        let (first, mut first_rx) = connection(7, "phone");
        let (second, mut second_rx) = connection(7, "phone");

        registry.register(first.clone());
        registry.register(second.clone());
        assert!(matches!(first_rx.try_recv(), Ok(OutboundFrame::Close { .. })));

        assert!(matches!(registry.register(first.clone()), RegisterOutcome::Refused));
        assert!(Arc::ptr_eq(&registry.get(7, "phone").unwrap(), &second));
        assert!(second.is_open());
        assert!(second_rx.try_recv().is_err());
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn terminated_connection_is_refused() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = connection(1, "a");
        conn.terminate();

        assert!(matches!(registry.register(conn), RegisterOutcome::Refused));
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn removing_last_device_prunes_user() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = connection(1, "a");
        let (b, _rx_b) = connection(1, "b");
        registry.register(a.clone());
        registry.register(b.clone());

        assert!(registry.remove(&a));
        assert_eq!(registry.user_count(), 1);
        assert!(registry.remove(&b));
        assert_eq!(registry.user_count(), 0);
        assert_eq!(registry.stats(), RegistryStats::default());
    }

    #[test]
    fn remove_unknown_is_noop() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = connection(1, "a");
        assert!(!registry.remove(&conn));
        assert!(!registry.remove(&conn));
    }

    #[test]
    fn reregistering_same_connection_is_not_a_takeover() {
        let registry = ConnectionRegistry::new();
        let (conn, mut rx) = connection(1, "a");
        registry.register(conn.clone());

        assert!(matches!(registry.register(conn.clone()), RegisterOutcome::Admitted));
        assert!(rx.try_recv().is_err());
        assert!(conn.is_open());
    }

    #[test]
    fn snapshot_user_scopes_to_one_user() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = connection(1, "a");
        let (b, _rx_b) = connection(2, "a");
        registry.register(a);
        registry.register(b);

        let only_two = registry.snapshot_user(2);
        assert_eq!(only_two.len(), 1);
        assert_eq!(only_two[0].user_id(), 2);
        assert!(registry.snapshot_user(3).is_empty());
    }

    #[test]
    fn for_each_open_may_mutate_registry() {
        let registry = ConnectionRegistry::new();
        let mut receivers = Vec::new();
        for device in ["a", "b", "c"] {
            let (conn, rx) = connection(1, device);
            registry.register(conn);
            receivers.push(rx);
        }

        let mut visited = 0;
        registry.for_each_open(|conn| {
            visited += 1;
            registry.remove(conn);
        });

        assert_eq!(visited, 3);
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn drain_empties_and_refuses_until_reopened() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = connection(1, "a");
        let (b, _rx_b) = connection(2, "b");
        registry.register(a);
        registry.register(b);

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(registry.user_count(), 0);

        let (late, _rx_late) = connection(3, "c");
        assert!(matches!(registry.register(late.clone()), RegisterOutcome::Refused));
        assert_eq!(late.state(), ConnectionState::Connecting);

        registry.reopen();
        assert!(registry.register(late).is_admitted());
    }

    #[test]
    fn concurrent_takeovers_leave_one_occupant() {
        let registry = Arc::new(ConnectionRegistry::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let mut kept = Vec::new();
                    for _ in 0..50 {
                        let (conn, rx) = connection(7, "phone");
                        registry.register(conn.clone());
                        for snapshot_conn in registry.snapshot() {
                            assert_eq!(snapshot_conn.device_id(), "phone");
                        }
                        assert!(registry.snapshot().len() <= 1);
                        registry.remove(&conn);
                        kept.push(rx);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.connection_count() <= 1);
    }
}
