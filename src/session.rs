//! Registry of active connections.
//!
//! The [`ConnectionTable`] exclusively owns every live [`Connection`]; the
//! accept loop inserts, the owning reader task removes, and everything else
//! holds only the `Arc` it was handed at registration. A connection is
//! always removed from the table *before* its socket is closed, so no task
//! dispatched after removal can observe a stale handle.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError, TryLockError,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::time::Instant;

/// Identifier assigned to a connection.
///
/// Allocated from a per-table monotonic counter; never reused for the
/// lifetime of the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Construct an id from a raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self { Self(value) }
}

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self { Self(value) }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a connection.
///
/// Transitions only ever advance: `Open` → `Closing` → `Closed`. `Closed`
/// is terminal, and a `Closed` connection is no longer reachable from the
/// table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Registered and readable.
    Open,
    /// Removed from the table; socket not yet closed.
    Closing,
    /// Socket closed. Terminal.
    Closed,
}

/// Per-connection state owned by the [`ConnectionTable`].
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    last_keep_alive: Mutex<Instant>,
    state: Mutex<ConnectionState>,
}

impl Connection {
    fn new(id: ConnectionId, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            last_keep_alive: Mutex::new(Instant::now()),
            state: Mutex::new(ConnectionState::Open),
        }
    }

    /// The connection's table key.
    #[must_use]
    pub fn id(&self) -> ConnectionId { self.id }

    /// Remote address captured at accept time.
    #[must_use]
    pub fn peer(&self) -> SocketAddr { self.peer }

    /// Record receipt of a KEEP_ALIVE pulse.
    ///
    /// The stored timestamp is monotonically non-decreasing.
    pub fn refresh_keep_alive(&self) {
        let mut stamp = self
            .last_keep_alive
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if now > *stamp {
            *stamp = now;
        }
    }

    /// Instant of the most recent KEEP_ALIVE (or of acceptance).
    #[must_use]
    pub fn last_keep_alive(&self) -> Instant {
        *self
            .last_keep_alive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advance `Open` → `Closing`. Later states are left untouched.
    pub(crate) fn begin_close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == ConnectionState::Open {
            *state = ConnectionState::Closing;
        }
    }

    /// Advance to the terminal `Closed` state.
    pub(crate) fn mark_closed(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = ConnectionState::Closed;
    }
}

/// Table of live connections keyed by [`ConnectionId`].
///
/// All operations serialise on one table-wide guard. The liveness sweeper
/// iterates through [`try_for_each`](Self::try_for_each), which refuses to
/// wait for the guard: skipping a sweep is preferable to stalling the
/// accept or read paths.
#[derive(Default)]
pub struct ConnectionTable {
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicU64,
}

impl ConnectionTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Allocate a fresh id and insert a new `Open` connection for `peer`.
    ///
    /// The returned `Arc` is the handle the reader task will own.
    ///
    /// # Panics
    ///
    /// Panics if the freshly allocated id is already present. Ids are
    /// monotonic, so a duplicate means table state has been corrupted and
    /// continuing would hand two readers the same connection.
    pub fn register(&self, peer: SocketAddr) -> Arc<Connection> {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let conn = Arc::new(Connection::new(id, peer));
        let previous = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(&conn));
        assert!(
            previous.is_none(),
            "duplicate entry in connection table: id={id}"
        );
        conn
    }

    /// Remove a connection, returning it so the caller can finish teardown.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    /// Look up a live connection.
    #[must_use]
    pub fn lookup(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Visit every live connection, holding the table guard throughout.
    ///
    /// Returns `false` without visiting anything when the guard is
    /// contended.
    pub fn try_for_each(&self, mut visitor: impl FnMut(&Connection)) -> bool {
        let connections = match self.connections.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return false,
        };
        for conn in connections.values() {
            visitor(conn);
        }
        true
    }

    /// Snapshot of the peer addresses of all live connections.
    #[must_use]
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|conn| conn.peer())
            .collect()
    }

    /// Remove every connection, returning them for teardown.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, conn)| conn)
            .collect()
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the table holds no connections.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
