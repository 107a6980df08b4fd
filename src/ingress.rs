//! The ingress queue: a single FIFO through which every decoded and
//! synthetic message reaches the embedding application.
//!
//! Readers push from their connection tasks, the liveness sweeper pushes
//! timeout reports, and the application drains the queue through
//! [`ServerHandle::read_message`](crate::server::ServerHandle::read_message).
//! The queue is a mutex-guarded deque rather than a channel because the
//! sweeper's contract is to *fail* a contended enqueue and retry on its next
//! sweep, which no channel primitive expresses.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{Mutex, PoisonError, TryLockError},
    time::SystemTime,
};

use thiserror::Error;

use crate::message::Message;

/// One delivered unit: a decoded or synthetic message plus its provenance.
#[derive(Clone, Debug)]
pub struct BufferItem {
    /// The decoded message, or a synthetic error report.
    pub message: Message,
    /// Address of the originating peer (last known, for synthetic items).
    pub peer_addr: SocketAddr,
    /// Wall-clock time at which the item was enqueued.
    pub received_at: SystemTime,
}

impl BufferItem {
    pub(crate) fn new(message: Message, peer_addr: SocketAddr) -> Self {
        Self {
            message,
            peer_addr,
            received_at: SystemTime::now(),
        }
    }
}

/// Errors that can occur when pushing an item.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum PushError {
    /// The queue guard was contended and the caller opted not to wait.
    #[error("ingress queue busy")]
    Busy,
    /// The server has stopped; no further items are accepted.
    #[error("ingress queue closed")]
    Closed,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<BufferItem>,
    closed: bool,
}

/// FIFO of [`BufferItem`]s, safe for concurrent producers and one consumer.
///
/// `push` blocks only for the duration of the short internal guard; `pop`
/// never waits for new items. FIFO order holds among successful pushes.
#[derive(Default)]
pub struct IngressQueue(Mutex<QueueState>);

impl IngressQueue {
    /// Create an empty, open queue.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Append an item at the tail.
    ///
    /// # Errors
    ///
    /// Returns [`PushError::Closed`] once the server has stopped.
    pub fn push(&self, item: BufferItem) -> Result<(), PushError> {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(PushError::Closed);
        }
        state.items.push_back(item);
        Ok(())
    }

    /// Append an item at the tail without waiting for the guard.
    ///
    /// # Errors
    ///
    /// Returns [`PushError::Busy`] when the guard is contended (the caller
    /// is expected to drop the item and retry later) and
    /// [`PushError::Closed`] once the server has stopped.
    pub fn try_push(&self, item: BufferItem) -> Result<(), PushError> {
        let mut state = match self.0.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(PushError::Busy),
        };
        if state.closed {
            return Err(PushError::Closed);
        }
        state.items.push_back(item);
        Ok(())
    }

    /// Remove and return the head item, or `None` when the queue is empty.
    ///
    /// Never waits for new items to arrive.
    #[must_use]
    pub fn pop(&self) -> Option<BufferItem> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .pop_front()
    }

    /// Close the queue and discard any undelivered items.
    ///
    /// Returns the number of items discarded. Subsequent pushes fail with
    /// [`PushError::Closed`]; subsequent pops return `None`.
    pub fn close_and_drain(&self) -> usize {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        let discarded = state.items.len();
        state.items.clear();
        discarded
    }

    /// Number of items currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .len()
    }

    /// Whether the queue is currently empty.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
