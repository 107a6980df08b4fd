//! Runtime control for [`InletServer`]: the accept loop and the handle to a
//! running server.

use std::{io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    time::{Duration, sleep},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{
    Bound, InletServer,
    reader::{ReaderContext, spawn_reader_task},
};
use crate::{
    ingress::{BufferItem, IngressQueue},
    metrics,
    session::ConnectionTable,
    sweeper::LivenessSweeper,
};

/// Abstraction for sources of incoming connections consumed by the accept
/// loop.
///
/// Implementations must be cancellation-safe: dropping a pending `accept()`
/// future must not leak resources.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub(super) trait AcceptListener: Send + Sync {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl AcceptListener for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> { TcpListener::local_addr(self) }
}

/// Configuration for exponential back-off timing in the accept loop.
///
/// Controls retry behaviour when `accept()` calls fail on the server's TCP
/// listener. The back-off starts at `initial_delay` and doubles on each
/// failure, capped at `max_delay`; a successful accept resets it.
///
/// # Default Values
/// - `initial_delay`: 10 milliseconds
/// - `max_delay`: 1 second
///
/// # Invariants
/// - `initial_delay` must not exceed `max_delay`
/// - `initial_delay` must be at least 1 millisecond
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay used for the first retry after an `accept()` failure.
    pub initial_delay: Duration,
    /// Maximum back-off delay once retries have increased exponentially.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl BackoffConfig {
    /// Clamp delays to sane bounds and ensure `initial_delay <= max_delay`.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use inlet::BackoffConfig;
    ///
    /// let cfg = BackoffConfig {
    ///     initial_delay: Duration::from_millis(5),
    ///     max_delay: Duration::from_millis(1),
    /// };
    ///
    /// let normalised = cfg.normalised();
    /// assert_eq!(normalised.initial_delay, Duration::from_millis(1));
    /// assert_eq!(normalised.max_delay, Duration::from_millis(5));
    /// ```
    #[must_use]
    pub fn normalised(mut self) -> Self {
        self.initial_delay = self.initial_delay.max(Duration::from_millis(1));
        self.max_delay = self.max_delay.max(Duration::from_millis(1));
        if self.initial_delay > self.max_delay {
            std::mem::swap(&mut self.initial_delay, &mut self.max_delay);
        }
        self
    }
}

pub(super) struct AcceptLoopOptions {
    pub queue: Arc<IngressQueue>,
    pub table: Arc<ConnectionTable>,
    pub shutdown: CancellationToken,
    pub tracker: TaskTracker,
    pub backoff: BackoffConfig,
    pub max_frame_length: usize,
}

impl InletServer<Bound> {
    /// Launch the server and return a handle to it.
    ///
    /// Spawns the accept loop and the liveness sweeper onto the ambient
    /// runtime; the call itself does not block. Must be called from within
    /// a Tokio runtime.
    #[must_use]
    pub fn start(self) -> ServerHandle {
        let InletServer {
            keep_alive,
            backoff,
            max_frame_length,
            ready_tx,
            state: Bound { listener },
        } = self;

        let queue = Arc::new(IngressQueue::new());
        let table = Arc::new(ConnectionTable::new());
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let local_addr = listener.local_addr().ok();

        tracker.spawn(accept_loop(
            listener,
            AcceptLoopOptions {
                queue: Arc::clone(&queue),
                table: Arc::clone(&table),
                shutdown: shutdown.clone(),
                tracker: tracker.clone(),
                backoff,
                max_frame_length,
            },
        ));

        let sweeper = LivenessSweeper::new(Arc::clone(&table), Arc::clone(&queue), keep_alive);
        tracker.spawn(sweeper.run(shutdown.clone()));

        if ready_tx.is_some_and(|tx| tx.send(()).is_err()) {
            warn!("failed to send readiness signal: receiver dropped");
        }

        ServerHandle {
            queue,
            table,
            shutdown,
            tracker,
            local_addr,
        }
    }
}

/// Handle to a running server.
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) leaves
/// the background tasks running until the runtime itself shuts down.
pub struct ServerHandle {
    queue: Arc<IngressQueue>,
    table: Arc<ConnectionTable>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    local_addr: Option<SocketAddr>,
}

impl ServerHandle {
    /// Pop the next ingress item, or `None` when the queue is empty.
    ///
    /// Never waits for new messages; the caller owns the returned item.
    #[must_use]
    pub fn read_message(&self) -> Option<BufferItem> { self.queue.pop() }

    /// Snapshot of the peer addresses of all live connections.
    #[must_use]
    pub fn connected_peers(&self) -> Vec<SocketAddr> { self.table.peers() }

    /// The address the server is listening on.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> { self.local_addr }

    /// Get a clone of the shutdown token observed by the server's tasks.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken { self.shutdown.clone() }

    /// Stop the server and release every resource it holds.
    ///
    /// Cancels the accept loop, the sweeper, and every reader task, then
    /// waits for them to finish tearing down their connections. After this
    /// returns, no further items are enqueued, all sockets are closed, and
    /// the listen address is free for rebinding.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        // Readers remove their own connections on cancellation; anything
        // left (a connection whose reader never ran) is torn down here.
        for conn in self.table.drain() {
            conn.begin_close();
            conn.mark_closed();
            metrics::dec_connections();
        }

        let discarded = self.queue.close_and_drain();
        if discarded > 0 {
            debug!("discarded {discarded} undelivered ingress items");
        }
    }
}

/// Accepts incoming connections, registers them, and spawns reader tasks.
///
/// Failures to accept a connection trigger an exponential back-off governed
/// by `options.backoff`. The loop terminates when `options.shutdown` is
/// cancelled; spawned readers are tracked by `options.tracker` for graceful
/// shutdown.
async fn accept_loop<L>(listener: L, options: AcceptLoopOptions)
where
    L: AcceptListener + Send + Sync + 'static,
{
    let backoff = options.backoff.normalised();
    debug_assert!(
        backoff.initial_delay <= backoff.max_delay,
        "BackoffConfig invariant violated: initial_delay > max_delay"
    );
    let mut delay = backoff.initial_delay;
    while let Some(next_delay) = accept_iteration(&listener, &options, &backoff, delay).await {
        delay = next_delay;
    }
}

async fn accept_iteration<L>(
    listener: &L,
    options: &AcceptLoopOptions,
    backoff: &BackoffConfig,
    delay: Duration,
) -> Option<Duration>
where
    L: AcceptListener + Send + Sync + 'static,
{
    select! {
        biased;

        () = options.shutdown.cancelled() => None,
        res = listener.accept() => Some(match res {
            Ok((stream, peer)) => {
                // Registration precedes the reader: a connection is in the
                // table before the first byte can be routed to it.
                let conn = options.table.register(peer);
                debug!("connect from peer={peer}, id={}", conn.id());
                metrics::inc_connections();
                spawn_reader_task(
                    stream,
                    conn,
                    ReaderContext {
                        queue: Arc::clone(&options.queue),
                        table: Arc::clone(&options.table),
                        shutdown: options.shutdown.clone(),
                        max_frame_length: options.max_frame_length,
                    },
                    &options.tracker,
                );
                backoff.initial_delay
            }
            Err(e) => {
                let local_addr = listener.local_addr().ok();
                warn!("accept error: error={e:?}, local_addr={local_addr:?}");
                sleep(delay).await;
                (delay * 2).min(backoff.max_delay)
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::{
        task::yield_now,
        time::{Instant, advance, timeout},
    };

    use super::{MockAcceptListener, *};

    fn test_options(tracker: &TaskTracker, shutdown: CancellationToken) -> AcceptLoopOptions {
        AcceptLoopOptions {
            queue: Arc::new(IngressQueue::new()),
            table: Arc::new(ConnectionTable::new()),
            shutdown,
            tracker: tracker.clone(),
            backoff: BackoffConfig::default(),
            max_frame_length: crate::codec::MAX_FRAME_LENGTH,
        }
    }

    #[tokio::test]
    async fn accept_loop_stops_on_shutdown_signal() {
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test listener");

        tracker.spawn(accept_loop(
            listener,
            test_options(&tracker, token.clone()),
        ));

        token.cancel();
        tracker.close();

        let result = timeout(Duration::from_millis(100), tracker.wait()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn accepted_connections_are_registered() {
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test listener");
        let addr = listener.local_addr().expect("listener address");

        let options = test_options(&tracker, token.clone());
        let table = Arc::clone(&options.table);
        tracker.spawn(accept_loop(listener, options));

        let client = TcpStream::connect(addr).await.expect("connect");
        let deadline = Instant::now() + Duration::from_secs(1);
        while table.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(table.len(), 1);
        assert_eq!(table.peers()[0], client.local_addr().expect("client addr"));

        token.cancel();
        tracker.close();
        tracker.wait().await;
    }

    /// Creates a mock listener that fails with exponential backoff tracking.
    fn setup_backoff_mock_listener(
        calls: &Arc<Mutex<Vec<Instant>>>,
        num_calls: usize,
    ) -> MockAcceptListener {
        let mut listener = MockAcceptListener::new();
        let call_log = Arc::clone(calls);
        listener
            .expect_accept()
            .returning(move || {
                let call_log = Arc::clone(&call_log);
                Box::pin(async move {
                    call_log.lock().expect("lock").push(Instant::now());
                    Err(io::Error::other("mock error"))
                })
            })
            .times(num_calls);
        listener
            .expect_local_addr()
            .returning(|| Ok("127.0.0.1:0".parse().expect("addr parse")))
            .times(num_calls);
        listener
    }

    /// Validates that recorded call intervals match expected backoff delays.
    fn assert_backoff_intervals(calls: &[Instant], expected: &[Duration]) {
        let intervals: Vec<_> = calls
            .windows(2)
            .map(|w| {
                w[1].checked_duration_since(w[0])
                    .expect("instants should be monotonically increasing")
            })
            .collect();

        assert_eq!(intervals.len(), expected.len(), "interval count mismatch");
        for (interval, expected) in intervals.into_iter().zip(expected.iter()) {
            assert_eq!(interval, *expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn accept_failures_back_off_exponentially() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let listener = setup_backoff_mock_listener(&calls, 4);
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();

        let mut options = test_options(&tracker, token.clone());
        options.backoff = BackoffConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        };
        tracker.spawn(accept_loop(listener, options));

        yield_now().await;
        assert_eq!(calls.lock().expect("lock").len(), 1);

        for ms in [5, 10, 20] {
            advance(Duration::from_millis(ms)).await;
            yield_now().await;
        }

        token.cancel();
        advance(Duration::from_millis(20)).await;
        yield_now().await;
        tracker.close();
        tracker.wait().await;

        let calls = calls.lock().expect("lock");
        assert_eq!(calls.len(), 4);
        let expected = [
            Duration::from_millis(5),
            Duration::from_millis(10),
            Duration::from_millis(20),
        ];
        assert_backoff_intervals(&calls, &expected);
    }

    #[tokio::test]
    async fn backoff_normalisation_swaps_inverted_delays() {
        let cfg = BackoffConfig {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_millis(100),
        }
        .normalised();
        assert!(cfg.initial_delay <= cfg.max_delay);
    }
}
