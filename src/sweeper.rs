//! Periodic liveness sweep over the connection table.
//!
//! Clients are expected to send a KEEP_ALIVE pulse at least every
//! [`KeepAliveConfig::interval`]. The sweeper wakes every
//! `interval × check_period`, walks the table, and enqueues a
//! `"Connection timeout"` report for every connection whose last pulse is
//! older than [`KeepAliveConfig::timeout`]. It never destroys connections
//! itself: the application decides how to react, and a genuinely dead
//! socket will fail the reader's next read anyway. While a connection stays
//! stale the report re-arms on every sweep.

use std::sync::Arc;

use log::{debug, warn};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    ingress::{BufferItem, IngressQueue},
    message::{CONNECTION_TIMEOUT_REASON, Message},
    session::ConnectionTable,
};

/// Liveness configuration.
///
/// # Default Values
/// - `interval`: 5 seconds
/// - `check_period`: 2 (sweep every 10 seconds)
/// - `timeout`: 30 seconds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeepAliveConfig {
    /// Expected client pulse period.
    pub interval: Duration,
    /// Multiplier applied to `interval` to obtain the sweep cadence.
    pub check_period: u32,
    /// Idle threshold beyond which a connection is reported as timed out.
    pub timeout: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            check_period: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

impl KeepAliveConfig {
    /// Clamp all fields to sane lower bounds.
    ///
    /// Prevents a zero interval or check period from turning the sweeper
    /// into a busy loop.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use inlet::KeepAliveConfig;
    ///
    /// let cfg = KeepAliveConfig {
    ///     interval: Duration::ZERO,
    ///     check_period: 0,
    ///     timeout: Duration::ZERO,
    /// };
    ///
    /// let normalised = cfg.normalised();
    /// assert_eq!(normalised.interval, Duration::from_millis(1));
    /// assert_eq!(normalised.check_period, 1);
    /// assert_eq!(normalised.timeout, Duration::from_millis(1));
    /// ```
    #[must_use]
    pub fn normalised(mut self) -> Self {
        self.interval = self.interval.max(Duration::from_millis(1));
        self.check_period = self.check_period.max(1);
        self.timeout = self.timeout.max(Duration::from_millis(1));
        self
    }

    /// Cadence at which the sweeper wakes.
    #[must_use]
    pub fn sweep_period(&self) -> Duration { self.interval * self.check_period }
}

/// Background task reporting connections that stopped pulsing.
pub(crate) struct LivenessSweeper {
    table: Arc<ConnectionTable>,
    queue: Arc<IngressQueue>,
    config: KeepAliveConfig,
}

impl LivenessSweeper {
    pub(crate) fn new(
        table: Arc<ConnectionTable>,
        queue: Arc<IngressQueue>,
        config: KeepAliveConfig,
    ) -> Self {
        Self {
            table,
            queue,
            config: config.normalised(),
        }
    }

    /// Sweep until `shutdown` is cancelled.
    pub(crate) async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // An interval's first tick completes immediately; consume it so the
        // first real sweep happens one full period after start.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    debug!("liveness sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }
    }

    /// One pass over the table. Returns `false` when the sweep was skipped
    /// because the table guard was contended.
    fn sweep(&self) -> bool {
        let now = Instant::now();
        let swept = self.table.try_for_each(|conn| {
            let idle = now.saturating_duration_since(conn.last_keep_alive());
            if idle <= self.config.timeout {
                return;
            }
            warn!(
                "no KEEP_ALIVE from peer={} for {}s",
                conn.peer(),
                idle.as_secs()
            );
            let item = BufferItem::new(
                Message::software_error(CONNECTION_TIMEOUT_REASON),
                conn.peer(),
            );
            if let Err(e) = self.queue.try_push(item) {
                // Dropped reports re-arm on the next sweep.
                debug!("timeout report dropped: error={e}, peer={}", conn.peer());
            }
        });
        if !swept {
            debug!("liveness sweep skipped: connection table contended");
        }
        swept
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use tokio::{task::yield_now, time::advance};

    use super::*;

    type Fixture = (Arc<ConnectionTable>, Arc<IngressQueue>, LivenessSweeper);

    fn fixture(config: KeepAliveConfig) -> Fixture {
        let table = Arc::new(ConnectionTable::new());
        let queue = Arc::new(IngressQueue::new());
        let sweeper = LivenessSweeper::new(Arc::clone(&table), Arc::clone(&queue), config);
        (table, queue, sweeper)
    }

    fn short_config() -> KeepAliveConfig {
        KeepAliveConfig {
            interval: Duration::from_secs(1),
            check_period: 1,
            timeout: Duration::from_secs(3),
        }
    }

    fn peer() -> SocketAddr { SocketAddr::from((Ipv4Addr::LOCALHOST, 9000)) }

    #[test]
    fn sweep_period_multiplies_interval() {
        let cfg = KeepAliveConfig {
            interval: Duration::from_secs(5),
            check_period: 3,
            timeout: Duration::from_secs(30),
        };
        assert_eq!(cfg.sweep_period(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_connection_is_not_reported() {
        let (table, queue, sweeper) = fixture(short_config());
        table.register(peer());
        advance(Duration::from_secs(1)).await;
        assert!(sweeper.sweep());
        assert!(queue.pop().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_connection_is_reported() {
        let (table, queue, sweeper) = fixture(short_config());
        table.register(peer());
        advance(Duration::from_secs(4)).await;
        assert!(sweeper.sweep());

        let item = queue.pop().expect("timeout report");
        assert_eq!(
            item.message,
            Message::software_error(CONNECTION_TIMEOUT_REASON)
        );
        assert_eq!(item.peer_addr, peer());
        // The sweeper reports; it never destroys.
        assert_eq!(table.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_pulse_suppresses_the_report() {
        let (table, queue, sweeper) = fixture(short_config());
        let conn = table.register(peer());
        advance(Duration::from_secs(4)).await;
        conn.refresh_keep_alive();
        assert!(sweeper.sweep());
        assert!(queue.pop().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn report_rearms_while_connection_stays_stale() {
        let (table, queue, sweeper) = fixture(short_config());
        table.register(peer());
        advance(Duration::from_secs(4)).await;
        assert!(sweeper.sweep());
        advance(Duration::from_secs(1)).await;
        assert!(sweeper.sweep());
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_queue_drops_the_report() {
        let (table, queue, sweeper) = fixture(short_config());
        table.register(peer());
        advance(Duration::from_secs(4)).await;
        queue.close_and_drain();

        // The sweep itself completes; the report is simply discarded.
        assert!(sweeper.sweep());
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_cancellation() {
        let (_table, _queue, sweeper) = fixture(short_config());
        let token = CancellationToken::new();
        let task = tokio::spawn(sweeper.run(token.clone()));
        yield_now().await;
        token.cancel();
        task.await.expect("sweeper join");
    }

    #[tokio::test(start_paused = true)]
    async fn run_sweeps_on_cadence() {
        let (table, queue, sweeper) = fixture(short_config());
        table.register(peer());
        let token = CancellationToken::new();
        let task = tokio::spawn(sweeper.run(token.clone()));
        yield_now().await;

        // Three sweep periods elapse; the connection is stale after the
        // third, so exactly one report lands on the fourth tick.
        for _ in 0..4 {
            advance(Duration::from_secs(1)).await;
            yield_now().await;
        }
        assert_eq!(queue.len(), 1);

        token.cancel();
        task.await.expect("sweeper join");
    }
}
