//! Tokio-based TCP ingress server.
//!
//! [`InletServer`] accepts many concurrent client connections, frames each
//! byte stream into brace-balanced JSON objects, and funnels every decoded
//! message into one FIFO the embedding application drains through
//! [`ServerHandle::read_message`]. Synthetic reports for decode failures,
//! disconnects, and liveness timeouts travel the same path.

use tokio::sync::oneshot;

use crate::{codec, sweeper::KeepAliveConfig};

mod binding;
pub mod error;
pub use error::ServerError;
mod reader;
mod runtime;
pub use runtime::{BackoffConfig, ServerHandle};

/// TCP ingress server builder.
///
/// The server carries a typestate `S` indicating whether it is [`Unbound`]
/// (not yet bound to a TCP listener) or [`Bound`]. New servers start
/// `Unbound` and must call [`InletServer::bind`] or
/// [`InletServer::bind_existing_listener`] before they can start. Starting
/// spawns the accept loop and the liveness sweeper onto the ambient Tokio
/// runtime and hands back a [`ServerHandle`].
///
/// # Examples
/// ```no_run
/// use inlet::{InletServer, ServerError};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), ServerError> {
/// // Start unbound (S = Unbound)
/// let srv = InletServer::new();
///
/// // Transition to bound (S = Bound)
/// let srv = srv.bind(([127, 0, 0, 1], 0).into())?;
///
/// // Launch the accept loop and sweeper
/// let handle = srv.start();
///
/// if let Some(item) = handle.read_message() {
///     println!("{:?} from {}", item.message, item.peer_addr);
/// }
///
/// handle.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct InletServer<S = Unbound>
where
    S: ServerState,
{
    pub(crate) keep_alive: KeepAliveConfig,
    pub(crate) backoff: BackoffConfig,
    pub(crate) max_frame_length: usize,
    /// Channel used to notify when the server is ready.
    ///
    /// A `oneshot::Sender` can transmit only one readiness notification, so
    /// a new sender must be provided each time a server is started.
    pub(crate) ready_tx: Option<oneshot::Sender<()>>,
    /// Typestate tracking whether the server has been bound to a listener.
    pub(crate) state: S,
}

/// Marker indicating the server has not yet bound a listener.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unbound;

/// Marker indicating the server is bound to a TCP listener.
#[derive(Debug)]
pub struct Bound {
    pub(crate) listener: tokio::net::TcpListener,
}

/// Trait implemented by [`Unbound`] and [`Bound`] to model binding typestate.
pub trait ServerState: sealed::Sealed {}

mod sealed {
    //! Prevent external implementations of [`ServerState`].

    pub trait Sealed {}
    impl Sealed for super::Unbound {}
    impl Sealed for super::Bound {}
}

impl ServerState for Unbound {}
impl ServerState for Bound {}

impl InletServer<Unbound> {
    /// Create an unbound server with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            keep_alive: KeepAliveConfig::default(),
            backoff: BackoffConfig::default(),
            max_frame_length: codec::MAX_FRAME_LENGTH,
            ready_tx: None,
            state: Unbound,
        }
    }
}

impl Default for InletServer<Unbound> {
    fn default() -> Self { Self::new() }
}

impl<S: ServerState> InletServer<S> {
    /// Replace the liveness configuration.
    ///
    /// The configuration is normalised when the server starts; see
    /// [`KeepAliveConfig::normalised`].
    #[must_use]
    pub fn keep_alive(mut self, config: KeepAliveConfig) -> Self {
        self.keep_alive = config;
        self
    }

    /// Replace the accept-retry backoff configuration.
    #[must_use]
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.backoff = config;
        self
    }

    /// Set the maximum accepted frame length, clamped to
    /// [`codec::MIN_FRAME_LENGTH`]..=[`codec::MAX_FRAME_LENGTH`].
    #[must_use]
    pub fn max_frame_length(mut self, limit: usize) -> Self {
        self.max_frame_length = codec::clamp_frame_length(limit);
        self
    }

    /// Install a channel notified once the accept loop has been spawned.
    #[must_use]
    pub fn ready_signal(mut self, tx: oneshot::Sender<()>) -> Self {
        self.ready_tx = Some(tx);
        self
    }

    /// The configured liveness settings.
    #[must_use]
    pub fn keep_alive_config(&self) -> KeepAliveConfig { self.keep_alive }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn defaults_are_sane() {
        let server = InletServer::new();
        assert_eq!(server.max_frame_length, codec::MAX_FRAME_LENGTH);
        assert_eq!(server.keep_alive_config(), KeepAliveConfig::default());
    }

    #[test]
    fn builder_clamps_frame_length() {
        let server = InletServer::new().max_frame_length(1);
        assert_eq!(server.max_frame_length, codec::MIN_FRAME_LENGTH);
    }

    #[test]
    fn builder_replaces_keep_alive() {
        let config = KeepAliveConfig {
            interval: Duration::from_millis(50),
            check_period: 1,
            timeout: Duration::from_millis(120),
        };
        let server = InletServer::new().keep_alive(config);
        assert_eq!(server.keep_alive_config(), config);
    }
}
