//! Errors raised by [`InletServer`](super::InletServer) operations.

use std::io;

use thiserror::Error;

/// Errors that may occur while configuring or starting the server.
///
/// Accept failures never surface here: the accept loop retries them with
/// exponential backoff, and per-connection failures are reported through
/// the ingress queue instead.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding or configuring the listener failed.
    #[error("bind error: {0}")]
    Bind(#[source] io::Error),
}
