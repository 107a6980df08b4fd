//! Public API for the `inlet` library.
//!
//! `inlet` is a small TCP server that decouples inbound I/O from the logic
//! that consumes it. It accepts many concurrent connections, frames each
//! byte stream into brace-balanced JSON objects, decodes them, and delivers
//! every message into a single FIFO that the embedding application drains
//! at its own pace. Synthetic reports for decode failures, disconnects, and
//! liveness timeouts travel the same path.
//!
//! Clients are expected to pulse `{"type":"KEEP_ALIVE"}` periodically;
//! pulses refresh a per-connection liveness stamp and are never delivered.
//! A periodic sweeper reports connections whose stamp has gone stale.
//!
//! # Examples
//!
//! ```no_run
//! use inlet::{InletServer, Message};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), inlet::ServerError> {
//! let handle = InletServer::new().bind(([127, 0, 0, 1], 5000).into())?.start();
//!
//! loop {
//!     while let Some(item) = handle.read_message() {
//!         match item.message {
//!             Message::SoftwareError { reason } => {
//!                 eprintln!("{} reported: {reason}", item.peer_addr);
//!             }
//!             message => println!("{} sent: {message:?}", item.peer_addr),
//!         }
//!     }
//!     tokio::time::sleep(std::time::Duration::from_millis(100)).await;
//! }
//! # }
//! ```

pub mod codec;
pub mod ingress;
pub mod message;
pub mod metrics;
pub mod server;
pub mod session;
mod sweeper;

pub use codec::{FramingError, JsonObjectCodec};
pub use ingress::{BufferItem, IngressQueue, PushError};
pub use message::{DecodeError, Message, decode_message};
pub use server::{BackoffConfig, InletServer, ServerError, ServerHandle};
pub use session::{Connection, ConnectionId, ConnectionState, ConnectionTable};
pub use sweeper::KeepAliveConfig;
