//! Listener binding for [`InletServer`].

use std::net::{SocketAddr, TcpListener as StdTcpListener};

use tokio::net::TcpListener;

use super::{Bound, InletServer, ServerError, ServerState, Unbound};

impl<S> InletServer<S>
where
    S: ServerState,
{
    fn bind_to_listener(
        self,
        std_listener: StdTcpListener,
    ) -> Result<InletServer<Bound>, ServerError> {
        let InletServer {
            keep_alive,
            backoff,
            max_frame_length,
            ready_tx,
            ..
        } = self;

        std_listener
            .set_nonblocking(true)
            .map_err(ServerError::Bind)?;
        let listener = TcpListener::from_std(std_listener).map_err(ServerError::Bind)?;

        Ok(InletServer {
            keep_alive,
            backoff,
            max_frame_length,
            ready_tx,
            state: Bound { listener },
        })
    }
}

impl InletServer<Unbound> {
    /// Return `None` as the server is not bound.
    #[must_use]
    pub const fn local_addr(&self) -> Option<SocketAddr> { None }

    /// Bind to a fresh address.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::net::{Ipv4Addr, SocketAddr};
    ///
    /// use inlet::InletServer;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
    /// let server = InletServer::new().bind(addr).expect("bind failed");
    /// assert!(server.local_addr().is_some());
    /// # }
    /// ```
    ///
    /// # Errors
    /// Returns a [`ServerError`] if binding or configuring the listener
    /// fails.
    pub fn bind(self, addr: SocketAddr) -> Result<InletServer<Bound>, ServerError> {
        let std_listener = StdTcpListener::bind(addr).map_err(ServerError::Bind)?;
        self.bind_to_listener(std_listener)
    }

    /// Bind to an existing `StdTcpListener`.
    ///
    /// Useful when the caller needs to reserve a port before constructing
    /// the server, for example in tests.
    ///
    /// # Errors
    /// Returns a [`ServerError`] if configuring the listener fails.
    pub fn bind_existing_listener(
        self,
        std_listener: StdTcpListener,
    ) -> Result<InletServer<Bound>, ServerError> {
        self.bind_to_listener(std_listener)
    }
}

impl InletServer<Bound> {
    /// Returns the bound address, or `None` if retrieving it fails.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> { self.state.listener.local_addr().ok() }

    /// Rebind to a fresh address, discarding the current listener.
    ///
    /// # Errors
    /// Returns a [`ServerError`] if binding or configuring the listener
    /// fails.
    pub fn bind(self, addr: SocketAddr) -> Result<Self, ServerError> {
        let std_listener = StdTcpListener::bind(addr).map_err(ServerError::Bind)?;
        self.bind_to_listener(std_listener)
    }

    /// Rebind using an existing `StdTcpListener`.
    ///
    /// # Errors
    /// Returns a [`ServerError`] if configuring the listener fails.
    pub fn bind_existing_listener(self, std_listener: StdTcpListener) -> Result<Self, ServerError> {
        self.bind_to_listener(std_listener)
    }
}
