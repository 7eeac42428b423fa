//! Resource handles owned by the registry
//!
//! The registry never performs I/O. It holds these handles so that tearing
//! down an endpoint or a connection can close the underlying socket.

use std::net::SocketAddr;

/// A listening socket opened for a forwarded port
pub trait ForwardListener: Send + 'static {
    /// Address the listener is bound to, if known
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Stop accepting and release the socket. Must be idempotent.
    fn close(&mut self);
}

/// An accepted connection being tunneled
pub trait ForwardConnection: Send + 'static {
    /// Remote address of the connected client, if known
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Tear the connection down. Must be idempotent.
    fn close(&mut self);
}
