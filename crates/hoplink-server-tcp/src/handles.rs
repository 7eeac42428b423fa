//! Registry handles for TCP sockets
//!
//! The sockets themselves stay with the accept loop and the pump tasks; the
//! registry gets a token that stops them.

use hoplink_forward::{ForwardConnection, ForwardListener};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

/// Closes the accept loop of a forwarded port
#[derive(Debug, Clone)]
pub struct TcpListenerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl TcpListenerHandle {
    pub fn new(local_addr: SocketAddr, shutdown: CancellationToken) -> Self {
        Self {
            local_addr,
            shutdown,
        }
    }
}

impl ForwardListener for TcpListenerHandle {
    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    fn close(&mut self) {
        self.shutdown.cancel();
    }
}

/// Stops both pumps of an accepted connection, which drops the socket
#[derive(Debug, Clone)]
pub struct TcpConnectionHandle {
    peer_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl TcpConnectionHandle {
    pub fn new(peer_addr: SocketAddr, shutdown: CancellationToken) -> Self {
        Self {
            peer_addr,
            shutdown,
        }
    }
}

impl ForwardConnection for TcpConnectionHandle {
    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer_addr)
    }

    fn close(&mut self) {
        self.shutdown.cancel();
    }
}
