//! Registry entities

use crate::channel::DataChannel;
use crate::conn::{ForwardConnection, ForwardListener};
use crate::Seq;
use std::collections::HashMap;
use std::net::SocketAddr;

/// One forwarded port on one node
pub(crate) struct ForwardEndpoint {
    pub(crate) listener: Box<dyn ForwardListener>,
    pub(crate) connections: HashMap<Seq, ConnectionState>,
}

impl ForwardEndpoint {
    pub(crate) fn new(listener: Box<dyn ForwardListener>) -> Self {
        Self {
            listener,
            connections: HashMap::new(),
        }
    }

    /// Close every connection and the listener, returning the closed sequences
    pub(crate) fn close(&mut self) -> Vec<Seq> {
        let mut closed: Vec<Seq> = Vec::with_capacity(self.connections.len());
        for (seq, mut state) in self.connections.drain() {
            state.close();
            closed.push(seq);
        }
        self.listener.close();
        closed
    }

    pub(crate) fn info(&self, port: &str) -> EndpointInfo {
        EndpointInfo {
            port: port.to_string(),
            local_addr: self.listener.local_addr(),
            active_connections: self.connections.len(),
        }
    }
}

/// One accepted connection being tunneled
pub(crate) struct ConnectionState {
    pub(crate) conn: Box<dyn ForwardConnection>,
    pub(crate) channel: DataChannel,
}

impl ConnectionState {
    pub(crate) fn close(&mut self) {
        self.conn.close();
        self.channel.close();
    }
}

/// Reverse index entry from a sequence to the endpoint owning it
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SequenceBinding {
    pub(crate) uuid: String,
    pub(crate) port: String,
}

/// Snapshot of a forwarded port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub port: String,
    pub local_addr: Option<SocketAddr>,
    pub active_connections: usize,
}
