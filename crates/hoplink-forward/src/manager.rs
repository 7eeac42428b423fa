//! Registry task owning all forwarding state
//!
//! Requests are applied one at a time, end to end, so the maps below need no
//! lock. Handlers are plain methods; `run` only dequeues and replies.

use crate::channel::{ChannelLease, DataChannel};
use crate::config::ForwardConfig;
use crate::conn::{ForwardConnection, ForwardListener};
use crate::endpoint::{ConnectionState, EndpointInfo, ForwardEndpoint, SequenceBinding};
use crate::error::ForwardError;
use crate::handle::ForwardHandle;
use crate::request::ForwardRequest;
use crate::Seq;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Owner of every endpoint, connection and sequence binding
pub struct ForwardManager {
    config: ForwardConfig,
    next_seq: Seq,
    /// node uuid -> port -> endpoint
    endpoints: HashMap<String, HashMap<String, ForwardEndpoint>>,
    bindings: HashMap<Seq, SequenceBinding>,
}

impl ForwardManager {
    pub fn new(config: ForwardConfig) -> Self {
        Self {
            config,
            next_seq: 0,
            endpoints: HashMap::new(),
            bindings: HashMap::new(),
        }
    }

    /// Spawn the registry on the current tokio runtime
    pub fn spawn(config: ForwardConfig) -> ForwardHandle {
        let (tx, rx) = mpsc::channel(config.queue_depth());
        let manager = Self::new(config);
        tokio::spawn(manager.run(rx));
        ForwardHandle::new(tx)
    }

    /// Serve requests until every handle is gone or a shutdown is requested
    pub async fn run(mut self, mut requests: mpsc::Receiver<ForwardRequest>) {
        debug!("Forward manager started");

        while let Some(request) = requests.recv().await {
            trace!(kind = %request.kind(), "Handling forward request");

            match request {
                ForwardRequest::AllocateSequence { uuid, port, reply } => {
                    let _ = reply.send(self.allocate_sequence(uuid, port));
                }
                ForwardRequest::CreateEndpoint {
                    uuid,
                    port,
                    listener,
                    reply,
                } => {
                    self.create_endpoint(uuid, port, listener);
                    let _ = reply.send(());
                }
                ForwardRequest::AddConnection {
                    uuid,
                    port,
                    seq,
                    conn,
                    reply,
                } => {
                    let _ = reply.send(self.add_connection(&uuid, &port, seq, conn));
                }
                ForwardRequest::GetDataChannel {
                    uuid,
                    port,
                    seq,
                    reply,
                } => {
                    let _ = reply.send(self.get_data_channel(&uuid, &port, seq));
                }
                ForwardRequest::GetDataChannelBySequence { seq, reply } => {
                    match self.lease_by_sequence(seq) {
                        Ok((lease, released)) => {
                            // Hold every other request until the lease holder is done
                            if reply.send(Ok(lease)).is_ok() {
                                let _ = released.await;
                                trace!(seq, "Channel lease released");
                            }
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                ForwardRequest::CloseConnection { seq } => self.close_connection(seq),
                ForwardRequest::CloseEndpoint { uuid, port, reply } => {
                    let _ = reply.send(self.close_endpoint(&uuid, &port));
                }
                ForwardRequest::CloseNode { uuid, reply } => {
                    let _ = reply.send(self.close_node(&uuid));
                }
                ForwardRequest::ListEndpoints { uuid, reply } => {
                    let _ = reply.send(self.list_endpoints(&uuid));
                }
                ForwardRequest::Shutdown { reply } => {
                    self.close_all();
                    let _ = reply.send(());
                    break;
                }
            }
        }

        self.close_all();
        info!(allocated = self.next_seq, "Forward manager stopped");
    }

    fn allocate_sequence(&mut self, uuid: String, port: String) -> Seq {
        let seq = self.next_seq;
        trace!(seq, uuid = %uuid, port = %port, "Allocated sequence");
        self.bindings.insert(seq, SequenceBinding { uuid, port });
        self.next_seq += 1;
        seq
    }

    fn create_endpoint(&mut self, uuid: String, port: String, listener: Box<dyn ForwardListener>) {
        let ports = self.endpoints.entry(uuid.clone()).or_default();
        let local_addr = listener.local_addr();

        match ports.insert(port.clone(), ForwardEndpoint::new(listener)) {
            Some(previous) => {
                // The previous listener and connections are dropped, not closed
                warn!(
                    uuid = %uuid,
                    port = %port,
                    discarded_connections = previous.connections.len(),
                    "Replaced an active forward endpoint"
                );
            }
            None => {
                debug!(uuid = %uuid, port = %port, ?local_addr, "Registered forward endpoint");
            }
        }
    }

    fn add_connection(
        &mut self,
        uuid: &str,
        port: &str,
        seq: Seq,
        conn: Box<dyn ForwardConnection>,
    ) -> Result<DataChannel, ForwardError> {
        let capacity = self.config.channel_capacity();
        let endpoint = self
            .endpoints
            .get_mut(uuid)
            .and_then(|ports| ports.get_mut(port))
            .ok_or_else(|| ForwardError::endpoint_not_found(uuid, port))?;

        let peer_addr = conn.peer_addr();
        let channel = DataChannel::new(capacity);
        let state = ConnectionState {
            conn,
            channel: channel.clone(),
        };

        if endpoint.connections.insert(seq, state).is_some() {
            warn!(seq, uuid = %uuid, port = %port, "Replaced an active connection");
        }
        debug!(seq, uuid = %uuid, port = %port, ?peer_addr, "Added connection");

        Ok(channel)
    }

    fn get_data_channel(&self, uuid: &str, port: &str, seq: Seq) -> Result<DataChannel, ForwardError> {
        let endpoint = self
            .endpoints
            .get(uuid)
            .and_then(|ports| ports.get(port))
            .ok_or_else(|| ForwardError::endpoint_not_found(uuid, port))?;

        endpoint
            .connections
            .get(&seq)
            .map(|state| state.channel.clone())
            .ok_or(ForwardError::ConnectionNotFound(seq))
    }

    fn lease_by_sequence(
        &self,
        seq: Seq,
    ) -> Result<(ChannelLease, oneshot::Receiver<()>), ForwardError> {
        let binding = self
            .bindings
            .get(&seq)
            .ok_or(ForwardError::SequenceNotBound(seq))?;

        let channel = self
            .endpoints
            .get(&binding.uuid)
            .and_then(|ports| ports.get(&binding.port))
            .and_then(|endpoint| endpoint.connections.get(&seq))
            .map(|state| state.channel.clone())
            .ok_or(ForwardError::ConnectionNotFound(seq))?;

        Ok(ChannelLease::new(seq, channel))
    }

    fn close_connection(&mut self, seq: Seq) {
        let Some(binding) = self.bindings.get(&seq) else {
            trace!(seq, "Close for unbound sequence ignored");
            return;
        };

        let state = self
            .endpoints
            .get_mut(&binding.uuid)
            .and_then(|ports| ports.get_mut(&binding.port))
            .and_then(|endpoint| endpoint.connections.remove(&seq));

        match state {
            Some(mut state) => {
                state.close();
                // Only a sequence that had a connection gives up its binding
                if self.config.reclaim_bindings {
                    self.bindings.remove(&seq);
                }
                debug!(seq, "Closed connection");
            }
            None => trace!(seq, "Connection already closed"),
        }
    }

    fn close_endpoint(&mut self, uuid: &str, port: &str) -> Result<usize, ForwardError> {
        let ports = self
            .endpoints
            .get_mut(uuid)
            .ok_or_else(|| ForwardError::endpoint_not_found(uuid, port))?;
        let mut endpoint = ports
            .remove(port)
            .ok_or_else(|| ForwardError::endpoint_not_found(uuid, port))?;

        if ports.is_empty() {
            self.endpoints.remove(uuid);
        }

        let closed = endpoint.close();
        self.reclaim(|binding| binding.uuid == uuid && binding.port == port);

        info!(uuid = %uuid, port = %port, connections = closed.len(), "Closed forward endpoint");
        Ok(closed.len())
    }

    fn close_node(&mut self, uuid: &str) -> usize {
        let Some(ports) = self.endpoints.remove(uuid) else {
            return 0;
        };

        let count = ports.len();
        for (port, mut endpoint) in ports {
            let closed = endpoint.close();
            debug!(uuid = %uuid, port = %port, connections = closed.len(), "Closed forward endpoint");
        }

        self.reclaim(|binding| binding.uuid == uuid);

        info!(uuid = %uuid, endpoints = count, "Closed all forwards of node");
        count
    }

    fn list_endpoints(&self, uuid: &str) -> Vec<EndpointInfo> {
        let mut infos: Vec<EndpointInfo> = self
            .endpoints
            .get(uuid)
            .map(|ports| {
                ports
                    .iter()
                    .map(|(port, endpoint)| endpoint.info(port))
                    .collect()
            })
            .unwrap_or_default();

        infos.sort_by(|a, b| a.port.cmp(&b.port));
        infos
    }

    fn close_all(&mut self) {
        let nodes: Vec<String> = self.endpoints.keys().cloned().collect();
        for uuid in nodes {
            self.close_node(&uuid);
        }
    }

    /// Drop every binding, reserved or live, that points into a closed endpoint
    fn reclaim(&mut self, closed: impl Fn(&SequenceBinding) -> bool) {
        if self.config.reclaim_bindings {
            self.bindings.retain(|_, binding| !closed(binding));
        }
    }
}
