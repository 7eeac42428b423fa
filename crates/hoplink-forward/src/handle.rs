//! Client side of the registry

use crate::channel::{ChannelLease, DataChannel};
use crate::conn::{ForwardConnection, ForwardListener};
use crate::endpoint::EndpointInfo;
use crate::error::ForwardError;
use crate::request::{ForwardRequest, Reply};
use crate::Seq;
use tokio::sync::{mpsc, oneshot};

/// Cloneable handle to a running [`ForwardManager`](crate::ForwardManager)
///
/// Every method enqueues one request and waits for its reply, so a caller's
/// next request always observes the previous one fully applied.
#[derive(Debug, Clone)]
pub struct ForwardHandle {
    requests: mpsc::Sender<ForwardRequest>,
}

impl ForwardHandle {
    pub fn new(requests: mpsc::Sender<ForwardRequest>) -> Self {
        Self { requests }
    }

    /// Enqueue a raw request. Replies, if any, go to the request's own slot.
    pub async fn submit(&self, request: ForwardRequest) -> Result<(), ForwardError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| ForwardError::ManagerStopped)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> ForwardRequest,
    ) -> Result<T, ForwardError> {
        let (reply, response) = oneshot::channel();
        self.submit(build(reply)).await?;
        response.await.map_err(|_| ForwardError::ManagerStopped)
    }

    /// Reserve a fresh sequence number for a connection on `(uuid, port)`
    pub async fn allocate_sequence(
        &self,
        uuid: impl Into<String>,
        port: impl Into<String>,
    ) -> Result<Seq, ForwardError> {
        let (uuid, port) = (uuid.into(), port.into());
        self.request(|reply| ForwardRequest::AllocateSequence { uuid, port, reply })
            .await
    }

    /// Register the listener of a forwarded port.
    ///
    /// An existing endpoint for the same `(uuid, port)` is replaced without
    /// being closed; close it first with [`close_endpoint`](Self::close_endpoint).
    pub async fn create_endpoint(
        &self,
        uuid: impl Into<String>,
        port: impl Into<String>,
        listener: impl ForwardListener,
    ) -> Result<(), ForwardError> {
        let (uuid, port) = (uuid.into(), port.into());
        let listener: Box<dyn ForwardListener> = Box::new(listener);
        self.request(|reply| ForwardRequest::CreateEndpoint {
            uuid,
            port,
            listener,
            reply,
        })
        .await
    }

    /// Attach an accepted connection to its endpoint and get its data channel
    pub async fn add_connection(
        &self,
        uuid: impl Into<String>,
        port: impl Into<String>,
        seq: Seq,
        conn: impl ForwardConnection,
    ) -> Result<DataChannel, ForwardError> {
        let (uuid, port) = (uuid.into(), port.into());
        let conn: Box<dyn ForwardConnection> = Box::new(conn);
        self.request(|reply| ForwardRequest::AddConnection {
            uuid,
            port,
            seq,
            conn,
            reply,
        })
        .await?
    }

    pub async fn get_data_channel(
        &self,
        uuid: impl Into<String>,
        port: impl Into<String>,
        seq: Seq,
    ) -> Result<DataChannel, ForwardError> {
        let (uuid, port) = (uuid.into(), port.into());
        self.request(|reply| ForwardRequest::GetDataChannel {
            uuid,
            port,
            seq,
            reply,
        })
        .await?
    }

    /// Find a channel knowing only its sequence.
    ///
    /// The registry stays paused until the lease is released or dropped.
    pub async fn get_data_channel_by_seq(&self, seq: Seq) -> Result<ChannelLease, ForwardError> {
        self.request(|reply| ForwardRequest::GetDataChannelBySequence { seq, reply })
            .await?
    }

    /// Close a connection and its channel. Unknown sequences are ignored.
    pub async fn close_connection(&self, seq: Seq) -> Result<(), ForwardError> {
        self.submit(ForwardRequest::CloseConnection { seq }).await
    }

    /// Close a forwarded port with all its connections.
    /// Returns the number of connections closed.
    pub async fn close_endpoint(
        &self,
        uuid: impl Into<String>,
        port: impl Into<String>,
    ) -> Result<usize, ForwardError> {
        let (uuid, port) = (uuid.into(), port.into());
        self.request(|reply| ForwardRequest::CloseEndpoint { uuid, port, reply })
            .await?
    }

    /// Close every forwarded port of a node. Returns the number of endpoints closed.
    pub async fn close_node(&self, uuid: impl Into<String>) -> Result<usize, ForwardError> {
        let uuid = uuid.into();
        self.request(|reply| ForwardRequest::CloseNode { uuid, reply })
            .await
    }

    pub async fn list_endpoints(
        &self,
        uuid: impl Into<String>,
    ) -> Result<Vec<EndpointInfo>, ForwardError> {
        let uuid = uuid.into();
        self.request(|reply| ForwardRequest::ListEndpoints { uuid, reply })
            .await
    }

    /// Close everything and stop the registry
    pub async fn shutdown(&self) -> Result<(), ForwardError> {
        self.request(|reply| ForwardRequest::Shutdown { reply }).await
    }

    /// Whether the registry task has stopped
    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }
}
