//! Request protocol between callers and the registry task

use crate::channel::{ChannelLease, DataChannel};
use crate::conn::{ForwardConnection, ForwardListener};
use crate::endpoint::EndpointInfo;
use crate::error::ForwardError;
use crate::Seq;
use std::fmt;
use tokio::sync::oneshot;

/// Private reply slot carried by each request
pub type Reply<T> = oneshot::Sender<T>;

/// Operation kind of a [`ForwardRequest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    AllocateSequence,
    CreateEndpoint,
    AddConnection,
    GetDataChannel,
    GetDataChannelBySequence,
    CloseConnection,
    CloseEndpoint,
    CloseNode,
    ListEndpoints,
    Shutdown,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::AllocateSequence => "allocate_sequence",
            RequestKind::CreateEndpoint => "create_endpoint",
            RequestKind::AddConnection => "add_connection",
            RequestKind::GetDataChannel => "get_data_channel",
            RequestKind::GetDataChannelBySequence => "get_data_channel_by_sequence",
            RequestKind::CloseConnection => "close_connection",
            RequestKind::CloseEndpoint => "close_endpoint",
            RequestKind::CloseNode => "close_node",
            RequestKind::ListEndpoints => "list_endpoints",
            RequestKind::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry request
pub enum ForwardRequest {
    /// Reserve the next sequence number for `(uuid, port)`
    AllocateSequence {
        uuid: String,
        port: String,
        reply: Reply<Seq>,
    },
    /// Register (or silently replace) the endpoint for `(uuid, port)`
    CreateEndpoint {
        uuid: String,
        port: String,
        listener: Box<dyn ForwardListener>,
        reply: Reply<()>,
    },
    /// Attach an accepted connection to an existing endpoint
    AddConnection {
        uuid: String,
        port: String,
        seq: Seq,
        conn: Box<dyn ForwardConnection>,
        reply: Reply<Result<DataChannel, ForwardError>>,
    },
    GetDataChannel {
        uuid: String,
        port: String,
        seq: Seq,
        reply: Reply<Result<DataChannel, ForwardError>>,
    },
    /// Resolve a channel by sequence alone. A successful reply pauses the
    /// registry until the returned lease is released.
    GetDataChannelBySequence {
        seq: Seq,
        reply: Reply<Result<ChannelLease, ForwardError>>,
    },
    /// Tear down a connection. Unknown sequences are ignored; no reply.
    CloseConnection { seq: Seq },
    CloseEndpoint {
        uuid: String,
        port: String,
        reply: Reply<Result<usize, ForwardError>>,
    },
    CloseNode { uuid: String, reply: Reply<usize> },
    ListEndpoints {
        uuid: String,
        reply: Reply<Vec<EndpointInfo>>,
    },
    Shutdown { reply: Reply<()> },
}

impl ForwardRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            ForwardRequest::AllocateSequence { .. } => RequestKind::AllocateSequence,
            ForwardRequest::CreateEndpoint { .. } => RequestKind::CreateEndpoint,
            ForwardRequest::AddConnection { .. } => RequestKind::AddConnection,
            ForwardRequest::GetDataChannel { .. } => RequestKind::GetDataChannel,
            ForwardRequest::GetDataChannelBySequence { .. } => {
                RequestKind::GetDataChannelBySequence
            }
            ForwardRequest::CloseConnection { .. } => RequestKind::CloseConnection,
            ForwardRequest::CloseEndpoint { .. } => RequestKind::CloseEndpoint,
            ForwardRequest::CloseNode { .. } => RequestKind::CloseNode,
            ForwardRequest::ListEndpoints { .. } => RequestKind::ListEndpoints,
            ForwardRequest::Shutdown { .. } => RequestKind::Shutdown,
        }
    }
}

impl fmt::Debug for ForwardRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("ForwardRequest");
        out.field("kind", &self.kind());
        match self {
            ForwardRequest::AllocateSequence { uuid, port, .. }
            | ForwardRequest::CreateEndpoint { uuid, port, .. }
            | ForwardRequest::CloseEndpoint { uuid, port, .. } => {
                out.field("uuid", uuid).field("port", port);
            }
            ForwardRequest::AddConnection {
                uuid, port, seq, ..
            }
            | ForwardRequest::GetDataChannel {
                uuid, port, seq, ..
            } => {
                out.field("uuid", uuid).field("port", port).field("seq", seq);
            }
            ForwardRequest::GetDataChannelBySequence { seq, .. }
            | ForwardRequest::CloseConnection { seq } => {
                out.field("seq", seq);
            }
            ForwardRequest::CloseNode { uuid, .. } | ForwardRequest::ListEndpoints { uuid, .. } => {
                out.field("uuid", uuid);
            }
            ForwardRequest::Shutdown { .. } => {}
        }
        out.finish()
    }
}
