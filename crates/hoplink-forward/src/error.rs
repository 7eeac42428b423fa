//! Registry error types

use crate::Seq;
use thiserror::Error;

/// Forward registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForwardError {
    #[error("No forward endpoint for node {uuid} on port {port}")]
    EndpointNotFound { uuid: String, port: String },

    #[error("Sequence {0} is not bound to any endpoint")]
    SequenceNotBound(Seq),

    #[error("No active connection for sequence {0}")]
    ConnectionNotFound(Seq),

    #[error("Forward manager has stopped")]
    ManagerStopped,
}

impl ForwardError {
    pub(crate) fn endpoint_not_found(uuid: &str, port: &str) -> Self {
        Self::EndpointNotFound {
            uuid: uuid.to_string(),
            port: port.to_string(),
        }
    }
}

/// Data channel errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("Data channel is closed")]
    Closed,
}
