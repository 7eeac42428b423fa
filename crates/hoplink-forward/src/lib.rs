//! Forward registry for multi-hop TCP port forwarding
//!
//! Nodes open forwarded ports; every connection accepted on such a port gets a
//! globally unique sequence number bound to an in-memory [`DataChannel`]. The
//! tunnel side only ever sees sequence numbers and uses them to find the
//! channel to pump bytes through.
//!
//! All registry state lives inside a single [`ForwardManager`] task. Callers
//! talk to it through a cloneable [`ForwardHandle`]; each request carries its
//! own reply slot, and requests are applied strictly one at a time.

pub mod channel;
pub mod config;
pub mod conn;
pub mod endpoint;
pub mod error;
pub mod handle;
pub mod manager;
pub mod request;

pub use channel::{ChannelLease, DataChannel};
pub use config::ForwardConfig;
pub use conn::{ForwardConnection, ForwardListener};
pub use endpoint::EndpointInfo;
pub use error::{ChannelError, ForwardError};
pub use handle::ForwardHandle;
pub use manager::ForwardManager;
pub use request::{ForwardRequest, Reply, RequestKind};

/// Connection sequence number, the routing key of the tunnel protocol
pub type Seq = u64;
