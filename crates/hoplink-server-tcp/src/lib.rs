//! TCP side of a forwarded port
//!
//! Accepts connections on a node's forwarded port, registers each one with the
//! forward registry and pumps its bytes to and from the tunnel as frames.

pub mod handles;
pub mod server;
pub mod tunnel;

pub use handles::{TcpConnectionHandle, TcpListenerHandle};
pub use server::{ForwardServer, ForwardServerConfig, ForwardServerError};
pub use tunnel::{write_frames, TunnelDemux, DEFAULT_SEND_TIMEOUT};
