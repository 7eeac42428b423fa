//! Tunnel frame definitions
//!
//! Every byte moved through a tunnel travels in a [`Frame`] tagged with the
//! sequence number of the forwarded connection it belongs to.

pub mod codec;
pub mod frame;

pub use codec::FrameCodec;
pub use frame::{Frame, FrameError, FrameType};

/// Maximum frame payload size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;
