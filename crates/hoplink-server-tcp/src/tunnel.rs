//! Tunnel side of the forward registry
//!
//! Frames coming back through the tunnel only carry a sequence number, so the
//! demultiplexer looks the data channel up by sequence and pushes the payload
//! into it while holding the lease.

use crate::server::ForwardServerError;
use futures::{Sink, SinkExt, Stream, StreamExt};
use hoplink_forward::{ForwardError, ForwardHandle};
use hoplink_proto::{Frame, FrameError, FrameType};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How long a data frame may wait for room in a connection's channel
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Routes inbound tunnel frames to forwarded connections
#[derive(Debug, Clone)]
pub struct TunnelDemux {
    registry: ForwardHandle,
    send_timeout: Duration,
}

impl TunnelDemux {
    pub fn new(registry: ForwardHandle) -> Self {
        Self {
            registry,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// Limit how long a data frame may keep the registry paused.
    /// A connection that cannot take its data in time is closed.
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    /// Apply one inbound frame.
    ///
    /// Frames for unknown or already closed sequences are dropped. Only a
    /// stopped registry is reported as an error.
    pub async fn dispatch(&self, frame: Frame) -> Result<(), ForwardError> {
        let seq = frame.seq;

        match frame.frame_type {
            FrameType::Data => {
                let lease = match self.registry.get_data_channel_by_seq(seq).await {
                    Ok(lease) => lease,
                    Err(ForwardError::ManagerStopped) => return Err(ForwardError::ManagerStopped),
                    Err(e) => {
                        debug!(seq, "Dropping data frame: {}", e);
                        return Ok(());
                    }
                };

                let sent =
                    tokio::time::timeout(self.send_timeout, lease.channel().send(frame.payload))
                        .await;
                lease.release();

                match sent {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => debug!(seq, "Data channel closed, dropping data frame"),
                    Err(_) => {
                        warn!(
                            seq,
                            "Connection did not accept data within {:?}, closing it",
                            self.send_timeout
                        );
                        self.registry.close_connection(seq).await?;
                    }
                }
            }
            FrameType::Close => {
                debug!(seq, "Remote side closed connection");
                self.registry.close_connection(seq).await?;
            }
            FrameType::Open => {
                warn!(seq, "Unexpected open frame from tunnel");
            }
        }

        Ok(())
    }

    /// Dispatch frames until the tunnel ends
    pub async fn run<S>(&self, mut frames: S) -> Result<(), ForwardServerError>
    where
        S: Stream<Item = Result<Frame, FrameError>> + Unpin,
    {
        while let Some(frame) = frames.next().await {
            self.dispatch(frame?).await?;
        }

        info!("Tunnel reader finished");
        Ok(())
    }
}

/// Drain outbound frames into the tunnel sink
pub async fn write_frames<S>(mut frames: mpsc::Receiver<Frame>, mut sink: S) -> Result<(), FrameError>
where
    S: Sink<Frame, Error = FrameError> + Unpin,
{
    while let Some(frame) = frames.recv().await {
        sink.send(frame).await?;
    }

    sink.close().await
}
