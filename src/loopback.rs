//! In-process far end of the tunnel
//!
//! Stands in for the remote node: every `Open` frame dials the target, data
//! frames are written to that connection and whatever the target answers goes
//! back as data frames under the same sequence.

use anyhow::Result;
use bytes::Bytes;
use futures::StreamExt;
use hoplink_proto::{Frame, FrameCodec, FrameType};
use hoplink_server_tcp::write_frames;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

pub struct LoopbackAgent {
    target: String,
    read_buffer_size: usize,
}

impl LoopbackAgent {
    pub fn new(target: impl Into<String>, read_buffer_size: usize) -> Self {
        Self {
            target: target.into(),
            read_buffer_size: read_buffer_size.max(1),
        }
    }

    /// Serve the tunnel until it is closed by the other side
    pub async fn run<T>(self, io: T) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let mut frames = FramedRead::new(read_half, FrameCodec);

        let (outbound, outbound_rx) = mpsc::channel(256);
        let writer = tokio::spawn(write_frames(
            outbound_rx,
            FramedWrite::new(write_half, FrameCodec),
        ));

        let mut connections: HashMap<u64, mpsc::Sender<Bytes>> = HashMap::new();

        while let Some(frame) = frames.next().await {
            let frame = frame?;
            let seq = frame.seq;

            match frame.frame_type {
                FrameType::Open => {
                    let (tx, rx) = mpsc::channel(16);
                    connections.insert(seq, tx);
                    tokio::spawn(serve(
                        self.target.clone(),
                        seq,
                        rx,
                        outbound.clone(),
                        self.read_buffer_size,
                    ));
                }
                FrameType::Data => {
                    let Some(tx) = connections.get(&seq) else {
                        debug!(seq, "Data for unknown connection dropped");
                        continue;
                    };
                    if tx.send(frame.payload).await.is_err() {
                        connections.remove(&seq);
                    }
                }
                FrameType::Close => {
                    connections.remove(&seq);
                }
            }
        }

        info!("Tunnel closed, dropping {} connection(s)", connections.len());
        drop(connections);
        drop(outbound);
        writer.abort();
        Ok(())
    }
}

async fn serve(
    target: String,
    seq: u64,
    mut inbound: mpsc::Receiver<Bytes>,
    tunnel: mpsc::Sender<Frame>,
    buffer_size: usize,
) {
    let stream = match TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(seq, "Failed to connect to {}: {}", target, e);
            let _ = tunnel.send(Frame::close(seq)).await;
            return;
        }
    };
    debug!(seq, "Connected to {}", target);

    let (mut target_read, mut target_write) = stream.into_split();

    let upstream = async {
        while let Some(data) = inbound.recv().await {
            if let Err(e) = target_write.write_all(&data).await {
                debug!(seq, "Failed to write to target: {}", e);
                break;
            }
        }
        let _ = target_write.shutdown().await;
    };

    let downstream = async {
        let mut buffer = vec![0u8; buffer_size];
        loop {
            match target_read.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => {
                    let frame = Frame::data(seq, Bytes::copy_from_slice(&buffer[..n]));
                    if tunnel.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(seq, "Error reading from target: {}", e);
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = upstream => {}
        _ = downstream => {}
    }

    let _ = tunnel.send(Frame::close(seq)).await;
    debug!(seq, "Target connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut read, mut write) = socket.split();
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                });
            }
        });

        addr.to_string()
    }

    #[tokio::test]
    async fn test_agent_relays_to_target() {
        let target = echo_server().await;
        let (relay_side, agent_side) = tokio::io::duplex(4096);
        tokio::spawn(LoopbackAgent::new(target, 1024).run(agent_side));

        let (read_half, write_half) = tokio::io::split(relay_side);
        let mut frames = FramedRead::new(read_half, FrameCodec);
        let mut sink = FramedWrite::new(write_half, FrameCodec);

        sink.send(Frame::open(7)).await.unwrap();
        sink.send(Frame::data(7, Bytes::from("ping"))).await.unwrap();

        let mut echoed = Vec::new();
        while echoed.len() < 4 {
            let frame = timeout(Duration::from_secs(5), frames.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(frame.seq, 7);
            assert_eq!(frame.frame_type, FrameType::Data);
            echoed.extend_from_slice(&frame.payload);
        }
        assert_eq!(echoed, b"ping");

        // Closing the sequence closes the target connection, which is echoed back
        sink.send(Frame::close(7)).await.unwrap();
        let frame = timeout(Duration::from_secs(5), frames.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame, Frame::close(7));
    }

    #[tokio::test]
    async fn test_unreachable_target_closes_sequence() {
        // Bind then drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();

        let (relay_side, agent_side) = tokio::io::duplex(4096);
        tokio::spawn(LoopbackAgent::new(addr.to_string(), 1024).run(agent_side));

        let (read_half, write_half) = tokio::io::split(relay_side);
        let mut frames = FramedRead::new(read_half, FrameCodec);
        let mut sink = FramedWrite::new(write_half, FrameCodec);

        sink.send(Frame::open(1)).await.unwrap();

        let frame = timeout(Duration::from_secs(5), frames.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame, Frame::close(1));
    }
}
