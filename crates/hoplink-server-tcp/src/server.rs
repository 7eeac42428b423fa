//! Forwarded port server
//!
//! Listens on one forwarded port and hands every accepted connection to the
//! forward registry. Bytes read from the client go straight to the tunnel as
//! data frames; bytes coming back from the tunnel arrive through the
//! connection's data channel.

use crate::handles::{TcpConnectionHandle, TcpListenerHandle};
use bytes::Bytes;
use hoplink_forward::{ForwardError, ForwardHandle};
use hoplink_proto::{Frame, FrameError};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Forward server errors
#[derive(Debug, Error)]
pub enum ForwardServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Registry error: {0}")]
    Registry(#[from] ForwardError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Tunnel closed")]
    TunnelClosed,
}

/// Forward server configuration
#[derive(Debug, Clone)]
pub struct ForwardServerConfig {
    pub bind_addr: SocketAddr,
    /// Node the forwarded port belongs to
    pub node_uuid: String,
    /// Size of the client read buffer, and so the largest data frame
    pub read_buffer_size: usize,
}

impl Default for ForwardServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            node_uuid: uuid::Uuid::new_v4().to_string(),
            read_buffer_size: 8192,
        }
    }
}

/// What a connection task needs from its server
#[derive(Clone)]
struct ConnectionContext {
    uuid: String,
    port: String,
    registry: ForwardHandle,
    tunnel: mpsc::Sender<Frame>,
    read_buffer_size: usize,
}

/// Accept loop of one forwarded port
pub struct ForwardServer {
    config: ForwardServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    port: String,
    registry: ForwardHandle,
    tunnel: mpsc::Sender<Frame>,
    shutdown: CancellationToken,
}

impl ForwardServer {
    /// Bind the forwarded port and register it as an endpoint of `config.node_uuid`.
    ///
    /// The endpoint is keyed by the port actually bound, so a `bind_addr`
    /// with port 0 works.
    pub async fn bind(
        config: ForwardServerConfig,
        registry: ForwardHandle,
        tunnel: mpsc::Sender<Frame>,
    ) -> Result<Self, ForwardServerError> {
        let listener = Self::bind_with_retry(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let port = local_addr.port().to_string();
        let shutdown = CancellationToken::new();

        registry
            .create_endpoint(
                config.node_uuid.clone(),
                port.clone(),
                TcpListenerHandle::new(local_addr, shutdown.clone()),
            )
            .await?;

        info!(
            "Forwarding {} for node {}",
            local_addr, config.node_uuid
        );

        Ok(Self {
            config,
            listener,
            local_addr,
            port,
            registry,
            tunnel,
            shutdown,
        })
    }

    async fn bind_with_retry(bind_addr: SocketAddr) -> Result<TcpListener, ForwardServerError> {
        // Up to 3 attempts to ride out TIME_WAIT
        for attempt in 1..=3 {
            match TcpListener::bind(bind_addr).await {
                Ok(listener) => {
                    if attempt > 1 {
                        info!("Bound to {} on attempt {}/3", bind_addr, attempt);
                    }
                    return Ok(listener);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < 3 => {
                    warn!(
                        "Port {} is in use (attempt {}/3), retrying in 1 second...",
                        bind_addr.port(),
                        attempt
                    );
                    tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                }
                Err(e) => {
                    return Err(ForwardServerError::BindError {
                        address: bind_addr.ip().to_string(),
                        port: bind_addr.port(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(ForwardServerError::BindError {
            address: bind_addr.ip().to_string(),
            port: bind_addr.port(),
            reason: "Address in use after 3 retry attempts".to_string(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Port key the endpoint is registered under
    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn node_uuid(&self) -> &str {
        &self.config.node_uuid
    }

    /// Accept connections until the registry closes this endpoint
    pub async fn run(self) {
        let ctx = ConnectionContext {
            uuid: self.config.node_uuid.clone(),
            port: self.port.clone(),
            registry: self.registry.clone(),
            tunnel: self.tunnel.clone(),
            read_buffer_size: self.config.read_buffer_size.max(1),
        };

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Forward endpoint {} closed", self.local_addr);
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("Accepted connection from {} on {}", peer_addr, self.local_addr);
                        let ctx = ctx.clone();
                        let shutdown = self.shutdown.child_token();
                        tokio::spawn(async move {
                            if let Err(e) =
                                Self::handle_connection(stream, peer_addr, ctx, shutdown).await
                            {
                                error!("Failed to forward connection from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        ctx: ConnectionContext,
        shutdown: CancellationToken,
    ) -> Result<(), ForwardServerError> {
        let seq = ctx
            .registry
            .allocate_sequence(ctx.uuid.clone(), ctx.port.clone())
            .await?;
        let channel = ctx
            .registry
            .add_connection(
                ctx.uuid.clone(),
                ctx.port.clone(),
                seq,
                TcpConnectionHandle::new(peer_addr, shutdown.clone()),
            )
            .await?;

        debug!(seq, %peer_addr, uuid = %ctx.uuid, port = %ctx.port, "Forwarding connection");

        if ctx.tunnel.send(Frame::open(seq)).await.is_err() {
            ctx.registry.close_connection(seq).await?;
            return Err(ForwardServerError::TunnelClosed);
        }

        let (mut client_read, mut client_write) = stream.into_split();

        // Client -> tunnel, straight into data frames
        let client_to_tunnel = {
            let tunnel = ctx.tunnel.clone();
            let registry = ctx.registry.clone();
            let shutdown = shutdown.clone();
            let buffer_size = ctx.read_buffer_size;

            tokio::spawn(async move {
                let mut buffer = vec![0u8; buffer_size];
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        read = client_read.read(&mut buffer) => match read {
                            Ok(0) => {
                                debug!(seq, "Client closed connection");
                                break;
                            }
                            Ok(n) => {
                                trace!(seq, bytes = n, "Client -> tunnel");
                                let frame = Frame::data(seq, Bytes::copy_from_slice(&buffer[..n]));
                                if tunnel.send(frame).await.is_err() {
                                    warn!(seq, "Tunnel closed while forwarding client data");
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(seq, "Error reading from client: {}", e);
                                break;
                            }
                        }
                    }
                }

                let _ = tunnel.send(Frame::close(seq)).await;
                let _ = registry.close_connection(seq).await;
            })
        };

        // Tunnel -> client, through the registered data channel
        let tunnel_to_client = {
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        data = channel.recv() => match data {
                            Some(data) => {
                                trace!(seq, bytes = data.len(), "Tunnel -> client");
                                // A client that stops reading must not outlive its connection
                                tokio::select! {
                                    _ = shutdown.cancelled() => break,
                                    _ = channel.closed() => break,
                                    written = client_write.write_all(&data) => {
                                        if let Err(e) = written {
                                            debug!(seq, "Failed to write to client: {}", e);
                                            break;
                                        }
                                    }
                                }
                            }
                            None => break,
                        }
                    }
                }

                // A lease holder may be blocked sending into this channel
                channel.close();
                shutdown.cancel();
                let _ = client_write.shutdown().await;
            })
        };

        let _ = tokio::join!(client_to_tunnel, tunnel_to_client);

        debug!(seq, %peer_addr, "Connection closed");
        Ok(())
    }
}
