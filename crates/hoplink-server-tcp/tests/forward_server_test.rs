//! Forwarded port tests over real TCP sockets
//!
//! The tunnel is an in-process channel: frames the server emits land in a
//! receiver the test reads, and frames from the far side are fed through a
//! `TunnelDemux`.

use bytes::Bytes;
use hoplink_forward::{ForwardConfig, ForwardError, ForwardHandle, ForwardManager};
use hoplink_proto::{Frame, FrameType};
use hoplink_server_tcp::{ForwardServer, ForwardServerConfig, TunnelDemux};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

struct Harness {
    registry: ForwardHandle,
    frames: mpsc::Receiver<Frame>,
    addr: std::net::SocketAddr,
    port: String,
    server: tokio::task::JoinHandle<()>,
}

async fn start_server(node: &str) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let registry = ForwardManager::spawn(ForwardConfig::default());
    let (tunnel, frames) = mpsc::channel(64);

    let config = ForwardServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        node_uuid: node.to_string(),
        ..Default::default()
    };
    let server = ForwardServer::bind(config, registry.clone(), tunnel)
        .await
        .unwrap();
    let addr = server.local_addr();
    let port = server.port().to_string();
    assert_eq!(port, addr.port().to_string());

    let server = tokio::spawn(server.run());

    Harness {
        registry,
        frames,
        addr,
        port,
        server,
    }
}

async fn next_frame(frames: &mut mpsc::Receiver<Frame>) -> Frame {
    timeout(Duration::from_secs(5), frames.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("tunnel closed")
}

/// Collect data frames for `seq` until `len` bytes arrived
async fn read_data(frames: &mut mpsc::Receiver<Frame>, seq: u64, len: usize) -> Vec<u8> {
    let mut data = Vec::new();
    while data.len() < len {
        let frame = next_frame(frames).await;
        assert_eq!(frame.seq, seq);
        assert_eq!(frame.frame_type, FrameType::Data);
        data.extend_from_slice(&frame.payload);
    }
    data
}

#[tokio::test]
async fn test_bytes_flow_both_ways() {
    let mut h = start_server("node-a").await;
    let demux = TunnelDemux::new(h.registry.clone());

    let mut client = TcpStream::connect(h.addr).await.unwrap();

    let open = next_frame(&mut h.frames).await;
    assert_eq!(open.frame_type, FrameType::Open);
    let seq = open.seq;
    assert_eq!(seq, 0);

    client.write_all(b"hello").await.unwrap();
    assert_eq!(read_data(&mut h.frames, seq, 5).await, b"hello");

    demux
        .dispatch(Frame::data(seq, Bytes::from("world")))
        .await
        .unwrap();
    let mut buf = [0u8; 5];
    timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"world");

    let endpoints = h.registry.list_endpoints("node-a").await.unwrap();
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0].port, h.port);
    assert_eq!(endpoints[0].local_addr, Some(h.addr));
    assert_eq!(endpoints[0].active_connections, 1);

    // Far side closes: the client sees EOF and the registry forgets the sequence
    demux.dispatch(Frame::close(seq)).await.unwrap();
    let n = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    let endpoints = h.registry.list_endpoints("node-a").await.unwrap();
    assert_eq!(endpoints[0].active_connections, 0);
    assert_eq!(
        h.registry.get_data_channel_by_seq(seq).await.unwrap_err(),
        ForwardError::ConnectionNotFound(seq)
    );
}

#[tokio::test]
async fn test_client_disconnect_sends_close_frame() {
    let mut h = start_server("node-a").await;

    let client = TcpStream::connect(h.addr).await.unwrap();
    let seq = next_frame(&mut h.frames).await.seq;

    drop(client);

    let close = next_frame(&mut h.frames).await;
    assert_eq!(close, Frame::close(seq));

    // The close request follows the close frame; poll until it is applied
    timeout(Duration::from_secs(5), async {
        loop {
            match h.registry.get_data_channel("node-a", h.port.clone(), seq).await {
                Err(ForwardError::ConnectionNotFound(_)) => break,
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_each_connection_gets_its_own_sequence() {
    let mut h = start_server("node-a").await;

    let _first = TcpStream::connect(h.addr).await.unwrap();
    let a = next_frame(&mut h.frames).await;
    let _second = TcpStream::connect(h.addr).await.unwrap();
    let b = next_frame(&mut h.frames).await;

    assert_eq!(a.frame_type, FrameType::Open);
    assert_eq!(b.frame_type, FrameType::Open);
    assert_ne!(a.seq, b.seq);

    let endpoints = h.registry.list_endpoints("node-a").await.unwrap();
    assert_eq!(endpoints[0].active_connections, 2);
}

#[tokio::test]
async fn test_close_endpoint_stops_server() {
    let mut h = start_server("node-a").await;

    let mut client = TcpStream::connect(h.addr).await.unwrap();
    next_frame(&mut h.frames).await;

    assert_eq!(
        h.registry.close_endpoint("node-a", h.port.clone()).await,
        Ok(1)
    );

    timeout(Duration::from_secs(5), h.server)
        .await
        .unwrap()
        .unwrap();

    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    assert!(h.registry.list_endpoints("node-a").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_client_that_stops_reading_does_not_stall_registry() {
    let mut h = start_server("node-a").await;
    let demux =
        TunnelDemux::new(h.registry.clone()).with_send_timeout(Duration::from_millis(200));

    // Connected but never reads
    let _client = TcpStream::connect(h.addr).await.unwrap();
    let seq = next_frame(&mut h.frames).await.seq;

    let chunk = Bytes::from(vec![0u8; 1024 * 1024]);
    let pusher = {
        let registry = h.registry.clone();
        tokio::spawn(async move {
            loop {
                demux.dispatch(Frame::data(seq, chunk.clone())).await.unwrap();
                let endpoints = registry.list_endpoints("node-a").await.unwrap();
                if endpoints[0].active_connections == 0 {
                    break;
                }
            }
        })
    };

    timeout(Duration::from_secs(30), pusher)
        .await
        .expect("stalled connection was never closed")
        .unwrap();

    assert!(timeout(Duration::from_secs(3), h.registry.list_endpoints("node-a"))
        .await
        .is_ok());
    assert_eq!(
        timeout(Duration::from_secs(3), h.registry.shutdown())
            .await
            .expect("registry shutdown stalled"),
        Ok(())
    );
}
