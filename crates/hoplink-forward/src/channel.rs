//! Data channels handed out by the registry

use crate::error::ChannelError;
use crate::Seq;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

/// In-memory byte channel bridging a tunneled connection and the tunnel
///
/// Clones share the same underlying queue. The tunnel side pushes chunks with
/// [`send`](Self::send), the connection pump pulls them with
/// [`recv`](Self::recv). Closing wakes every blocked sender and receiver.
#[derive(Clone)]
pub struct DataChannel {
    inner: Arc<Inner>,
}

struct Inner {
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
    closed: CancellationToken,
}

impl DataChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                tx,
                rx: Mutex::new(rx),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Queue a chunk for the connection, waiting for room if the queue is full
    pub async fn send(&self, data: Bytes) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        tokio::select! {
            biased;
            _ = self.inner.closed.cancelled() => Err(ChannelError::Closed),
            sent = self.inner.tx.send(data) => sent.map_err(|_| ChannelError::Closed),
        }
    }

    /// Next queued chunk, or `None` once the channel is closed and drained
    pub async fn recv(&self) -> Option<Bytes> {
        let mut rx = self.inner.rx.lock().await;

        tokio::select! {
            biased;
            data = rx.recv() => data,
            _ = self.inner.closed.cancelled() => None,
        }
    }

    /// Signal end-of-stream to both ends
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the channel has been closed
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Whether both handles point at the same channel
    pub fn same_channel(&self, other: &DataChannel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannel")
            .field("capacity", &self.inner.tx.max_capacity())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A data channel resolved by sequence number alone
///
/// While a lease is held the registry processes no other request. Release it
/// (or drop it) before talking to the registry again.
#[derive(Debug)]
pub struct ChannelLease {
    seq: Seq,
    channel: DataChannel,
    _release: oneshot::Sender<()>,
}

impl ChannelLease {
    pub(crate) fn new(seq: Seq, channel: DataChannel) -> (Self, oneshot::Receiver<()>) {
        let (release, released) = oneshot::channel();
        let lease = Self {
            seq,
            channel,
            _release: release,
        };
        (lease, released)
    }

    pub fn seq(&self) -> Seq {
        self.seq
    }

    pub fn channel(&self) -> &DataChannel {
        &self.channel
    }

    /// Let the registry resume
    pub fn release(self) {}

    /// Release the registry and keep the channel
    pub fn into_channel(self) -> DataChannel {
        self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_send_recv() {
        let channel = DataChannel::new(4);

        channel.send(Bytes::from("hello")).await.unwrap();
        channel.send(Bytes::from("world")).await.unwrap();

        assert_eq!(channel.recv().await, Some(Bytes::from("hello")));
        assert_eq!(channel.recv().await, Some(Bytes::from("world")));
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_receiver() {
        let channel = DataChannel::new(4);
        let reader = channel.clone();

        let handle = tokio::spawn(async move { reader.recv().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.close();

        let received = timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, None);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_sender() {
        let channel = DataChannel::new(1);
        channel.send(Bytes::from("fill")).await.unwrap();

        let writer = channel.clone();
        let handle = tokio::spawn(async move { writer.send(Bytes::from("blocked")).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        channel.close();

        let result = timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(ChannelError::Closed));
    }

    #[tokio::test]
    async fn test_queued_data_drains_after_close() {
        let channel = DataChannel::new(4);
        channel.send(Bytes::from("tail")).await.unwrap();
        channel.close();

        assert_eq!(
            channel.send(Bytes::from("late")).await,
            Err(ChannelError::Closed)
        );
        assert_eq!(channel.recv().await, Some(Bytes::from("tail")));
        assert_eq!(channel.recv().await, None);
    }

    #[test]
    fn test_same_channel() {
        let channel = DataChannel::new(1);
        let clone = channel.clone();
        let other = DataChannel::new(1);

        assert!(channel.same_channel(&clone));
        assert!(!channel.same_channel(&other));
    }

    #[tokio::test]
    async fn test_lease_release_signals_registry() {
        let (lease, released) = ChannelLease::new(7, DataChannel::new(1));
        assert_eq!(lease.seq(), 7);

        lease.release();
        assert!(released.await.is_err());
    }

    #[tokio::test]
    async fn test_lease_into_channel_releases() {
        let channel = DataChannel::new(1);
        let (lease, released) = ChannelLease::new(3, channel.clone());

        let kept = lease.into_channel();
        assert!(kept.same_channel(&channel));
        assert!(released.await.is_err());
    }
}
