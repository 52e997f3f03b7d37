//! Per-peer outbound queues and their sender tasks
//!
//! Each (peer, stream) link owns a small bounded queue drained by one task.
//! The broadcaster only ever calls [`StreamQueue::try_enqueue`], so a slow
//! receiver fills its own queue and loses its own newest units without
//! delaying anyone else.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::protocol::StreamKind;
use crate::relay::registry::{PeerKey, PeerRegistry};
use crate::relay::RelayStats;

/// Item carried by an outbound queue
#[derive(Debug, Clone)]
pub enum Outbound {
    /// One forwardable unit, already framed for the link
    Unit(Bytes),
    /// Stop draining and close the link
    Close,
}

/// Result of a non-blocking enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queue full; the new unit was discarded
    Dropped,
    /// Sender task has exited
    Closed,
}

/// Producer handle for one link's queue
#[derive(Debug, Clone)]
pub struct StreamQueue {
    tx: mpsc::Sender<Outbound>,
    kind: StreamKind,
    link_id: u64,
}

/// Consumer end, handed to the sender task
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::Receiver<Outbound>,
    kind: StreamKind,
    link_id: u64,
}

impl StreamQueue {
    /// Create a bounded queue for one link
    pub fn channel(kind: StreamKind, link_id: u64, depth: usize) -> (StreamQueue, QueueReceiver) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (
            StreamQueue { tx, kind, link_id },
            QueueReceiver { rx, kind, link_id },
        )
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    /// Enqueue without waiting; a full queue drops the new unit
    pub fn try_enqueue(&self, unit: Bytes) -> EnqueueOutcome {
        match self.tx.try_send(Outbound::Unit(unit)) {
            Ok(()) => EnqueueOutcome::Queued,
            Err(TrySendError::Full(_)) => EnqueueOutcome::Dropped,
            Err(TrySendError::Closed(_)) => EnqueueOutcome::Closed,
        }
    }

    /// Ask the sender task to stop.
    ///
    /// If the queue is full the sentinel cannot be queued; the task then stops
    /// once every handle is dropped and the backlog is drained.
    pub fn close(&self) {
        let _ = self.tx.try_send(Outbound::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl QueueReceiver {
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    /// Take a queued item without waiting
    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.rx.try_recv().ok()
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn link_id(&self) -> u64 {
        self.link_id
    }
}

/// Where a sender task writes
#[derive(Debug)]
pub enum LinkSink {
    Stream(OwnedWriteHalf),
    Datagram { socket: Arc<UdpSocket>, addr: SocketAddr },
}

impl LinkSink {
    async fn send(&mut self, unit: &[u8]) -> std::io::Result<()> {
        match self {
            LinkSink::Stream(writer) => writer.write_all(unit).await,
            LinkSink::Datagram { socket, addr } => socket.send_to(unit, *addr).await.map(|_| ()),
        }
    }

    async fn shutdown(&mut self) {
        if let LinkSink::Stream(writer) = self {
            let _ = writer.shutdown().await;
        }
    }
}

/// Why a sender task stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderExit {
    /// Close sentinel received
    Closed,
    /// All queue handles dropped
    Detached,
    /// Writing to the peer failed
    Failed(String),
}

/// Spawn the task draining `queue` into `sink`.
///
/// When it stops for any reason it releases its link from the registry;
/// releasing an already replaced or removed link does nothing.
pub fn spawn_sender(
    key: PeerKey,
    queue: QueueReceiver,
    sink: LinkSink,
    registry: Arc<PeerRegistry>,
    stats: Arc<RelayStats>,
) -> JoinHandle<SenderExit> {
    tokio::spawn(async move {
        let kind = queue.kind();
        let link_id = queue.link_id();
        let exit = run_sender(queue, sink, &stats).await;

        match &exit {
            SenderExit::Failed(reason) => {
                tracing::warn!(peer = %key, stream = %kind, "Send failed: {}", reason);
            }
            _ => tracing::debug!(peer = %key, stream = %kind, "Sender stopped: {:?}", exit),
        }

        if let Some(released) = registry.release(&key, kind, link_id) {
            if released.peer_removed {
                tracing::info!(peer = %key, "Peer removed");
            }
        }
        exit
    })
}

async fn run_sender(mut queue: QueueReceiver, mut sink: LinkSink, stats: &RelayStats) -> SenderExit {
    let exit = loop {
        match queue.recv().await {
            Some(Outbound::Unit(unit)) => {
                if let Err(e) = sink.send(&unit).await {
                    break SenderExit::Failed(e.to_string());
                }
                stats.units_sent.fetch_add(1, Ordering::Relaxed);
            }
            Some(Outbound::Close) => break SenderExit::Closed,
            None => break SenderExit::Detached,
        }
    };
    sink.shutdown().await;
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn test_full_queue_drops_newest() {
        let (queue, mut rx) = StreamQueue::channel(StreamKind::Video, 1, 2);

        assert_eq!(queue.try_enqueue(Bytes::from_static(b"1")), EnqueueOutcome::Queued);
        assert_eq!(queue.try_enqueue(Bytes::from_static(b"2")), EnqueueOutcome::Queued);
        assert_eq!(queue.try_enqueue(Bytes::from_static(b"3")), EnqueueOutcome::Dropped);

        match rx.try_recv().unwrap() {
            Outbound::Unit(unit) => assert_eq!(&unit[..], b"1"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_enqueue_after_receiver_dropped() {
        let (queue, rx) = StreamQueue::channel(StreamKind::Chat, 1, 2);
        drop(rx);
        assert_eq!(queue.try_enqueue(Bytes::from_static(b"x")), EnqueueOutcome::Closed);
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_sender_writes_to_stream_and_stops_on_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        let (_read, write) = server_side.into_split();

        let registry = Arc::new(PeerRegistry::new(Duration::from_secs(5)));
        let stats = Arc::new(RelayStats::default());
        let key = PeerKey::Host("127.0.0.1".parse().unwrap());
        let (queue, rx) = StreamQueue::channel(StreamKind::Chat, registry.next_link_id(), 4);
        registry.attach(key, queue.clone(), None, Instant::now());

        let handle = spawn_sender(key, rx, LinkSink::Stream(write), registry.clone(), stats.clone());
        queue.try_enqueue(Bytes::from_static(b"hello"));
        queue.close();

        assert_eq!(handle.await.unwrap(), SenderExit::Closed);
        assert_eq!(stats.units_sent.load(Ordering::Relaxed), 1);
        assert!(!registry.contains(&key));

        let mut client = client;
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
    }

    #[tokio::test]
    async fn test_sender_detaches_when_handles_dropped() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let registry = Arc::new(PeerRegistry::new(Duration::from_secs(5)));
        let stats = Arc::new(RelayStats::default());
        let (queue, rx) = StreamQueue::channel(StreamKind::Datagram, 1, 4);

        let handle = spawn_sender(
            PeerKey::Datagram(addr),
            rx,
            LinkSink::Datagram { socket, addr },
            registry,
            stats,
        );
        drop(queue);
        assert_eq!(handle.await.unwrap(), SenderExit::Detached);
    }
}
