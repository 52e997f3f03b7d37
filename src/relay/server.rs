//! Relay server
//!
//! One task receives on the shared datagram socket, one accept loop runs per
//! reliable stream port, and every accepted connection gets a reader task.
//! All of them forward through [`BroadcastRelay`], which only enqueues onto
//! per-peer queues drained by their own sender tasks.

use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{IdentityMode, RelayConfig, RelayFraming};
use crate::constants::MAX_DATAGRAM_SIZE;
use crate::error::{Error, NetworkError, Result};
use crate::network::{bind_listener, create_socket};
use crate::protocol::dispatch::ControlDispatcher;
use crate::protocol::framing::encode_frame;
use crate::protocol::{read_frame, write_frame, Handshake, RelayPrefix, StreamKind, Welcome};
use crate::relay::broadcast::BroadcastRelay;
use crate::relay::queue::{spawn_sender, LinkSink, StreamQueue};
use crate::relay::registry::{PeerKey, PeerRegistry};
use crate::relay::RelayStats;
use crate::status::{self, StatusState};

/// Interval between periodic stats log lines
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// State shared by every relay task
#[derive(Clone)]
struct RelayContext {
    config: Arc<RelayConfig>,
    datagram: Arc<UdpSocket>,
    registry: Arc<PeerRegistry>,
    relay: Arc<BroadcastRelay>,
    dispatcher: Arc<ControlDispatcher>,
    stats: Arc<RelayStats>,
}

/// A bound relay, ready to run
pub struct RelayServer {
    ctx: RelayContext,
    listeners: Vec<(StreamKind, TcpListener)>,
    status_listener: Option<TcpListener>,
}

impl RelayServer {
    /// Bind every configured socket.
    ///
    /// Nothing runs yet; any bind failure is returned before a task starts.
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        config.validate()?;
        let ip = parse_ip(&config.network.bind_address)?;

        let datagram_addr = SocketAddr::new(ip, config.network.datagram_port);
        let datagram = Arc::new(create_socket(datagram_addr, config.network.recv_buffer_bytes)?);

        let mut listeners = Vec::new();
        for (kind, port) in config.network.stream_ports() {
            let listener = bind_listener(SocketAddr::new(ip, port)).await?;
            listeners.push((kind, listener));
        }

        let status_listener = if config.status.enabled {
            let status_ip = parse_ip(&config.status.bind_address)?;
            Some(bind_listener(SocketAddr::new(status_ip, config.status.http_port)).await?)
        } else {
            None
        };

        let registry = Arc::new(PeerRegistry::new(config.relay.liveness_ttl()));
        let stats = Arc::new(RelayStats::default());
        let relay = Arc::new(BroadcastRelay::new(registry.clone(), stats.clone()));

        Ok(Self {
            ctx: RelayContext {
                config: Arc::new(config),
                datagram,
                registry,
                relay,
                dispatcher: Arc::new(ControlDispatcher::new()),
                stats,
            },
            listeners,
            status_listener,
        })
    }

    pub fn datagram_addr(&self) -> Result<SocketAddr> {
        Ok(self.ctx.datagram.local_addr()?)
    }

    /// Bound address of a reliable stream listener
    pub fn stream_addr(&self, kind: StreamKind) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|(k, _)| *k == kind)
            .and_then(|(_, listener)| listener.local_addr().ok())
    }

    pub fn status_addr(&self) -> Option<SocketAddr> {
        self.status_listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        self.ctx.registry.clone()
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        self.ctx.stats.clone()
    }

    /// Run until `shutdown` turns true or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let ctx = self.ctx;
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        tracing::info!(
            "Datagram channel on {}",
            ctx.datagram.local_addr().map(|a| a.to_string()).unwrap_or_default()
        );
        tasks.push(tokio::spawn(datagram_loop(ctx.clone(), shutdown.clone())));

        for (kind, listener) in self.listeners {
            if let Ok(addr) = listener.local_addr() {
                tracing::info!("{} stream on {}", kind, addr);
            }
            tasks.push(tokio::spawn(accept_loop(ctx.clone(), kind, listener, shutdown.clone())));
        }

        tasks.push(tokio::spawn(sweep_loop(ctx.clone(), shutdown.clone())));

        if let Some(listener) = self.status_listener {
            let state = StatusState::new(
                ctx.registry.clone(),
                ctx.stats.clone(),
                ctx.dispatcher.clone(),
                &ctx.config,
            );
            let rx = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = status::serve(listener, state, rx).await {
                    tracing::error!("Status API stopped: {}", e);
                }
            }));
        }

        tracing::info!("Relay running");
        shutdown_signal(&mut shutdown).await;
        tracing::info!("Shutting down relay");

        futures_util::future::join_all(tasks).await;
        for queue in ctx.registry.drain() {
            queue.close();
        }

        let stats = ctx.stats.snapshot();
        tracing::info!(
            "Relay stopped: {} datagrams, {} stream frames, {} forwarded, {} dropped",
            stats.datagrams_received,
            stats.stream_frames_received,
            stats.units_forwarded,
            stats.units_dropped
        );
        Ok(())
    }
}

impl RelayContext {
    fn handle_datagram(&self, data: Bytes, addr: SocketAddr, now: Instant) {
        self.stats.datagrams_received.fetch_add(1, Ordering::Relaxed);
        self.evict_stale(now);

        let Some(datagram) = self.dispatcher.dispatch(data.clone()) else {
            self.stats.malformed.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let key = PeerKey::Datagram(addr);
        let user = datagram.user();
        if !self.registry.touch(&key, StreamKind::Datagram, Some(user), now) {
            self.open_datagram_link(key, addr, user, now);
        }

        self.relay.forward(&key, StreamKind::Datagram, data);
    }

    fn open_datagram_link(&self, key: PeerKey, addr: SocketAddr, user: &str, now: Instant) {
        let kind = StreamKind::Datagram;
        let (queue, rx) = StreamQueue::channel(
            kind,
            self.registry.next_link_id(),
            self.config.relay.queue_depth(kind),
        );
        let sink = LinkSink::Datagram {
            socket: self.datagram.clone(),
            addr,
        };
        spawn_sender(key, rx, sink, self.registry.clone(), self.stats.clone());

        if let Some(previous) = self.registry.attach(key, queue, Some(user), now) {
            previous.close();
        }
        tracing::info!(peer = %key, user, "Datagram peer joined");
    }

    /// Sweep the registry and close whatever it evicted
    fn evict_stale(&self, now: Instant) -> usize {
        let sweep = self.registry.sweep(now);
        for queue in &sweep.closed {
            queue.close();
        }
        for key in &sweep.removed {
            tracing::info!(peer = %key, "Peer timed out");
        }
        self.stats
            .peers_evicted
            .fetch_add(sweep.removed.len() as u64, Ordering::Relaxed);
        sweep.removed.len()
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        kind: StreamKind,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed for {}: {}", addr, e);
        }
        let (mut reader, mut writer) = stream.into_split();

        let (key, user) = match self.config.relay.identity {
            IdentityMode::Handshake => {
                let handshake = self.read_handshake(&mut reader).await?;
                let client_id = handshake.client_id.unwrap_or_else(Uuid::new_v4);
                write_frame(&mut writer, &Welcome { client_id }.encode()?).await?;
                (PeerKey::Client(client_id), Some(handshake.user))
            }
            IdentityMode::Address => (PeerKey::Host(addr.ip()), None),
        };

        let link_id = self.registry.next_link_id();
        let (queue, rx) = StreamQueue::channel(kind, link_id, self.config.relay.queue_depth(kind));
        spawn_sender(
            key,
            rx,
            LinkSink::Stream(writer),
            self.registry.clone(),
            self.stats.clone(),
        );

        if let Some(previous) = self
            .registry
            .attach(key, queue.clone(), user.as_deref(), Instant::now())
        {
            tracing::info!(peer = %key, stream = %kind, "Replacing existing connection");
            previous.close();
        }
        tracing::info!(peer = %key, stream = %kind, %addr, user = user.as_deref().unwrap_or(""), "Stream connected");

        let result = self.relay_stream(key, kind, &mut reader, &mut shutdown).await;

        if let Some(released) = self.registry.release(&key, kind, link_id) {
            if released.peer_removed {
                tracing::info!(peer = %key, "Peer removed");
            }
        }
        queue.close();
        tracing::info!(peer = %key, stream = %kind, "Stream closed");
        result
    }

    async fn read_handshake(&self, reader: &mut OwnedReadHalf) -> Result<Handshake> {
        let frame = tokio::time::timeout(
            self.config.relay.handshake_timeout(),
            read_frame(reader, self.config.network.max_stream_frame),
        )
        .await
        .map_err(|_| NetworkError::Timeout)??
        .ok_or_else(|| NetworkError::HandshakeFailed("closed before handshake".into()))?;

        Handshake::decode(&frame)
    }

    /// Forward every record read from one connection until it closes
    async fn relay_stream(
        &self,
        key: PeerKey,
        kind: StreamKind,
        reader: &mut OwnedReadHalf,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let sender_id = key.to_string();
        let max_len = self.config.network.max_stream_frame;

        loop {
            let frame = tokio::select! {
                _ = shutdown_signal(shutdown) => return Ok(()),
                frame = read_frame(reader, max_len) => frame?,
            };
            let Some(payload) = frame else {
                return Ok(());
            };

            self.stats.stream_frames_received.fetch_add(1, Ordering::Relaxed);
            self.registry.touch(&key, kind, None, Instant::now());

            let unit = match self.config.relay.framing {
                RelayFraming::Prefixed => encode_frame(&RelayPrefix::wrap(&sender_id, &payload)?),
                RelayFraming::Verbatim => encode_frame(&payload),
            };
            self.relay.forward(&key, kind, unit);
        }
    }
}

async fn datagram_loop(ctx: RelayContext, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            _ = shutdown_signal(&mut shutdown) => break,
            result = ctx.datagram.recv_from(&mut buf) => match result {
                Ok((len, addr)) => {
                    ctx.handle_datagram(Bytes::copy_from_slice(&buf[..len]), addr, Instant::now());
                }
                // ICMP port-unreachable from a departed peer surfaces here on some platforms
                Err(e) => tracing::debug!("Datagram receive error: {}", e),
            }
        }
    }
    tracing::debug!("Datagram loop stopped");
}

async fn accept_loop(
    ctx: RelayContext,
    kind: StreamKind,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_signal(&mut shutdown) => break,
            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    let ctx = ctx.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = ctx.handle_connection(stream, addr, kind, shutdown).await {
                            tracing::warn!("{} connection from {} ended: {}", kind, addr, e);
                        }
                    });
                }
                Err(e) => tracing::warn!("Accept failed on {} stream: {}", kind, e),
            }
        }
    }
    tracing::debug!("{} accept loop stopped", kind);
}

async fn sweep_loop(ctx: RelayContext, mut shutdown: watch::Receiver<bool>) {
    let mut sweep = tokio::time::interval(ctx.config.relay.sweep_interval());
    let mut report = tokio::time::interval(STATS_LOG_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown_signal(&mut shutdown) => break,
            _ = sweep.tick() => {
                ctx.evict_stale(Instant::now());
            }
            _ = report.tick() => {
                let stats = ctx.stats.snapshot();
                tracing::debug!(
                    "Stats: {} peers, {} forwarded, {} dropped, {} malformed",
                    ctx.registry.len(),
                    stats.units_forwarded,
                    stats.units_dropped,
                    stats.malformed
                );
            }
        }
    }
}

/// Resolves once shutdown is requested or the controlling sender is gone
async fn shutdown_signal(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn parse_ip(address: &str) -> Result<IpAddr> {
    address
        .parse()
        .map_err(|e| Error::Config(format!("invalid bind address {}: {}", address, e)))
}
