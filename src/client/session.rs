//! Relay client session

use bytes::Bytes;
use crossbeam_channel::Receiver;
use futures_util::future::join_all;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::client::inbound::Inbound;
use crate::client::presence::PresenceTracker;
use crate::client::{ClientEvent, FrameSource};
use crate::config::{ClientConfig, MediaConfig, MediaTransport, RelayFraming};
use crate::constants::{DEFAULT_CHAT_QUEUE_DEPTH, DEFAULT_QUEUE_DEPTH, MAX_DATAGRAM_SIZE};
use crate::error::{Error, NetworkError, Result};
use crate::media::{create_shared_jitter, FrameReassembler, SharedJitterBuffer};
use crate::network::{create_client_socket, resolve};
use crate::protocol::framing::encode_frame;
use crate::protocol::{
    read_frame, write_frame, ControlMessage, FrameFragmenter, Handshake, MediaFlags, StreamKind, Welcome,
};

/// Local mute and deaf switches
#[derive(Debug, Default)]
pub struct MediaState {
    mute: AtomicBool,
    deaf: AtomicBool,
}

impl MediaState {
    pub fn is_mute(&self) -> bool {
        self.mute.load(Ordering::Relaxed)
    }

    pub fn is_deaf(&self) -> bool {
        self.deaf.load(Ordering::Relaxed)
    }

    pub fn set_mute(&self, mute: bool) {
        self.mute.store(mute, Ordering::Relaxed);
    }

    pub fn set_deaf(&self, deaf: bool) {
        self.deaf.store(deaf, Ordering::Relaxed);
    }

    pub fn flags(&self) -> MediaFlags {
        MediaFlags::new(self.is_mute(), self.is_deaf())
    }
}

/// Writers for the per-kind media streams
struct MediaStreams {
    audio: mpsc::Sender<Bytes>,
    video: mpsc::Sender<Bytes>,
}

/// A connected meeting peer
pub struct RelayClient {
    username: String,
    client_id: Option<Uuid>,
    media: MediaConfig,
    datagram: Arc<UdpSocket>,
    server: SocketAddr,
    fragmenter: FrameFragmenter,
    chat: mpsc::Sender<Bytes>,
    streams: Option<MediaStreams>,
    state: Arc<MediaState>,
    jitter: SharedJitterBuffer,
    presence: Arc<PresenceTracker>,
    events: Receiver<ClientEvent>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayClient {
    /// Open every socket, announce ourselves and start the receive tasks
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let server = resolve(&config.server_host, config.datagram_port).await?;
        let datagram = Arc::new(create_client_socket(server, config.recv_buffer_bytes)?);
        let fragmenter = FrameFragmenter::new(config.username.clone(), config.media.max_fragment_payload)?;

        let (chat_stream, client_id) =
            open_stream(&config, config.chat_port, StreamKind::Chat, None).await?;
        let mut stream_links = vec![(StreamKind::Chat, chat_stream)];
        if config.media_transport == MediaTransport::Stream {
            let (audio, _) = open_stream(&config, config.audio_port, StreamKind::Audio, client_id).await?;
            let (video, _) = open_stream(&config, config.video_port, StreamKind::Video, client_id).await?;
            stream_links.push((StreamKind::Audio, audio));
            stream_links.push((StreamKind::Video, video));
        }

        let state = Arc::new(MediaState::default());
        let jitter = create_shared_jitter(config.media.jitter_depth);
        let presence = Arc::new(PresenceTracker::new(config.presence_ttl()));
        let (events_tx, events) = crossbeam_channel::bounded(config.event_capacity);
        let inbound = Inbound::new(state.clone(), jitter.clone(), presence.clone(), events_tx);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut tasks = Vec::new();
        let mut writers = Vec::new();
        for (kind, stream) in stream_links {
            let (reader, writer) = stream.into_split();
            let depth = match kind {
                StreamKind::Chat => DEFAULT_CHAT_QUEUE_DEPTH,
                _ => DEFAULT_QUEUE_DEPTH,
            };
            let (tx, rx) = mpsc::channel(depth);
            writers.push(tx);
            tasks.push(tokio::spawn(stream_writer(kind, writer, rx)));
            tasks.push(tokio::spawn(stream_reader(
                kind,
                reader,
                config.max_stream_frame,
                config.framing,
                inbound.clone(),
                shutdown_rx.clone(),
            )));
        }

        let mut writers = writers.into_iter();
        let chat = writers
            .next()
            .ok_or_else(|| NetworkError::ConnectionFailed("chat stream missing".into()))?;
        let streams = match (writers.next(), writers.next()) {
            (Some(audio), Some(video)) => Some(MediaStreams { audio, video }),
            _ => None,
        };

        tasks.push(tokio::spawn(datagram_reader(
            datagram.clone(),
            inbound.clone(),
            config.presence_ttl(),
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(presence_sweeper(inbound, presence.clone(), shutdown_rx.clone())));

        let hello = ControlMessage::Hello {
            user: config.username.clone(),
        }
        .encode()?;
        tasks.push(tokio::spawn(keepalive(
            datagram.clone(),
            server,
            hello.clone(),
            config.keepalive_interval(),
            shutdown_rx,
        )));
        datagram.send_to(&hello, server).await?;

        tracing::info!(
            "Connected to {} as {}{}",
            server,
            config.username,
            client_id.map(|id| format!(" ({})", id)).unwrap_or_default()
        );

        Ok(Self {
            username: config.username,
            client_id,
            media: config.media,
            datagram,
            server,
            fragmenter,
            chat,
            streams,
            state,
            jitter,
            presence,
            events,
            shutdown,
            tasks,
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Id issued by the relay handshake
    pub fn client_id(&self) -> Option<Uuid> {
        self.client_id
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.datagram.local_addr()?)
    }

    /// Received events; the channel is bounded and drops when not drained
    pub fn events(&self) -> &Receiver<ClientEvent> {
        &self.events
    }

    /// Received audio blocks, ready for playback
    pub fn jitter(&self) -> SharedJitterBuffer {
        self.jitter.clone()
    }

    /// Users currently considered present
    pub fn present_users(&self) -> Vec<String> {
        self.presence.users()
    }

    pub fn is_mute(&self) -> bool {
        self.state.is_mute()
    }

    pub fn is_deaf(&self) -> bool {
        self.state.is_deaf()
    }

    pub fn set_mute(&self, mute: bool) {
        self.state.set_mute(mute);
        tracing::info!("Microphone {}", if mute { "muted" } else { "unmuted" });
    }

    /// Deafening also discards audio already buffered
    pub fn set_deaf(&self, deaf: bool) {
        self.state.set_deaf(deaf);
        if deaf {
            self.jitter.clear();
        }
        tracing::info!("Audio output {}", if deaf { "off" } else { "on" });
    }

    /// Send one encoded video frame
    pub async fn send_video(&self, frame: Bytes) -> Result<()> {
        match &self.streams {
            Some(streams) => {
                let record = ControlMessage::Video {
                    user: self.username.clone(),
                    mute: self.state.is_mute(),
                    deaf: self.state.is_deaf(),
                    frame: frame.to_vec(),
                }
                .encode()?;
                enqueue_media(&streams.video, StreamKind::Video, encode_frame(&record));
            }
            None => {
                for datagram in self.fragmenter.fragment_datagrams(&frame, self.state.flags())? {
                    self.datagram.send_to(&datagram, self.server).await?;
                }
            }
        }
        Ok(())
    }

    /// Send one block of PCM samples.
    ///
    /// Returns false when the block was suppressed because we are muted or deaf.
    pub async fn send_audio(&self, samples: Bytes) -> Result<bool> {
        if self.state.is_mute() || self.state.is_deaf() {
            return Ok(false);
        }

        let record = ControlMessage::Audio {
            user: self.username.clone(),
            samples: samples.to_vec(),
        }
        .encode()?;

        match &self.streams {
            Some(streams) => enqueue_media(&streams.audio, StreamKind::Audio, encode_frame(&record)),
            None => {
                self.datagram.send_to(&record, self.server).await?;
            }
        }
        Ok(true)
    }

    /// Tell everyone our camera is off
    pub async fn send_camera_off(&self) -> Result<()> {
        let record = ControlMessage::Offcam {
            user: self.username.clone(),
            mute: self.state.is_mute(),
            deaf: self.state.is_deaf(),
        }
        .encode()?;
        self.datagram.send_to(&record, self.server).await?;
        Ok(())
    }

    /// Send a chat line over the reliable chat stream
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<()> {
        let record = ControlMessage::Chat {
            user: self.username.clone(),
            text: text.into(),
        }
        .encode()?;
        self.chat
            .send(encode_frame(&record))
            .await
            .map_err(|_| NetworkError::Closed)?;
        Ok(())
    }

    /// Pace `source` at the configured frame rate until `shutdown` fires
    pub async fn run_video<S: FrameSource>(&self, mut source: S, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.media.frame_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = wait_shutdown(&mut shutdown) => return Ok(()),
                _ = ticker.tick() => {}
            }

            let result = match source.next_frame() {
                Some(frame) => self.send_video(frame).await,
                None => self.send_camera_off().await,
            };
            if let Err(e) = result {
                tracing::warn!("Video send failed: {}", e);
            }
        }
    }

    /// Stop every task and close the streams
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        drop(self.chat);
        drop(self.streams);
        join_all(self.tasks).await;
        tracing::info!("Disconnected from {}", self.server);
    }
}

async fn open_stream(
    config: &ClientConfig,
    port: u16,
    kind: StreamKind,
    client_id: Option<Uuid>,
) -> Result<(TcpStream, Option<Uuid>)> {
    let addr = resolve(&config.server_host, port).await?;
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| NetworkError::ConnectionFailed(format!("{} stream to {}: {}", kind, addr, e)))?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("set_nodelay failed: {}", e);
    }

    if !config.handshake {
        return Ok((stream, None));
    }

    let handshake = Handshake {
        client_id,
        user: config.username.clone(),
    };
    write_frame(&mut stream, &handshake.encode()?).await?;

    let reply = read_frame(&mut stream, config.max_stream_frame)
        .await?
        .ok_or_else(|| NetworkError::HandshakeFailed(format!("{} stream closed during handshake", kind)))?;
    let welcome = Welcome::decode(&reply)?;
    tracing::debug!("{} stream established as {}", kind, welcome.client_id);
    Ok((stream, Some(welcome.client_id)))
}

fn enqueue_media(tx: &mpsc::Sender<Bytes>, kind: StreamKind, record: Bytes) {
    if tx.try_send(record).is_err() {
        tracing::debug!("{} stream backlog full, dropping record", kind);
    }
}

async fn stream_writer(kind: StreamKind, mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(record) = rx.recv().await {
        if let Err(e) = writer.write_all(&record).await {
            tracing::error!("{} stream write error: {}", kind, e);
            break;
        }
    }
    let _ = writer.shutdown().await;
    tracing::debug!("{} stream writer ended", kind);
}

async fn stream_reader(
    kind: StreamKind,
    mut reader: OwnedReadHalf,
    max_len: usize,
    framing: RelayFraming,
    inbound: Inbound,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = wait_shutdown(&mut shutdown) => break,
            frame = read_frame(&mut reader, max_len) => frame,
        };

        match frame {
            Ok(Some(record)) => {
                if let Err(e) = inbound.handle_record(record, framing, Instant::now()) {
                    tracing::warn!("Bad {} record: {}", kind, e);
                }
            }
            Ok(None) => {
                tracing::warn!("Relay closed the {} stream", kind);
                break;
            }
            Err(Error::Io(e)) => {
                tracing::error!("{} stream read error: {}", kind, e);
                break;
            }
            Err(e) => {
                tracing::error!("{} stream protocol error: {}", kind, e);
                break;
            }
        }
    }
}

async fn datagram_reader(
    socket: Arc<UdpSocket>,
    inbound: Inbound,
    max_partial_age: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut reassembler = FrameReassembler::new();
    let mut last_purge = Instant::now();

    loop {
        tokio::select! {
            _ = wait_shutdown(&mut shutdown) => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, _)) => {
                    let now = Instant::now();
                    inbound.handle_datagram(Bytes::copy_from_slice(&buf[..len]), &mut reassembler, now);

                    if now.duration_since(last_purge) >= max_partial_age {
                        reassembler.purge_older_than(max_partial_age, now);
                        last_purge = now;
                    }
                }
                Err(e) => tracing::debug!("Datagram receive error: {}", e),
            }
        }
    }
}

async fn presence_sweeper(inbound: Inbound, presence: Arc<PresenceTracker>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            _ = wait_shutdown(&mut shutdown) => break,
            _ = ticker.tick() => {
                for user in presence.expire(Instant::now()) {
                    tracing::info!("{} left", user);
                    inbound.emit(ClientEvent::Left { user });
                }
            }
        }
    }
}

async fn keepalive(
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    hello: Bytes,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = wait_shutdown(&mut shutdown) => break,
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&hello, server).await {
                    tracing::debug!("Keepalive failed: {}", e);
                }
            }
        }
    }
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
