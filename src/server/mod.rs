// ABOUTME: Streaming server: accept loops, handshake, time echo and stream fan-out
// ABOUTME: Owns the group/client model and the per-stream encoder chains

pub mod broadcaster;
pub mod encoder;
pub mod session;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

use crate::audio::chunk::PcmChunk;
use crate::audio::format::SampleFormat;
use crate::config::{DEFAULT_BUFFER_MS, DEFAULT_STREAM_PORT};
use crate::error::{Error, Result};
use crate::protocol::messages::{
    BaseMessage, MessagePayload, ServerSettings, TimeMsg, Tv,
};
use crate::sync::clock::TimeProvider;
use crate::transport::rist::{RecoveryParams, RistListener};
use crate::transport::tls::TlsSettings;
use crate::transport::{tcp, tls, ws, TransportReader};
use broadcaster::Broadcaster;
use encoder::{new_encoder, Encoder};
use session::StreamSession;

/// Stream id used when none is configured
pub const DEFAULT_STREAM_ID: &str = "default";

// =============================================================================
// Configuration and state model
// =============================================================================

/// Server configuration; unset listeners are simply not started
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Plain TCP listener
    pub tcp_bind: Option<SocketAddr>,
    /// TLS listener
    pub tls_bind: Option<SocketAddr>,
    /// Plain WebSocket listener
    pub ws_bind: Option<SocketAddr>,
    /// TLS WebSocket listener
    pub wss_bind: Option<SocketAddr>,
    /// RIST overlay listener
    pub rist_bind: Option<SocketAddr>,
    /// Certificate material for the TLS listeners
    pub tls: TlsSettings,
    /// End-to-end buffer pushed to clients, in ms
    pub buffer_ms: i64,
    /// Codec of the default stream
    pub codec: String,
    /// Sample format of the default stream
    pub format: SampleFormat,
    /// Require this username in the client Hello
    pub username: Option<String>,
    /// Require this password in the client Hello
    pub password: Option<String>,
    /// Recovery tuning for the RIST overlay
    pub rist_params: RecoveryParams,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            tcp_bind: Some(SocketAddr::from(([0, 0, 0, 0], DEFAULT_STREAM_PORT))),
            tls_bind: None,
            ws_bind: None,
            wss_bind: None,
            rist_bind: None,
            tls: TlsSettings::default(),
            buffer_ms: DEFAULT_BUFFER_MS,
            codec: "pcm".into(),
            format: SampleFormat::new(
                crate::config::DEFAULT_RATE,
                crate::config::DEFAULT_BITS,
                crate::config::DEFAULT_CHANNELS,
            ),
            username: None,
            password: None,
            rist_params: RecoveryParams::default(),
        }
    }
}

/// A group of clients playing one stream in sync
#[derive(Debug, Clone)]
pub struct Group {
    /// Stable group id
    pub id: String,
    /// Display name
    pub name: String,
    /// Group-wide mute
    pub muted: bool,
    /// The stream this group plays
    pub stream_id: String,
    /// Member client ids
    pub clients: HashSet<String>,
}

/// Per-client persistent state
#[derive(Debug, Clone)]
pub struct ClientHandle {
    /// Stable unique client id
    pub id: String,
    /// Volume in percent
    pub volume: u16,
    /// Mute state
    pub muted: bool,
    /// Additional per-client latency in ms
    pub latency_ms: i32,
    /// Display name (host name by default)
    pub name: String,
    /// Currently connected
    pub connected: bool,
}

/// Groups and clients known to this server
#[derive(Debug, Default)]
pub struct ServerState {
    groups: Vec<Group>,
    clients: HashMap<String, ClientHandle>,
}

impl ServerState {
    fn client_entry(&mut self, id: &str) -> &mut ClientHandle {
        self.clients
            .entry(id.to_string())
            .or_insert_with(|| ClientHandle {
                id: id.to_string(),
                volume: 100,
                muted: false,
                latency_ms: 0,
                name: String::new(),
                connected: false,
            })
    }

    /// The group a client belongs to, creating a singleton group on demand
    fn group_for_client(&mut self, client_id: &str, default_stream: &str) -> &mut Group {
        if let Some(pos) = self
            .groups
            .iter()
            .position(|g| g.clients.contains(client_id))
        {
            return &mut self.groups[pos];
        }
        let group = Group {
            id: format!("group-{client_id}"),
            name: String::new(),
            muted: false,
            stream_id: default_stream.to_string(),
            clients: HashSet::from([client_id.to_string()]),
        };
        self.groups.push(group);
        self.groups.last_mut().unwrap()
    }

    /// Snapshot of all groups
    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    /// Snapshot of a client, if known
    pub fn client(&self, id: &str) -> Option<&ClientHandle> {
        self.clients.get(id)
    }
}

// =============================================================================
// Server-side stream
// =============================================================================

/// One audio source: a fixed input format feeding an encoder
pub struct PcmStream {
    /// Stream id clients subscribe to
    pub id: String,
    format: SampleFormat,
    encoder: Mutex<Box<dyn Encoder>>,
    started: AtomicBool,
}

impl PcmStream {
    fn new(id: &str, codec: &str, format: SampleFormat) -> Result<Self> {
        let mut encoder = new_encoder(codec)?;
        encoder.init(format)?;
        Ok(PcmStream {
            id: id.to_string(),
            format,
            encoder: Mutex::new(encoder),
            started: AtomicBool::new(false),
        })
    }

    /// The stream's input sample format
    pub fn format(&self) -> SampleFormat {
        self.format
    }

    fn codec_header(&self) -> crate::protocol::messages::CodecHeader {
        self.encoder.lock().unwrap().header().clone()
    }
}

// =============================================================================
// Server
// =============================================================================

struct ServerInner {
    options: ServerOptions,
    time: TimeProvider,
    state: Mutex<ServerState>,
    broadcaster: Broadcaster,
    sessions: Mutex<HashMap<u64, Arc<StreamSession>>>,
    streams: Mutex<HashMap<String, Arc<PcmStream>>>,
    next_session_id: AtomicU64,
}

/// The streaming server. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a server with a default stream built from `options`
    pub fn new(options: ServerOptions) -> Result<Self> {
        let default_stream = PcmStream::new(DEFAULT_STREAM_ID, &options.codec, options.format)?;
        let mut streams = HashMap::new();
        streams.insert(DEFAULT_STREAM_ID.to_string(), Arc::new(default_stream));
        Ok(Server {
            inner: Arc::new(ServerInner {
                options,
                time: TimeProvider::new(),
                state: Mutex::new(ServerState::default()),
                broadcaster: Broadcaster::new(),
                sessions: Mutex::new(HashMap::new()),
                streams: Mutex::new(streams),
                next_session_id: AtomicU64::new(1),
            }),
        })
    }

    /// The server clock; sources can stamp against it
    pub fn time(&self) -> TimeProvider {
        self.inner.time.clone()
    }

    /// Register an additional stream
    pub fn add_stream(&self, id: &str, codec: &str, format: SampleFormat) -> Result<()> {
        let stream = PcmStream::new(id, codec, format)?;
        self.inner
            .streams
            .lock()
            .unwrap()
            .insert(id.to_string(), Arc::new(stream));
        Ok(())
    }

    /// Feed raw PCM into a stream. Encoded chunks fan out to every
    /// subscribed session; each session applies its own drop policy.
    pub fn feed(&self, stream_id: &str, chunk: &PcmChunk) -> Result<()> {
        let stream = self
            .inner
            .streams
            .lock()
            .unwrap()
            .get(stream_id)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no stream '{stream_id}'")))?;

        let encoded = {
            let mut encoder = stream.encoder.lock().unwrap();
            if !stream.started.swap(true, Ordering::AcqRel) {
                encoder.set_stream_timestamp(self.inner.time.local_now_us());
            }
            encoder.encode(chunk)?
        };
        for enc in encoded {
            self.inner.broadcaster.broadcast(stream_id, &enc.chunk);
        }
        Ok(())
    }

    /// Run inspection or mutation against the group/client state
    pub fn with_state<R>(&self, f: impl FnOnce(&mut ServerState) -> R) -> R {
        f(&mut self.inner.state.lock().unwrap())
    }

    /// Re-point a client's group to another stream. The new stream's codec
    /// header is queued before any of its chunks.
    pub fn set_client_stream(&self, client_id: &str, stream_id: &str) -> Result<()> {
        let stream = self
            .inner
            .streams
            .lock()
            .unwrap()
            .get(stream_id)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no stream '{stream_id}'")))?;

        {
            let mut state = self.inner.state.lock().unwrap();
            let group = state.group_for_client(client_id, DEFAULT_STREAM_ID);
            group.stream_id = stream_id.to_string();
        }

        if let Some(session) = self.session_for_client(client_id) {
            session.send_message(MessagePayload::CodecHeader(stream.codec_header()));
            self.inner.broadcaster.subscribe(stream_id, &session);
        }
        Ok(())
    }

    /// Update a client's volume and push the change down to it
    pub fn set_client_volume(&self, client_id: &str, volume: u16, muted: bool) {
        let latency_ms = {
            let mut state = self.inner.state.lock().unwrap();
            let client = state.client_entry(client_id);
            client.volume = volume;
            client.muted = muted;
            client.latency_ms
        };
        if let Some(session) = self.session_for_client(client_id) {
            session.send_message(MessagePayload::ServerSettings(ServerSettings {
                buffer_ms: self.inner.options.buffer_ms as i32,
                latency: latency_ms,
                volume,
                muted,
            }));
        }
    }

    fn session_for_client(&self, client_id: &str) -> Option<Arc<StreamSession>> {
        self.inner
            .sessions
            .lock()
            .unwrap()
            .values()
            .find(|s| s.client_id() == client_id)
            .cloned()
    }

    /// Run every configured listener until one fails
    pub async fn run(&self) -> Result<()> {
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        let options = &self.inner.options;

        if let Some(addr) = options.tcp_bind {
            let server = self.clone();
            tasks.spawn(async move { server.run_tcp(addr).await });
        }
        if let Some(addr) = options.tls_bind {
            let server = self.clone();
            let acceptor = TlsAcceptor::from(Arc::new(tls::server_config(&options.tls)?));
            tasks.spawn(async move { server.run_tls(addr, acceptor).await });
        }
        if let Some(addr) = options.ws_bind {
            let server = self.clone();
            tasks.spawn(async move { server.run_ws(addr).await });
        }
        if let Some(addr) = options.wss_bind {
            let server = self.clone();
            let acceptor = TlsAcceptor::from(Arc::new(tls::server_config(&options.tls)?));
            tasks.spawn(async move { server.run_wss(addr, acceptor).await });
        }
        if let Some(addr) = options.rist_bind {
            let server = self.clone();
            let params = options.rist_params;
            tasks.spawn(async move { server.run_rist(addr, params).await });
        }
        if tasks.is_empty() {
            return Err(Error::Config("no listeners configured".into()));
        }

        while let Some(joined) = tasks.join_next().await {
            joined.map_err(|e| Error::Transport(e.to_string()))??;
        }
        Ok(())
    }

    async fn run_tcp(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_tcp_listener(listener).await
    }

    /// Serve plain TCP sessions on an already-bound listener
    pub async fn run_tcp_listener(&self, listener: TcpListener) -> Result<()> {
        log::info!("listening on tcp://{}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            log::info!("connection from {peer}");
            let (reader, writer) = tcp::wrap(stream);
            self.start_session(reader, writer);
        }
    }

    async fn run_tls(self, addr: SocketAddr, acceptor: TlsAcceptor) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("listening on tls://{addr}");
        loop {
            let (stream, peer) = listener.accept().await?;
            let acceptor = acceptor.clone();
            let server = self.clone();
            tokio::spawn(async move {
                match tls::accept(&acceptor, stream).await {
                    Ok((reader, writer)) => {
                        log::info!("tls connection from {peer}");
                        server.start_session(reader, writer);
                    }
                    Err(e) => log::warn!("tls handshake with {peer} failed: {e}"),
                }
            });
        }
    }

    async fn run_ws(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("listening on ws://{addr}");
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                match ws::accept(stream).await {
                    Ok((reader, writer)) => {
                        log::info!("websocket connection from {peer}");
                        server.start_session(reader, writer);
                    }
                    Err(e) => log::warn!("websocket handshake with {peer} failed: {e}"),
                }
            });
        }
    }

    async fn run_wss(self, addr: SocketAddr, acceptor: TlsAcceptor) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("listening on wss://{addr}");
        loop {
            let (stream, peer) = listener.accept().await?;
            let acceptor = acceptor.clone();
            let server = self.clone();
            tokio::spawn(async move {
                match ws::accept_tls(&acceptor, stream).await {
                    Ok((reader, writer)) => {
                        log::info!("secure websocket connection from {peer}");
                        server.start_session(reader, writer);
                    }
                    Err(e) => log::warn!("wss handshake with {peer} failed: {e}"),
                }
            });
        }
    }

    async fn run_rist(self, addr: SocketAddr, params: RecoveryParams) -> Result<()> {
        let mut listener = RistListener::bind(addr, params).await?;
        log::info!("listening on rist://{addr}");
        loop {
            let (reader, mut writer, peer) = listener.accept().await?;
            log::info!("rist peer {peer}");
            // Announce the configured recovery tuning; clients arriving with
            // different defaults rebuild their receive state from this.
            if let crate::transport::TransportWriter::Rist(w) = &mut writer {
                if let Err(e) = w.send_params(&params).await {
                    log::warn!("sending recovery params to {peer}: {e}");
                }
            }
            self.start_session(reader, writer);
        }
    }

    fn start_session(
        &self,
        reader: TransportReader,
        writer: crate::transport::TransportWriter,
    ) {
        let session_id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = StreamSession::new(session_id, self.inner.time.clone());
        session.set_buffer_ms(self.inner.options.buffer_ms);
        self.inner
            .sessions
            .lock()
            .unwrap()
            .insert(session_id, session.clone());

        tokio::spawn(Arc::clone(&session).run_writer(writer));
        let server = self.clone();
        tokio::spawn(async move {
            server.session_loop(session, reader).await;
        });
    }

    async fn session_loop(&self, session: Arc<StreamSession>, mut reader: TransportReader) {
        loop {
            let (mut base, payload) = match reader.read_message().await {
                Ok(m) => m,
                Err(e) => {
                    log::info!("session {}: {e}", session.session_id);
                    break;
                }
            };
            base.received = self.inner.time.now_tv();

            let payload = match MessagePayload::decode(&base, payload) {
                Ok(p) => p,
                Err(e) => {
                    log::error!("session {}: {e}", session.session_id);
                    break;
                }
            };
            if !self.dispatch(&session, &base, payload) {
                break;
            }
        }
        self.disconnect(&session);
    }

    /// Handle one client message; false closes the session
    fn dispatch(
        &self,
        session: &Arc<StreamSession>,
        base: &BaseMessage,
        payload: MessagePayload,
    ) -> bool {
        match payload {
            MessagePayload::Time(_) => {
                let latency = Tv::from_micros(base.received.diff_micros(base.sent));
                session.send_reply(MessagePayload::Time(TimeMsg { latency }), base.id);
                true
            }
            MessagePayload::Hello(hello) => self.handle_hello(session, base, hello),
            MessagePayload::ClientInfo(info) => {
                let client_id = session.client_id();
                if client_id.is_empty() {
                    log::warn!("client info before hello, closing");
                    return false;
                }
                log::info!(
                    "client {client_id}: volume {}%, muted {}",
                    info.volume,
                    info.muted
                );
                let mut state = self.inner.state.lock().unwrap();
                let client = state.client_entry(&client_id);
                client.volume = info.volume;
                client.muted = info.muted;
                true
            }
            MessagePayload::ClientSystemInfo(info) => {
                log::debug!(
                    "client {}: system info {}",
                    session.client_id(),
                    serde_json::Value::Object(info.info)
                );
                true
            }
            other => {
                log::warn!(
                    "session {}: ignoring unexpected message type {}",
                    session.session_id,
                    other.message_type()
                );
                true
            }
        }
    }

    fn handle_hello(
        &self,
        session: &Arc<StreamSession>,
        base: &BaseMessage,
        hello: crate::protocol::messages::Hello,
    ) -> bool {
        let options = &self.inner.options;
        if options.username.is_some() || options.password.is_some() {
            if hello.username != options.username || hello.password != options.password {
                log::warn!(
                    "rejecting client {} ({}): bad credentials",
                    hello.unique_id(),
                    hello.hostname
                );
                return false;
            }
        }

        let client_id = hello.unique_id();
        log::info!(
            "hello from {client_id} ({}, {} {}, protocol {})",
            hello.hostname,
            hello.os,
            hello.arch,
            hello.protocol_version
        );
        session.set_client_id(client_id.clone());

        let (settings, stream_id) = {
            let mut state = self.inner.state.lock().unwrap();
            let client = state.client_entry(&client_id);
            client.connected = true;
            if client.name.is_empty() {
                client.name = hello.hostname.clone();
            }
            let (volume, muted, latency_ms) = (client.volume, client.muted, client.latency_ms);
            let group = state.group_for_client(&client_id, DEFAULT_STREAM_ID);
            (
                ServerSettings {
                    buffer_ms: options.buffer_ms as i32,
                    latency: latency_ms,
                    volume,
                    muted: muted || group.muted,
                },
                group.stream_id.clone(),
            )
        };

        let stream = self.inner.streams.lock().unwrap().get(&stream_id).cloned();
        let stream = match stream {
            Some(s) => s,
            None => {
                log::error!("group points at missing stream '{stream_id}'");
                return false;
            }
        };

        session.set_buffer_ms(settings.buffer_ms as i64);
        session.send_reply(MessagePayload::ServerSettings(settings), base.id);
        session.send_message(MessagePayload::CodecHeader(stream.codec_header()));
        self.inner.broadcaster.subscribe(&stream_id, session);
        true
    }

    fn disconnect(&self, session: &Arc<StreamSession>) {
        log::info!(
            "session {} ({}) disconnected",
            session.session_id,
            session.client_id()
        );
        session.close();
        self.inner.broadcaster.unsubscribe(session.session_id);
        self.inner
            .sessions
            .lock()
            .unwrap()
            .remove(&session.session_id);
        let client_id = session.client_id();
        if !client_id.is_empty() {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(client) = state.clients.get_mut(&client_id) {
                client.connected = false;
            }
        }
    }
}
