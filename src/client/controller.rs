// ABOUTME: Client orchestration: handshake, time sync, dispatch, playback lifecycle
// ABOUTME: Reconnects with backoff; codec changes rebuild decoder, stream and player

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::audio::chunk::PcmChunk;
use crate::audio::decode::{new_decoder, Decoder};
use crate::audio::format::SampleFormat;
use crate::audio::output::{new_player, Player, PlayerVolume};
use crate::client::connection::ClientConnection;
use crate::client::settings::ClientSettings;
use crate::error::{Error, Result};
use crate::protocol::messages::{
    ClientInfo, CodecHeader, Hello, MessagePayload, ServerSettings, TimeMsg,
};
use crate::stream::Stream;
use crate::sync::clock::TimeProvider;

/// Number of fast time-sync rounds after connecting
const QUICK_SYNCS: u32 = 50;
/// Pacing of the initial sync burst
const QUICK_SYNC_INTERVAL: Duration = Duration::from_millis(60);
/// Steady-state sync cadence
const SYNC_INTERVAL: Duration = Duration::from_secs(1);
/// Timeout for the Hello round trip and for time requests
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
/// Cadence of the ClientSystemInfo report
const SYSTEM_INFO_INTERVAL: Duration = Duration::from_secs(60);
/// Longest reconnect backoff
const MAX_BACKOFF: Duration = Duration::from_secs(30);

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Per-session playback state, torn down on disconnect or codec change
struct Playback {
    decoder: Box<dyn Decoder>,
    in_format: SampleFormat,
    stream: Arc<Stream>,
    player: Box<dyn Player>,
}

impl Drop for Playback {
    fn drop(&mut self) {
        self.player.stop();
    }
}

/// Ties the client together: transport, time sync, decoder, jitter-buffer
/// stream and player. `run` connects and keeps reconnecting with backoff
/// until a fatal configuration error occurs.
pub struct Controller {
    settings: ClientSettings,
    time: TimeProvider,
    volume: Arc<PlayerVolume>,
    volume_tx: watch::Sender<(u16, bool)>,
    volume_rx: watch::Receiver<(u16, bool)>,
}

impl Controller {
    /// Create a controller for `settings`
    pub fn new(settings: ClientSettings) -> Self {
        let (volume_tx, volume_rx) = watch::channel((100u16, false));
        Controller {
            settings,
            time: TimeProvider::new(),
            volume: PlayerVolume::new(),
            volume_tx,
            volume_rx,
        }
    }

    /// The synchronized clock handle (offset to the server)
    pub fn time(&self) -> TimeProvider {
        self.time.clone()
    }

    /// The shared volume state applied by the player
    pub fn volume(&self) -> Arc<PlayerVolume> {
        Arc::clone(&self.volume)
    }

    /// Change the local volume; the new state is reported upstream as
    /// ClientInfo on the next loop turn.
    pub fn set_volume(&self, volume_percent: u16, muted: bool) {
        self.volume.set(volume_percent, muted);
        let _ = self.volume_tx.send((volume_percent.min(100), muted));
    }

    /// Run until a fatal configuration error. Transport failures reconnect
    /// with exponential backoff; the time estimate resets per server.
    pub async fn run(&mut self) -> Result<()> {
        let mut backoff = Duration::from_secs(1);
        loop {
            match self.run_session().await {
                Err(Error::Config(e)) => return Err(Error::Config(e)),
                Err(e) => log::warn!("session ended: {e}"),
                Ok(()) => log::info!("session closed"),
            }
            self.time.reset();
            log::info!("reconnecting in {backoff:?}");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn run_session(&mut self) -> Result<()> {
        let (conn, mut events) =
            ClientConnection::connect(&self.settings.server, &self.settings.tls, self.time.clone())
                .await?;

        // Handshake: Hello out, ServerSettings back.
        let hello = self.build_hello();
        let (_, reply) = conn
            .send_request(&MessagePayload::Hello(hello), REQUEST_TIMEOUT)
            .await?;
        let mut server_settings = match reply {
            MessagePayload::ServerSettings(s) => s,
            other => {
                return Err(Error::Protocol(format!(
                    "expected server settings, got type {}",
                    other.message_type()
                )))
            }
        };
        log::info!(
            "server settings: buffer {} ms, latency {} ms, volume {}%, muted {}",
            server_settings.buffer_ms,
            server_settings.latency,
            server_settings.volume,
            server_settings.muted
        );
        self.volume.set(server_settings.volume, server_settings.muted);

        let _time_task = AbortOnDrop(tokio::spawn(time_sync_task(
            Arc::clone(&conn),
            self.time.clone(),
        )));

        let mut playback: Option<Playback> = None;
        let mut volume_rx = self.volume_rx.clone();
        volume_rx.mark_unchanged();
        let mut system_info = tokio::time::interval(SYSTEM_INFO_INTERVAL);

        loop {
            tokio::select! {
                event = events.recv() => {
                    let (_base, payload) = match event {
                        Some(e) => e,
                        None => {
                            // Read loop gone: pending requests were already
                            // cancelled; the player drains what it buffered.
                            return Err(Error::Transport("connection closed".into()));
                        }
                    };
                    match payload {
                        MessagePayload::CodecHeader(header) => {
                            playback = self.handle_codec_header(&header, &server_settings);
                        }
                        MessagePayload::WireChunk(wire) => {
                            if let Some(pb) = playback.as_mut() {
                                match PcmChunk::from_wire(wire, pb.in_format)
                                    .and_then(|c| pb.decoder.decode(c))
                                {
                                    Ok(Some(chunk)) => pb.stream.add_chunk(chunk),
                                    Ok(None) => {}
                                    Err(e) => log::debug!("dropping chunk: {e}"),
                                }
                            }
                        }
                        MessagePayload::ServerSettings(settings) => {
                            log::info!(
                                "server settings: buffer {} ms, latency {} ms, volume {}%, muted {}",
                                settings.buffer_ms,
                                settings.latency,
                                settings.volume,
                                settings.muted
                            );
                            self.volume.set(settings.volume, settings.muted);
                            if let Some(pb) = playback.as_ref() {
                                pb.stream.set_buffer_ms(self.effective_buffer_ms(&settings));
                            }
                            server_settings = settings;
                        }
                        other => {
                            log::debug!("unhandled message type {}", other.message_type());
                        }
                    }
                }
                changed = volume_rx.changed() => {
                    if changed.is_ok() {
                        let (volume, muted) = *volume_rx.borrow_and_update();
                        let info = MessagePayload::ClientInfo(ClientInfo { volume, muted });
                        if let Err(e) = conn.send(&info).await {
                            log::warn!("reporting volume: {e}");
                        }
                    }
                }
                _ = system_info.tick() => {
                    let info = MessagePayload::ClientSystemInfo(self.build_system_info());
                    if let Err(e) = conn.send(&info).await {
                        log::warn!("reporting system info: {e}");
                    }
                }
            }
        }
    }

    /// A codec header always rebuilds decoder, stream and player, clearing
    /// any queued audio; the server sends one exactly when the stream (or
    /// its codec) changes under the client.
    fn handle_codec_header(
        &self,
        header: &CodecHeader,
        server_settings: &ServerSettings,
    ) -> Option<Playback> {
        log::info!(
            "codec header: {} ({} bytes)",
            header.codec,
            header.payload.len()
        );
        let mut decoder = match new_decoder(&header.codec) {
            Ok(d) => d,
            Err(e) => {
                log::error!("{e}; playback stops until a usable codec arrives");
                return None;
            }
        };
        let in_format = match decoder.set_header(header) {
            Ok(f) => f,
            Err(e) => {
                log::error!("initializing {} decoder: {e}", header.codec);
                return None;
            }
        };
        log::info!("stream format: {in_format}");

        let stream = match Stream::new(in_format, self.settings.player_format, self.time.clone()) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                log::error!("building stream: {e}");
                return None;
            }
        };
        stream.set_buffer_ms(self.effective_buffer_ms(server_settings));

        let mut player =
            match new_player(&self.settings.player, Arc::clone(&stream), self.volume()) {
                Ok(p) => p,
                Err(e) => {
                    log::error!("building player: {e}");
                    return None;
                }
            };
        if let Err(e) = player.start() {
            log::error!("starting player: {e}");
            return None;
        }

        Some(Playback {
            decoder,
            in_format,
            stream,
            player,
        })
    }

    /// The playout distance: the server's end-to-end buffer minus the
    /// per-client latency adjustments.
    fn effective_buffer_ms(&self, settings: &ServerSettings) -> i64 {
        (settings.buffer_ms as i64 - settings.latency as i64 - self.settings.latency_ms).max(10)
    }

    fn build_system_info(&self) -> crate::protocol::messages::ClientSystemInfo {
        let mut info = crate::protocol::messages::ClientSystemInfo::default();
        info.info
            .insert("OS".into(), std::env::consts::OS.into());
        info.info
            .insert("Arch".into(), std::env::consts::ARCH.into());
        info.info
            .insert("Version".into(), env!("CARGO_PKG_VERSION").into());
        info
    }

    fn build_hello(&self) -> Hello {
        Hello {
            mac: self.settings.mac.clone(),
            hostname: self.settings.hostname.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            client_name: "Snapstream".to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            instance: self.settings.instance,
            id: self.settings.id(),
            username: self.settings.username.clone(),
            password: self.settings.password.clone(),
            protocol_version: 2,
        }
    }
}

/// Periodic time sync: a quick burst right after connecting seeds the
/// median window, then one exchange per second keeps it fresh.
async fn time_sync_task(conn: Arc<ClientConnection>, time: TimeProvider) {
    let mut rounds = 0u32;
    loop {
        let request = MessagePayload::Time(TimeMsg::default());
        match conn.send_request(&request, REQUEST_TIMEOUT).await {
            Ok((base, MessagePayload::Time(reply))) => {
                // latency = server receive - our send; base.sent is the
                // server's transmit stamp, base.received our receive stamp.
                time.update(reply.latency, base.sent, base.received);
            }
            Ok((_, other)) => {
                log::warn!("time request answered with type {}", other.message_type());
            }
            Err(Error::Timeout(_)) => {
                log::warn!("time request timed out");
            }
            Err(_) => return,
        }
        let interval = if rounds < QUICK_SYNCS {
            rounds += 1;
            QUICK_SYNC_INTERVAL
        } else {
            SYNC_INTERVAL
        };
        tokio::time::sleep(interval).await;
    }
}
