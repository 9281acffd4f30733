// ABOUTME: Player abstraction: a sink pulling synchronized frames from the stream
// ABOUTME: Shared volume/mute state read lock-free from the audio callback

pub mod cpal_output;

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::stream::Stream;

pub use cpal_output::CpalPlayer;

/// With no chunk arriving for this long the sink is torn down until data returns
pub const SINK_IDLE_TIMEOUT_MS: i64 = 5_000;

/// Volume and mute, shared between the controller and the audio callback
#[derive(Debug)]
pub struct PlayerVolume {
    volume_percent: AtomicU16,
    muted: AtomicBool,
}

impl PlayerVolume {
    /// Full volume, unmuted
    pub fn new() -> Arc<Self> {
        Arc::new(PlayerVolume {
            volume_percent: AtomicU16::new(100),
            muted: AtomicBool::new(false),
        })
    }

    /// Apply a settings update
    pub fn set(&self, volume_percent: u16, muted: bool) {
        self.volume_percent
            .store(volume_percent.min(100), Ordering::Release);
        self.muted.store(muted, Ordering::Release);
    }

    /// Current volume in percent
    pub fn volume(&self) -> u16 {
        self.volume_percent.load(Ordering::Acquire)
    }

    /// Current mute state
    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    /// Linear gain for the audio callback; 0.0 while muted
    pub fn gain(&self) -> f32 {
        if self.muted() {
            0.0
        } else {
            self.volume() as f32 / 100.0
        }
    }
}

/// A running audio sink
pub trait Player: Send {
    /// Start pulling from the stream
    fn start(&mut self) -> Result<()>;

    /// Stop and release the device
    fn stop(&mut self);
}

/// Build a player backend by name
pub fn new_player(
    name: &str,
    stream: Arc<Stream>,
    volume: Arc<PlayerVolume>,
) -> Result<Box<dyn Player>> {
    match name {
        "cpal" => Ok(Box::new(CpalPlayer::new(stream, volume))),
        "null" => Ok(Box::new(NullPlayer::new(stream))),
        other => Err(Error::Config(format!("unknown player '{other}'"))),
    }
}

/// Headless player: pulls frames at wall-clock pace and discards them.
/// Keeps the sync loop honest on machines without an audio device.
pub struct NullPlayer {
    stream: Arc<Stream>,
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl NullPlayer {
    /// Create a stopped null player
    pub fn new(stream: Arc<Stream>) -> Self {
        NullPlayer {
            stream,
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }
}

impl Player for NullPlayer {
    fn start(&mut self) -> Result<()> {
        let stream = Arc::clone(&self.stream);
        let stop = Arc::clone(&self.stop);
        self.handle = Some(std::thread::spawn(move || {
            let format = *stream.format();
            let chunk_ms = crate::config::DEFAULT_CHUNK_MS as u64;
            let frames = (format.rate() as u64 * chunk_ms / 1000) as u32;
            let mut buffer = vec![0u8; frames as usize * format.frame_size()];
            while !stop.load(Ordering::Acquire) {
                stream.get_player_chunk_or_silence(&mut buffer, 0, frames);
                std::thread::sleep(Duration::from_millis(chunk_ms));
            }
        }));
        Ok(())
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NullPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}
