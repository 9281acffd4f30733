// ABOUTME: cpal-based audio player pulling synchronized frames in the device callback
// ABOUTME: Tears the device stream down after 5 s without data and rebuilds on arrival

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};

use crate::audio::output::{Player, PlayerVolume, SINK_IDLE_TIMEOUT_MS};
use crate::audio::resample::read_sample;
use crate::error::{Error, Result};
use crate::stream::Stream;

/// Cross-platform audio output via cpal.
///
/// The device callback asks the stream for exactly the frames that are due
/// now, passing the device-reported playout delay; on failure the stream
/// fills silence. The cpal stream object is `!Send`, so a supervisor thread
/// owns it for its whole lifetime.
pub struct CpalPlayer {
    stream: Arc<Stream>,
    volume: Arc<PlayerVolume>,
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl CpalPlayer {
    /// Create a stopped player for `stream`
    pub fn new(stream: Arc<Stream>, volume: Arc<PlayerVolume>) -> Self {
        CpalPlayer {
            stream,
            volume,
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    fn supervisor(stream: Arc<Stream>, volume: Arc<PlayerVolume>, stop: Arc<AtomicBool>) {
        while !stop.load(Ordering::Acquire) {
            if !stream.wait_for_chunk(Duration::from_millis(500)) {
                continue;
            }
            match Self::build_device_stream(&stream, &volume) {
                Ok(device_stream) => {
                    if let Err(e) = device_stream.play() {
                        log::error!("starting audio stream: {e}");
                        std::thread::sleep(Duration::from_secs(1));
                        continue;
                    }
                    log::info!("audio device opened ({})", stream.format());
                    while !stop.load(Ordering::Acquire)
                        && stream.millis_since_last_chunk() < SINK_IDLE_TIMEOUT_MS
                    {
                        std::thread::sleep(Duration::from_millis(250));
                    }
                    drop(device_stream);
                    if !stop.load(Ordering::Acquire) {
                        log::info!("no audio for {} ms, closing device", SINK_IDLE_TIMEOUT_MS);
                    }
                }
                Err(e) => {
                    log::error!("opening audio device: {e}");
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }
    }

    fn build_device_stream(
        stream: &Arc<Stream>,
        volume: &Arc<PlayerVolume>,
    ) -> Result<cpal::Stream> {
        let format = *stream.format();
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Sink("no output device available".into()))?;

        if let Ok(default) = device.default_output_config() {
            if default.sample_rate().0 != format.rate()
                || default.channels() != format.channels()
            {
                log::warn!(
                    "requested {}, device default is {} Hz / {} ch",
                    format,
                    default.sample_rate().0,
                    default.channels()
                );
            }
        }

        let config = StreamConfig {
            channels: format.channels(),
            sample_rate: SampleRate(format.rate()),
            buffer_size: BufferSize::Default,
        };

        let stream = Arc::clone(stream);
        let volume = Arc::clone(volume);
        let channels = format.channels() as usize;
        let frame_size = format.frame_size();
        let sample_size = format.sample_size();
        let bits = format.bits();
        let mut scratch: Vec<u8> = Vec::new();

        let device_stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], info: &cpal::OutputCallbackInfo| {
                    let frames = (data.len() / channels) as u32;
                    let need = frames as usize * frame_size;
                    if scratch.len() < need {
                        scratch.resize(need, 0);
                    }

                    let timestamp = info.timestamp();
                    let dac_delay = timestamp
                        .playback
                        .duration_since(&timestamp.callback)
                        .unwrap_or_default();

                    stream.get_player_chunk_or_silence(
                        &mut scratch[..need],
                        dac_delay.as_micros() as i64,
                        frames,
                    );

                    let gain = volume.gain();
                    for (i, out) in data.iter_mut().enumerate() {
                        *out = gain * read_sample(&scratch[i * sample_size..], bits);
                    }
                },
                |e| log::error!("audio stream error: {e}"),
                None,
            )
            .map_err(|e| Error::Sink(e.to_string()))?;
        Ok(device_stream)
    }
}

impl Player for CpalPlayer {
    fn start(&mut self) -> Result<()> {
        self.stop.store(false, Ordering::Release);
        let stream = Arc::clone(&self.stream);
        let volume = Arc::clone(&self.volume);
        let stop = Arc::clone(&self.stop);
        self.handle = Some(std::thread::spawn(move || {
            Self::supervisor(stream, volume, stop);
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

impl Drop for CpalPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}
