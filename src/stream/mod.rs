// ABOUTME: Time-synchronized chunk queue feeding the audio callback
// ABOUTME: Hard sync (silence / fast-forward) plus soft sync (uniform frame insert/drop)

pub mod stats;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::audio::chunk::PcmChunk;
use crate::audio::format::SampleFormat;
use crate::audio::resample::Resampler;
use crate::error::Result;
use crate::sync::clock::TimeProvider;
use stats::RollingBuffer;

/// Short-window median above this starts a sample rate correction
const CORRECTION_BEGIN_US: i64 = 100;
/// Rate correction per 100 us of short-window median
const RATE_CORRECTION_STEP: f64 = 0.000_05;
/// Rate correction ceiling
const RATE_CORRECTION_MAX: f64 = 0.000_5;

/// Long-window median limit before a hard sync (us)
const HARD_SYNC_LONG_US: i64 = 2_000;
/// Short-window median limit before a hard sync (us)
const HARD_SYNC_SHORT_US: i64 = 5_000;
/// Mini-window median limit before a hard sync (us)
const HARD_SYNC_MINI_US: i64 = 50_000;
/// Instantaneous age limit before a hard sync (us)
const HARD_SYNC_AGE_US: i64 = 500_000;
/// Median-based hard syncs additionally require this much instantaneous age
const AGE_GATE_US: i64 = 500;

/// Chunks older than the buffer target plus this are discarded
const STALE_GRACE_US: i64 = 5_000_000;

#[derive(Debug)]
struct Inner {
    chunks: VecDeque<PcmChunk>,
    /// Chunk currently being drained into the sink
    chunk: Option<PcmChunk>,
    mini: RollingBuffer,
    short: RollingBuffer,
    long: RollingBuffer,
    median_us: i64,
    short_median_us: i64,
    last_update_sec: i64,
    played_frames: u32,
    correct_after_x_frames: i32,
    frame_delta: i32,
    hard_sync: bool,
    read_buffer: Vec<u8>,
}

impl Inner {
    fn reset_stats(&mut self) {
        self.mini.clear();
        self.short.clear();
        self.long.clear();
    }
}

/// Queue of PCM chunks keyed by server-clock recording time.
///
/// `add_chunk` is called from the network task; `get_player_chunk` from the
/// audio callback. The queue mutex guards only O(1) pointer and counter work
/// plus the rolling-window updates; decoding and resampling happen before
/// insertion, outside the lock.
pub struct Stream {
    format: SampleFormat,
    in_format: SampleFormat,
    time: TimeProvider,
    buffer_us: AtomicI64,
    /// Local receive time of the newest chunk, for sink idle detection
    last_chunk_local_us: AtomicI64,
    resampler: Mutex<Resampler>,
    inner: Mutex<Inner>,
    chunk_available: Condvar,
}

impl Stream {
    /// Create a stream converting from `in_format` to `out_format`.
    ///
    /// Zero fields of `out_format` fall back to the input value.
    pub fn new(in_format: SampleFormat, out_format: SampleFormat, time: TimeProvider) -> Result<Self> {
        let format = if out_format.is_initialized() {
            in_format.merged_with(&out_format)
        } else {
            in_format
        };
        Ok(Stream {
            format,
            in_format,
            time,
            buffer_us: AtomicI64::new(0),
            last_chunk_local_us: AtomicI64::new(i64::MIN),
            resampler: Mutex::new(Resampler::new(in_format, format)?),
            inner: Mutex::new(Inner {
                chunks: VecDeque::new(),
                chunk: None,
                mini: RollingBuffer::new(20),
                short: RollingBuffer::new(100),
                long: RollingBuffer::new(500),
                median_us: 0,
                short_median_us: 0,
                last_update_sec: 0,
                played_frames: 0,
                correct_after_x_frames: 0,
                frame_delta: 0,
                hard_sync: true,
                read_buffer: Vec::new(),
            }),
            chunk_available: Condvar::new(),
        })
    }

    /// The output sample format fed to the sink
    pub fn format(&self) -> &SampleFormat {
        &self.format
    }

    /// The input sample format of chunks handed to `add_chunk`
    pub fn in_format(&self) -> &SampleFormat {
        &self.in_format
    }

    /// Set the end-to-end playout latency target in ms
    pub fn set_buffer_ms(&self, buffer_ms: i64) {
        self.buffer_us.store(buffer_ms * 1_000, Ordering::Release);
    }

    fn buffer_us(&self) -> i64 {
        self.buffer_us.load(Ordering::Acquire)
    }

    /// Number of chunks waiting in the queue (excluding the one draining)
    pub fn queued(&self) -> usize {
        self.inner.lock().unwrap().chunks.len()
    }

    /// Milliseconds since the last chunk arrived, `i64::MAX` if none ever did
    pub fn millis_since_last_chunk(&self) -> i64 {
        let last = self.last_chunk_local_us.load(Ordering::Acquire);
        if last == i64::MIN {
            return i64::MAX;
        }
        (self.time.local_now_us() - last) / 1_000
    }

    /// Queue a chunk for playback.
    ///
    /// Stale chunks (older than the buffer target plus a 5 s grace) are
    /// dropped on arrival, and the same test prunes the queue front. The
    /// queue is kept sorted by recording time, so late out-of-order arrivals
    /// (reliable-UDP transports reorder) land in the right place.
    pub fn add_chunk(&self, chunk: PcmChunk) {
        let stale_us = STALE_GRACE_US + self.buffer_us();
        let age = self.time.server_now_us() - chunk.start_us();
        if age > stale_us {
            log::debug!("dropping stale chunk, age {} ms", age / 1_000);
            return;
        }

        let chunk = if self.in_format != self.format {
            match self.resampler.lock().unwrap().resample(chunk) {
                Some(c) => c,
                None => return,
            }
        } else {
            chunk
        };

        self.last_chunk_local_us
            .store(self.time.local_now_us(), Ordering::Release);

        let mut inner = self.inner.lock().unwrap();

        // Sorted insert; in the common case the new chunk is the newest.
        let start = chunk.start_us();
        let pos = inner
            .chunks
            .iter()
            .rposition(|c| c.start_us() <= start)
            .map(|p| p + 1)
            .unwrap_or(0);
        inner.chunks.insert(pos, chunk);

        while let Some(front) = inner.chunks.front() {
            let age = self.time.server_now_us() - front.start_us();
            if age > stale_us {
                inner.chunks.pop_front();
                log::trace!(
                    "oldest chunk too old: {} ms, {} left",
                    age / 1_000,
                    inner.chunks.len()
                );
            } else {
                break;
            }
        }
        drop(inner);
        self.chunk_available.notify_all();
    }

    /// Drop all queued chunks and restart synchronization from scratch
    pub fn clear_chunks(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.chunks.clear();
        inner.chunk = None;
        inner.hard_sync = true;
        inner.reset_stats();
    }

    /// Block until a chunk is queued or `timeout` elapses
    pub fn wait_for_chunk(&self, timeout: Duration) -> bool {
        let inner = self.inner.lock().unwrap();
        let (inner, res) = self
            .chunk_available
            .wait_timeout_while(inner, timeout, |i| i.chunks.is_empty() && i.chunk.is_none())
            .unwrap();
        drop(inner);
        !res.timed_out()
    }

    /// Fill `out` with `frames` frames due for playout `dac_delay_us`
    /// microseconds from now, or fill silence when no data is playable.
    pub fn get_player_chunk_or_silence(&self, out: &mut [u8], dac_delay_us: i64, frames: u32) -> bool {
        let ok = self.get_player_chunk(out, dac_delay_us, frames);
        if !ok {
            let fs = self.format.frame_size();
            out[..frames as usize * fs].fill(0);
        }
        ok
    }

    /// Fill `out` with the `frames` frames that are due `dac_delay_us`
    /// microseconds from now, according to the synchronized server clock.
    ///
    /// Returns false (leaving `out` unspecified) when no playable data is
    /// available; the caller emits silence.
    pub fn get_player_chunk(&self, out: &mut [u8], dac_delay_us: i64, frames: u32) -> bool {
        let buffer_us = self.buffer_us();
        if dac_delay_us > buffer_us {
            log::info!(
                "sink delay {} ms exceeds buffer {} ms",
                dac_delay_us / 1_000,
                buffer_us / 1_000
            );
            return false;
        }

        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let now_sec = self.time.local_now_us() / 1_000_000;

        if inner.chunk.is_none() {
            match inner.chunks.pop_front() {
                Some(c) => inner.chunk = Some(c),
                None => {
                    if now_sec != inner.last_update_sec {
                        inner.last_update_sec = now_sec;
                        log::info!("no chunks available");
                    }
                    return false;
                }
            }
        }

        if inner.hard_sync {
            return self.hard_sync_chunk(inner, out, dac_delay_us, frames, buffer_us);
        }

        // Soft sync: realize the scheduled rate correction as whole frames.
        let mut frames_correction: i32 = 0;
        if inner.correct_after_x_frames != 0 {
            inner.played_frames += frames;
            if inner.played_frames >= inner.correct_after_x_frames.unsigned_abs() {
                frames_correction = inner.played_frames as i32 / inner.correct_after_x_frames;
                inner.played_frames %= inner.correct_after_x_frames.unsigned_abs();
            }
        }

        let tp = match self.read_corrected(inner, out, frames, frames_correction) {
            Some(tp) => tp,
            None => {
                log::info!("not enough frames available, requesting hard sync");
                inner.hard_sync = true;
                return false;
            }
        };

        let age = self.time.server_now_us() - tp - buffer_us + dac_delay_us;

        self.set_real_sample_rate(inner, self.format.rate() as f64);
        if inner.long.full() && inner.median_us.abs() > HARD_SYNC_LONG_US && age.abs() > AGE_GATE_US {
            log::info!("long window median {} us, hard sync", inner.median_us);
            inner.hard_sync = true;
        } else if inner.short.full()
            && inner.short_median_us.abs() > HARD_SYNC_SHORT_US
            && age.abs() > AGE_GATE_US
        {
            log::info!("short window median {} us, hard sync", inner.short_median_us);
            inner.hard_sync = true;
        } else if inner.mini.full()
            && inner.mini.median().abs() > HARD_SYNC_MINI_US
            && age.abs() > AGE_GATE_US
        {
            log::info!("mini window median {} us, hard sync", inner.mini.median());
            inner.hard_sync = true;
        } else if age.abs() > HARD_SYNC_AGE_US {
            log::info!("age {} us, hard sync", age);
            inner.hard_sync = true;
        } else if inner.short.full() {
            // Steady drift: nudge the effective sample rate so single frames
            // get dropped (late) or duplicated (early) at a regular stride.
            let mini_median = inner.mini.median();
            let short_median = inner.short_median_us;
            if short_median > CORRECTION_BEGIN_US && mini_median > 50 && age > 50 {
                let rate = ((short_median / 100) as f64 * RATE_CORRECTION_STEP).min(RATE_CORRECTION_MAX);
                self.set_real_sample_rate(inner, self.format.rate() as f64 * (1.0 - rate));
            } else if short_median < -CORRECTION_BEGIN_US && mini_median < -50 && age < -50 {
                let rate = ((-short_median / 100) as f64 * RATE_CORRECTION_STEP).min(RATE_CORRECTION_MAX);
                self.set_real_sample_rate(inner, self.format.rate() as f64 * (1.0 + rate));
            }
        }

        inner.mini.add(age);
        inner.short.add(age);
        inner.long.add(age);

        if now_sec != inner.last_update_sec {
            inner.last_update_sec = now_sec;
            inner.median_us = inner.long.median();
            inner.short_median_us = inner.short.median();
            log::debug!(
                "age: {}\tmini: {}\tshort: {}\tlong: {}\tqueue: {}\tdac: {} ms\tdelta: {}",
                age / 100,
                inner.mini.median() / 100,
                inner.short_median_us / 100,
                inner.median_us / 100,
                inner.chunks.len(),
                dac_delay_us / 1_000,
                inner.frame_delta
            );
            inner.frame_delta = 0;
        }

        age.abs() < HARD_SYNC_AGE_US
    }

    /// Bootstrap / recovery path: play silence while the front chunk is in
    /// the future, fast-forward past it when it is late, and splice a silent
    /// prefix on the boundary.
    fn hard_sync_chunk(
        &self,
        inner: &mut Inner,
        out: &mut [u8],
        dac_delay_us: i64,
        frames: u32,
        buffer_us: i64,
    ) -> bool {
        let fs = self.format.frame_size();
        let req_duration_us = self.format.frames_to_micros(frames as u64);
        let server_now = self.time.server_now_us();

        let chunk_start = inner.chunk.as_ref().map(PcmChunk::start_us).unwrap_or(0);
        let mut age = server_now - chunk_start - buffer_us + dac_delay_us;

        if age < -req_duration_us {
            // Front chunk is due further out than this whole callback covers.
            out[..frames as usize * fs].fill(0);
            return true;
        }

        if age > 0 {
            log::debug!("age {} ms, dropping old chunks", age / 1_000);
            // Drop the current chunk first so an empty queue cannot loop.
            inner.chunk = None;
            while let Some(mut c) = inner.chunks.pop_front() {
                age = server_now - c.start_us() - buffer_us + dac_delay_us;
                if age > 0 && age < c.duration_us() {
                    // Fast forward inside this chunk to land exactly on time.
                    c.seek(self.format.micros_to_frames(age));
                    age = 0;
                }
                if age <= 0 {
                    inner.chunk = Some(c);
                    break;
                }
            }
        }

        if age <= 0 && inner.chunk.is_some() {
            // E.g. age -5 ms with a 20 ms callback: 5 ms of silence, then
            // 15 ms of real data.
            let silent_frames = self.format.micros_to_frames(-age).max(0) as u32;
            let in_reach = silent_frames <= frames;
            let silent_frames = silent_frames.min(frames);
            if silent_frames > 0 {
                log::debug!("silent frames: {} of {}, age {} us", silent_frames, frames, age);
                out[..silent_frames as usize * fs].fill(0);
            }
            if Self::read_plain(inner, &mut out[silent_frames as usize * fs..], frames - silent_frames)
                .is_none()
            {
                return false;
            }
            if in_reach {
                inner.hard_sync = false;
                inner.reset_stats();
            }
            return true;
        }
        false
    }

    /// Read `frames` frames from the queue without correction.
    /// Returns the recording time of the first frame, or None when the
    /// queue runs dry mid-read.
    fn read_plain(inner: &mut Inner, out: &mut [u8], frames: u32) -> Option<i64> {
        if inner.chunk.is_none() {
            inner.chunk = inner.chunks.pop_front();
        }
        let fs = inner.chunk.as_ref()?.format.frame_size();
        let tp = inner.chunk.as_ref()?.start_us();
        let mut read: u32 = 0;
        while read < frames {
            let chunk = inner.chunk.as_mut()?;
            read += chunk.read_frames(&mut out[read as usize * fs..], frames - read);
            if read < frames && chunk.is_end_of_chunk() {
                match inner.chunks.pop_front() {
                    Some(c) => inner.chunk = Some(c),
                    None => return None,
                }
            }
        }
        Some(tp)
    }

    /// Read `frames + correction` frames and fit them into `frames` output
    /// frames, spreading the dropped (correction > 0) or duplicated
    /// (correction < 0) frames uniformly across the buffer.
    fn read_corrected(
        &self,
        inner: &mut Inner,
        out: &mut [u8],
        frames: u32,
        mut correction: i32,
    ) -> Option<i64> {
        if correction < 0 && frames as i32 + correction <= 0 {
            correction = -(frames as i32) + 1;
        }
        if correction == 0 {
            return Self::read_plain(inner, out, frames);
        }

        inner.frame_delta -= correction;

        let fs = self.format.frame_size();
        let to_read = (frames as i32 + correction) as u32;
        let mut read_buffer = std::mem::take(&mut inner.read_buffer);
        if read_buffer.len() < to_read as usize * fs {
            read_buffer.resize(to_read as usize * fs, 0);
        }

        let tp = Self::read_plain(inner, &mut read_buffer, to_read);
        if tp.is_none() {
            inner.read_buffer = read_buffer;
            return None;
        }

        // One more slice than frames to correct: slice k shifts by k frames,
        // so exactly one frame is skipped (or repeated) per slice boundary.
        let max = if correction < 0 { frames } else { to_read } as usize;
        let mut slices = correction.unsigned_abs() as usize + 1;
        // More slices than frames would make the per-slice size zero.
        if slices > max {
            slices = max;
        }
        let mut size = max / slices;

        let mut pos = 0usize;
        for n in 0..slices {
            if n + 1 == slices {
                size = max - pos;
            }
            if correction < 0 {
                out[pos * fs..(pos + size) * fs]
                    .copy_from_slice(&read_buffer[(pos - n) * fs..(pos - n + size) * fs]);
            } else {
                out[(pos - n) * fs..(pos - n + size) * fs]
                    .copy_from_slice(&read_buffer[pos * fs..(pos + size) * fs]);
            }
            pos += size;
        }

        inner.read_buffer = read_buffer;
        tp
    }

    /// Derive the insert/drop stride from the corrected sample rate.
    fn set_real_sample_rate(&self, inner: &mut Inner, sample_rate: f64) {
        let rate = self.format.rate() as f64;
        if sample_rate == rate {
            inner.correct_after_x_frames = 0;
        } else {
            let ratio = rate / sample_rate;
            inner.correct_after_x_frames = (ratio / (ratio - 1.0)).round() as i32;
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("format", &self.format)
            .field("in_format", &self.in_format)
            .field("buffer_us", &self.buffer_us)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::protocol::messages::Tv;

    const FORMAT: (u32, u16, u16) = (48_000, 16, 2);

    fn test_stream() -> Stream {
        let format = SampleFormat::new(FORMAT.0, FORMAT.1, FORMAT.2);
        let stream = Stream::new(format, format, TimeProvider::new()).unwrap();
        stream.set_buffer_ms(1_000);
        stream
    }

    /// A chunk whose frames each carry their own index in both samples
    fn indexed_chunk(start_frame: i16, frames: u32, timestamp_us: i64) -> PcmChunk {
        let format = SampleFormat::new(FORMAT.0, FORMAT.1, FORMAT.2);
        let mut payload = Vec::with_capacity(frames as usize * 4);
        for i in 0..frames as i16 {
            let v = (start_frame + i).to_le_bytes();
            payload.extend_from_slice(&v);
            payload.extend_from_slice(&v);
        }
        PcmChunk::new(format, Tv::from_micros(timestamp_us), Bytes::from(payload)).unwrap()
    }

    fn frame_indices(buffer: &[u8], frames: usize) -> Vec<i16> {
        (0..frames)
            .map(|f| i16::from_le_bytes([buffer[f * 4], buffer[f * 4 + 1]]))
            .collect()
    }

    fn run_correction(frames: u32, correction: i32) -> Vec<i16> {
        let stream = test_stream();
        let mut inner = stream.inner.lock().unwrap();
        // Enough source material for the read regardless of direction.
        inner
            .chunks
            .push_back(indexed_chunk(0, frames + correction.unsigned_abs() + 8, 0));
        let mut out = vec![0u8; frames as usize * 4];
        let tp = stream.read_corrected(&mut inner, &mut out, frames, correction);
        assert!(tp.is_some());
        frame_indices(&out, frames as usize)
    }

    #[test]
    fn dropped_frames_are_spread_uniformly() {
        let frames = 960u32;
        let correction = 4i32;
        let indices = run_correction(frames, correction);

        // Exactly `correction` single-frame skips, nothing else.
        let mut skip_positions = Vec::new();
        for w in 0..indices.len() - 1 {
            match indices[w + 1] - indices[w] {
                1 => {}
                2 => skip_positions.push(w),
                other => panic!("unexpected jump of {other} at {w}"),
            }
        }
        assert_eq!(skip_positions.len(), correction as usize);

        // Skips sit on (roughly) equally sized slice boundaries.
        let expected_spacing = (frames as i32 + correction) / (correction + 1);
        for pair in skip_positions.windows(2) {
            let spacing = (pair[1] - pair[0]) as i32;
            assert!(
                (spacing - expected_spacing).abs() <= expected_spacing,
                "spacing {spacing} vs expected {expected_spacing}"
            );
        }
    }

    #[test]
    fn inserted_frames_are_spread_uniformly() {
        let frames = 960u32;
        let correction = -4i32;
        let indices = run_correction(frames, correction);

        let mut dup_positions = Vec::new();
        for w in 0..indices.len() - 1 {
            match indices[w + 1] - indices[w] {
                1 => {}
                0 => dup_positions.push(w),
                other => panic!("unexpected jump of {other} at {w}"),
            }
        }
        assert_eq!(dup_positions.len(), correction.unsigned_abs() as usize);
    }

    #[test]
    fn oversized_correction_is_capped() {
        // More corrections than frames must not underflow the slice math.
        let indices = run_correction(8, 12);
        assert_eq!(indices.len(), 8);
        let indices = run_correction(8, -12);
        assert_eq!(indices.len(), 8);
    }

    #[test]
    fn correction_stride_matches_rate_factor() {
        let stream = test_stream();
        let mut inner = stream.inner.lock().unwrap();

        // 100 ppm slower: one frame dropped roughly every 10_000 frames.
        stream.set_real_sample_rate(&mut inner, 48_000.0 * (1.0 - 100e-6));
        assert!((inner.correct_after_x_frames - 10_000).abs() <= 1);

        // Faster real rate schedules insertions (negative stride).
        stream.set_real_sample_rate(&mut inner, 48_000.0 * (1.0 + 100e-6));
        assert!((inner.correct_after_x_frames + 10_000).abs() <= 1);

        stream.set_real_sample_rate(&mut inner, 48_000.0);
        assert_eq!(inner.correct_after_x_frames, 0);
    }

    #[test]
    fn steady_lateness_enables_soft_correction() {
        let stream = test_stream();
        let now = stream.time.server_now_us();
        {
            let mut inner = stream.inner.lock().unwrap();
            // Pretend the short and mini windows agree we are ~200 us late.
            for _ in 0..100 {
                inner.short.add(200);
            }
            for _ in 0..20 {
                inner.mini.add(200);
            }
            inner.short_median_us = 200;
            inner.hard_sync = false;
            // One chunk that is 200 us past due right now.
            inner
                .chunks
                .push_back(indexed_chunk(0, 960, now - 1_000_000 - 200));
        }

        let mut out = vec![0u8; 960 * 4];
        assert!(stream.get_player_chunk(&mut out, 0, 480));

        let inner = stream.inner.lock().unwrap();
        assert!(!inner.hard_sync);
        // Late playback means dropping frames: 200 us median maps to a
        // 1e-4 rate cut, one frame per ~10_000.
        assert!(inner.correct_after_x_frames > 0);
        assert!(
            (5_000..=20_000).contains(&inner.correct_after_x_frames),
            "stride {}",
            inner.correct_after_x_frames
        );
    }

    #[test]
    fn chunks_stay_sorted_and_fresh() {
        let stream = test_stream();
        let now = stream.time.server_now_us();

        // Insert out of order, including one hopelessly stale chunk.
        stream.add_chunk(indexed_chunk(0, 960, now + 40_000));
        stream.add_chunk(indexed_chunk(0, 960, now));
        stream.add_chunk(indexed_chunk(0, 960, now - 7_000_000));
        stream.add_chunk(indexed_chunk(0, 960, now + 20_000));

        let inner = stream.inner.lock().unwrap();
        let starts: Vec<i64> = inner.chunks.iter().map(|c| c.start_us()).collect();
        assert_eq!(starts.len(), 3, "stale chunk must be gone");
        assert!(starts.windows(2).all(|w| w[0] <= w[1]));
    }
}
