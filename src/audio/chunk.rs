// ABOUTME: Timestamped PCM buffer with a frame read cursor
// ABOUTME: start() tracks the cursor so partially drained chunks keep honest timestamps

use bytes::Bytes;

use crate::audio::format::SampleFormat;
use crate::error::{Error, Result};
use crate::protocol::messages::{Tv, WireChunk};

/// A contiguous run of frames recorded starting at `timestamp` (server clock).
///
/// `read_frames` advances an internal frame cursor, and `start()` reflects
/// it: after reading n frames the chunk "starts" n/rate seconds later.
#[derive(Debug, Clone)]
pub struct PcmChunk {
    /// Sample format of the payload
    pub format: SampleFormat,
    /// Recording start of the first frame in the payload
    pub timestamp: Tv,
    payload: Bytes,
    /// Read position in frames
    idx: u32,
}

impl PcmChunk {
    /// Wrap a raw payload. Fails unless the payload is a whole number of frames.
    pub fn new(format: SampleFormat, timestamp: Tv, payload: Bytes) -> Result<Self> {
        if format.frame_size() == 0 {
            return Err(Error::Codec("chunk with uninitialized format".into()));
        }
        if payload.len() % format.frame_size() != 0 {
            return Err(Error::Codec(format!(
                "payload of {} bytes is not a whole number of {}-byte frames",
                payload.len(),
                format.frame_size()
            )));
        }
        Ok(PcmChunk {
            format,
            timestamp,
            payload,
            idx: 0,
        })
    }

    /// Wrap a received wire chunk, attaching the stream's sample format
    pub fn from_wire(wire: WireChunk, format: SampleFormat) -> Result<Self> {
        PcmChunk::new(format, wire.timestamp, wire.payload)
    }

    /// An all-silence chunk of `ms` milliseconds
    pub fn silence(format: SampleFormat, timestamp: Tv, ms: u32) -> Self {
        let frames = (format.rate() as u64 * ms as u64 / 1000) as usize;
        PcmChunk {
            format,
            timestamp,
            payload: Bytes::from(vec![0u8; frames * format.frame_size()]),
            idx: 0,
        }
    }

    /// The raw sample bytes (including already-read frames)
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Total number of frames in the payload
    pub fn frame_count(&self) -> u32 {
        (self.payload.len() / self.format.frame_size()) as u32
    }

    /// Current read position in frames
    pub fn read_pos(&self) -> u32 {
        self.idx
    }

    /// True once the cursor has consumed every frame
    pub fn is_end_of_chunk(&self) -> bool {
        self.idx >= self.frame_count()
    }

    /// Recording time of the frame under the cursor, in server-clock micros
    pub fn start_us(&self) -> i64 {
        self.timestamp.to_micros() + self.format.frames_to_micros(self.idx as u64)
    }

    /// Recording time just past the last frame
    pub fn end_us(&self) -> i64 {
        self.start_us() + self.duration_left_us()
    }

    /// Duration of the whole chunk in microseconds
    pub fn duration_us(&self) -> i64 {
        self.format.frames_to_micros(self.frame_count() as u64)
    }

    /// Duration from the cursor to the end, in microseconds
    pub fn duration_left_us(&self) -> i64 {
        self.format
            .frames_to_micros((self.frame_count() - self.idx.min(self.frame_count())) as u64)
    }

    /// Copy up to `frames` frames into `out`, advancing the cursor.
    ///
    /// Returns the number of frames copied; fewer than requested when the
    /// chunk runs out. `out` must hold at least `frames` frames.
    pub fn read_frames(&mut self, out: &mut [u8], frames: u32) -> u32 {
        let fs = self.format.frame_size();
        let available = self.frame_count() - self.idx;
        let n = frames.min(available) as usize;
        let from = self.idx as usize * fs;
        out[..n * fs].copy_from_slice(&self.payload[from..from + n * fs]);
        self.idx += n as u32;
        n as u32
    }

    /// Move the cursor by `frames` (negative seeks backwards), clamped to
    /// the chunk bounds. Returns the new position.
    pub fn seek(&mut self, frames: i64) -> u32 {
        let pos = (self.idx as i64 + frames).clamp(0, self.frame_count() as i64);
        self.idx = pos as u32;
        self.idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_of(frames: u32) -> PcmChunk {
        let format = SampleFormat::new(48_000, 16, 2);
        let payload = vec![1u8; frames as usize * format.frame_size()];
        PcmChunk::new(format, Tv::from_micros(1_000_000), Bytes::from(payload)).unwrap()
    }

    #[test]
    fn rejects_ragged_payloads() {
        let format = SampleFormat::new(48_000, 16, 2);
        let err = PcmChunk::new(format, Tv::default(), Bytes::from(vec![0u8; 5]));
        assert!(err.is_err());
    }

    #[test]
    fn reading_advances_start_time() {
        let mut chunk = chunk_of(960); // 20 ms at 48 kHz
        assert_eq!(chunk.duration_us(), 20_000);
        let mut out = vec![0u8; 480 * 4];
        let read = chunk.read_frames(&mut out, 480);
        assert_eq!(read, 480);
        // 480 frames at 48 kHz = exactly 10 ms.
        assert_eq!(chunk.start_us(), 1_000_000 + 10_000);
        assert_eq!(chunk.duration_left_us(), 10_000);
    }

    #[test]
    fn short_read_at_end_of_chunk() {
        let mut chunk = chunk_of(100);
        let mut out = vec![0u8; 400 * 4];
        assert_eq!(chunk.read_frames(&mut out, 400), 100);
        assert!(chunk.is_end_of_chunk());
        assert_eq!(chunk.read_frames(&mut out, 1), 0);
    }

    #[test]
    fn seek_is_clamped() {
        let mut chunk = chunk_of(100);
        assert_eq!(chunk.seek(1_000), 100);
        assert_eq!(chunk.seek(-1_000), 0);
        assert_eq!(chunk.seek(40), 40);
        assert_eq!(chunk.start_us(), 1_000_000 + 40 * 1_000_000 / 48_000);
    }
}
