// ABOUTME: Encoder contract for server-side streams plus the PCM passthrough encoder
// ABOUTME: Encoders own the outgoing timestamp: each emitted chunk advances it by its duration

use bytes::{BufMut, Bytes, BytesMut};

use crate::audio::chunk::PcmChunk;
use crate::audio::format::SampleFormat;
use crate::error::{Error, Result};
use crate::protocol::messages::{CodecHeader, Tv};

/// One encoded chunk with its playback duration
#[derive(Debug)]
pub struct EncodedChunk {
    /// The encoded payload, timestamped in the stream clock
    pub chunk: PcmChunk,
    /// Duration in milliseconds (may be fractional for odd block sizes)
    pub duration_ms: f64,
}

/// Stream encoder contract.
///
/// PCM chunks are fed in with one fixed format; encoded chunks come out as
/// soon as the codec has complete frames. The encoder stamps every emitted
/// chunk with its internal stream timestamp and advances that timestamp by
/// the emitted duration, so the sum of durations equals stream time.
pub trait Encoder: Send {
    /// Codec name as carried in the codec header, e.g. "pcm"
    fn name(&self) -> &str;

    /// Initialize for `format`; builds the codec header
    fn init(&mut self, format: SampleFormat) -> Result<()>;

    /// The header to send to newly connected clients. Only valid after `init`.
    fn header(&self) -> &CodecHeader;

    /// Anchor the stream timestamp, in server-clock microseconds.
    /// Called once when the source starts producing.
    fn set_stream_timestamp(&mut self, ts_us: i64);

    /// Encode one chunk, returning zero or more encoded chunks
    fn encode(&mut self, chunk: &PcmChunk) -> Result<Vec<EncodedChunk>>;
}

/// Build an encoder for `codec`, or fail with `Error::Codec` for unknown names
pub fn new_encoder(codec: &str) -> Result<Box<dyn Encoder>> {
    match codec {
        "pcm" => Ok(Box::new(PcmEncoder::new())),
        other => Err(Error::Codec(format!("unsupported codec '{other}'"))),
    }
}

const ID_RIFF: u32 = 0x4646_4952;
const ID_WAVE: u32 = 0x4556_4157;
const ID_FMT: u32 = 0x2074_6d66;
const ID_DATA: u32 = 0x6174_6164;

/// Passthrough encoder: chunks go out as they came in, the codec header is
/// a 44-byte WAV-style header describing the sample format.
#[derive(Debug, Default)]
pub struct PcmEncoder {
    format: SampleFormat,
    header: Option<CodecHeader>,
    ts_us: i64,
}

impl PcmEncoder {
    /// Create an uninitialized encoder
    pub fn new() -> Self {
        PcmEncoder::default()
    }

    fn build_header(format: SampleFormat) -> CodecHeader {
        let mut p = BytesMut::with_capacity(44);
        p.put_u32_le(ID_RIFF);
        p.put_u32_le(36);
        p.put_u32_le(ID_WAVE);
        p.put_u32_le(ID_FMT);
        p.put_u32_le(16);
        p.put_u16_le(1);
        p.put_u16_le(format.channels());
        p.put_u32_le(format.rate());
        p.put_u32_le(format.rate() * format.bits() as u32 * format.channels() as u32 / 8);
        p.put_u16_le(format.channels() * ((format.bits() + 7) / 8));
        p.put_u16_le(format.bits());
        p.put_u32_le(ID_DATA);
        p.put_u32_le(0);
        CodecHeader {
            codec: "pcm".into(),
            payload: p.freeze(),
        }
    }
}

impl Encoder for PcmEncoder {
    fn name(&self) -> &str {
        "pcm"
    }

    fn init(&mut self, format: SampleFormat) -> Result<()> {
        if !format.is_initialized() {
            return Err(Error::Config("encoder needs an initialized format".into()));
        }
        self.format = format;
        self.header = Some(Self::build_header(format));
        Ok(())
    }

    fn header(&self) -> &CodecHeader {
        self.header.as_ref().expect("encoder not initialized")
    }

    fn set_stream_timestamp(&mut self, ts_us: i64) {
        self.ts_us = ts_us;
    }

    fn encode(&mut self, chunk: &PcmChunk) -> Result<Vec<EncodedChunk>> {
        if self.header.is_none() {
            return Err(Error::Codec("encode before init".into()));
        }
        let duration_ms = chunk.frame_count() as f64 / self.format.ms_rate();
        let out = PcmChunk::new(
            self.format,
            Tv::from_micros(self.ts_us),
            Bytes::copy_from_slice(chunk.payload()),
        )?;
        self.ts_us += (duration_ms * 1_000.0) as i64;
        Ok(vec![EncodedChunk {
            chunk: out,
            duration_ms,
        }])
    }
}
