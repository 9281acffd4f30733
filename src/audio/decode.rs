// ABOUTME: Decoder facade: one trait hiding codec-specific decoding
// ABOUTME: Ships a PCM passthrough decoder that reads the WAV-style codec header

use crate::audio::chunk::PcmChunk;
use crate::audio::format::SampleFormat;
use crate::error::{Error, Result};
use crate::protocol::messages::CodecHeader;

/// Uniform decoder contract.
///
/// `set_header` initializes the decoder from the stream's codec header and
/// returns the effective sample format. `decode` may return `Ok(None)` for
/// chunks a codec consumes without producing output (e.g. header packets);
/// an `Err` drops just that chunk. Decoders may move a decoded chunk's start
/// timestamp backwards to account for internal block caching.
pub trait Decoder: Send {
    /// Initialize from the codec header; returns the decoded sample format
    fn set_header(&mut self, header: &CodecHeader) -> Result<SampleFormat>;

    /// Decode one chunk
    fn decode(&mut self, chunk: PcmChunk) -> Result<Option<PcmChunk>>;

    /// The format returned by `set_header`, if initialized
    fn sample_format(&self) -> Option<SampleFormat>;
}

/// Build a decoder for `codec`, or fail with `Error::Codec` for unknown names
pub fn new_decoder(codec: &str) -> Result<Box<dyn Decoder>> {
    match codec {
        "pcm" => Ok(Box::new(PcmDecoder::new())),
        other => Err(Error::Codec(format!("unsupported codec '{other}'"))),
    }
}

/// Passthrough decoder for uncompressed streams.
///
/// The codec header is a 44-byte WAV-style header describing the format;
/// chunks are already raw samples.
#[derive(Debug, Default)]
pub struct PcmDecoder {
    format: Option<SampleFormat>,
}

impl PcmDecoder {
    /// Create an uninitialized decoder
    pub fn new() -> Self {
        PcmDecoder { format: None }
    }
}

impl Decoder for PcmDecoder {
    fn set_header(&mut self, header: &CodecHeader) -> Result<SampleFormat> {
        let p = &header.payload;
        if p.len() < 44 {
            return Err(Error::Codec(format!(
                "pcm codec header is {} bytes, want 44",
                p.len()
            )));
        }
        if &p[0..4] != b"RIFF" || &p[8..12] != b"WAVE" {
            return Err(Error::Codec("pcm codec header is not a wave header".into()));
        }
        let channels = u16::from_le_bytes([p[22], p[23]]);
        let rate = u32::from_le_bytes([p[24], p[25], p[26], p[27]]);
        let bits = u16::from_le_bytes([p[34], p[35]]);
        let format = SampleFormat::new(rate, bits, channels);
        if !format.is_initialized() || format.frame_size() == 0 {
            return Err(Error::Codec(format!("bad pcm format {format}")));
        }
        self.format = Some(format);
        Ok(format)
    }

    fn decode(&mut self, chunk: PcmChunk) -> Result<Option<PcmChunk>> {
        if self.format.is_none() {
            return Err(Error::Codec("decode before set_header".into()));
        }
        Ok(Some(chunk))
    }

    fn sample_format(&self) -> Option<SampleFormat> {
        self.format
    }
}
