// ABOUTME: PCM sample format: rate, bit depth, channel count
// ABOUTME: Derives sample and frame sizes, parses the rate:bits:channels string form

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Sample format of a PCM stream.
///
/// A frame is one sample across all channels, so for 48000:16:2 a frame is
/// 2 channels x 2 bytes = 4 bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleFormat {
    rate: u32,
    bits: u16,
    channels: u16,
}

impl SampleFormat {
    /// Build a format from its three components
    pub fn new(rate: u32, bits: u16, channels: u16) -> Self {
        SampleFormat {
            rate,
            bits,
            channels,
        }
    }

    /// Distinguishes the zero default from real values
    pub fn is_initialized(&self) -> bool {
        self.rate != 0 || self.bits != 0 || self.channels != 0
    }

    /// Sample rate in Hz
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Bits per mono sample
    pub fn bits(&self) -> u16 {
        self.bits
    }

    /// Number of channels
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Bytes of a single mono sample, e.g. 2 for 16 bits
    pub fn sample_size(&self) -> usize {
        (self.bits as usize + 7) / 8
    }

    /// Bytes of one frame: channels * sample size
    pub fn frame_size(&self) -> usize {
        self.channels as usize * self.sample_size()
    }

    /// Frames per millisecond
    pub fn ms_rate(&self) -> f64 {
        self.rate as f64 / 1_000.
    }

    /// Frames per microsecond
    pub fn us_rate(&self) -> f64 {
        self.rate as f64 / 1_000_000.
    }

    /// Duration of `frames` frames in microseconds
    pub fn frames_to_micros(&self, frames: u64) -> i64 {
        (frames as i64 * 1_000_000) / self.rate as i64
    }

    /// Number of whole frames in `micros` microseconds
    pub fn micros_to_frames(&self, micros: i64) -> i64 {
        micros * self.rate as i64 / 1_000_000
    }

    /// Merge in non-zero fields of `other`, keeping own values elsewhere.
    /// Used to apply a partial output format override.
    pub fn merged_with(&self, other: &SampleFormat) -> SampleFormat {
        SampleFormat {
            rate: if other.rate != 0 { other.rate } else { self.rate },
            bits: if other.bits != 0 { other.bits } else { self.bits },
            channels: if other.channels != 0 {
                other.channels
            } else {
                self.channels
            },
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.rate, self.bits, self.channels)
    }
}

impl FromStr for SampleFormat {
    type Err = Error;

    /// Parse "rate:bits:channels", with "*" accepted per field to mean
    /// "keep the source value" (encoded as 0).
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(Error::Config(format!("bad sample format '{s}'")));
        }
        let field = |p: &str| -> Result<u32> {
            if p == "*" {
                return Ok(0);
            }
            p.parse::<u32>()
                .map_err(|_| Error::Config(format!("bad sample format '{s}'")))
        };
        Ok(SampleFormat {
            rate: field(parts[0])?,
            bits: field(parts[1])? as u16,
            channels: field(parts[2])? as u16,
        })
    }
}
