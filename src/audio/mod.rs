// ABOUTME: Audio building blocks: sample format, chunks, codecs, resampling, output
// ABOUTME: Everything that touches raw PCM lives under this module

pub mod chunk;
pub mod decode;
pub mod format;
pub mod output;
pub mod resample;

pub use chunk::PcmChunk;
pub use format::SampleFormat;
