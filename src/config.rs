// ABOUTME: Protocol-wide defaults and constants
// ABOUTME: Ports, buffer sizes, sample format and request id bounds

/// Default port for the audio stream protocol
pub const DEFAULT_STREAM_PORT: u16 = 1704;
/// Default port for the control protocol
pub const DEFAULT_CONTROL_PORT: u16 = 1705;
/// Default HTTP (plain WebSocket) port
pub const DEFAULT_HTTP_PORT: u16 = 1780;
/// Default HTTPS (TLS WebSocket) port
pub const DEFAULT_HTTPS_PORT: u16 = 1788;

/// Request ids wrap back to 1 after this value, bounding the pending table
pub const MAX_REQUEST_ID: u16 = 10_000;

/// Default end-to-end buffer (distance between recording and playout) in ms
pub const DEFAULT_BUFFER_MS: i64 = 1000;
/// Default stream read chunk size in ms
pub const DEFAULT_CHUNK_MS: u32 = 20;

/// Default sample rate in Hz
pub const DEFAULT_RATE: u32 = 48_000;
/// Default bits per sample
pub const DEFAULT_BITS: u16 = 16;
/// Default channel count
pub const DEFAULT_CHANNELS: u16 = 2;
