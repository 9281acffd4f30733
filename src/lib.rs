// ABOUTME: Multi-room synchronized audio streaming: server, client and the shared pipeline
// ABOUTME: Wire protocol, clock sync and the adaptive jitter buffer live here

//! Room-synchronous audio streaming.
//!
//! A server ingests PCM, encodes it into timestamped chunks and fans them
//! out to any number of clients; every client renders the same wall-clock
//! moment of audio regardless of its network and DAC latencies. Three
//! subsystems carry that guarantee:
//!
//! * the self-timestamping wire protocol ([`protocol`]), spoken over TCP,
//!   TLS, WebSocket or a reliable UDP overlay ([`transport`]),
//! * continuous clock synchronization between client and server ([`sync`]),
//! * the client's adaptive jitter buffer ([`stream`]), which decides at
//!   every DAC callback exactly which samples are due and corrects drift
//!   by fractional resampling.
//!
//! [`server::Server`] and [`client::Controller`] tie the ends together.

pub mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod stream;
pub mod sync;
pub mod transport;

pub use error::{Error, Result};
