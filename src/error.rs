// ABOUTME: Error types for the snapstream crate
// ABOUTME: One enum covering protocol, transport, sync, codec, sink and config failures

use std::time::Duration;

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// All errors the library can produce
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed header, truncated payload, unexpected message order.
    /// Fatal for a session; the owner closes and reconnects.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket / TLS / WebSocket / RIST I/O failure. Fatal for a session.
    #[error("transport error: {0}")]
    Transport(String),

    /// A request did not receive its reply in time. The session survives.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// A pending request was cancelled because the session shut down.
    #[error("request cancelled")]
    Cancelled,

    /// Playback drifted past the hard-sync threshold. Recovered internally.
    #[error("sync error: {0}")]
    Sync(String),

    /// A chunk failed to decode. The chunk is dropped, playback continues.
    #[error("codec error: {0}")]
    Codec(String),

    /// Audio device failure. The sink is torn down and retried with backoff.
    #[error("audio sink error: {0}")]
    Sink(String),

    /// The server rejected our credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Invalid URI or parameters. Fatal at startup.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}
