// ABOUTME: Transport abstraction: framed message streams over TCP, TLS, WebSocket and RIST
// ABOUTME: One read/write surface regardless of the underlying byte transport

pub mod rist;
pub mod tcp;
pub mod tls;
pub mod ws;

use std::fmt;
use std::str::FromStr;

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::{Error, Result};
use crate::protocol::messages::{BaseMessage, EncodedFrame, BASE_MESSAGE_SIZE};

/// Byte stream bound for boxed full-duplex transports (TCP with or without TLS)
pub trait AsyncRw: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncRw for T {}

/// Byte stream bound for boxed read halves (TCP with or without TLS)
pub trait AsyncR: AsyncRead + Unpin + Send {}
impl<T: AsyncRead + Unpin + Send> AsyncR for T {}

/// Byte stream bound for boxed write halves (TCP with or without TLS)
pub trait AsyncW: AsyncWrite + Unpin + Send {}
impl<T: AsyncWrite + Unpin + Send> AsyncW for T {}

// =============================================================================
// Endpoints
// =============================================================================

/// Transport scheme of a server endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plain TCP framing
    Tcp,
    /// TLS over TCP
    Tls,
    /// Plain WebSocket, one binary frame per message
    Ws,
    /// WebSocket over TLS
    Wss,
    /// Reliable UDP overlay with virtual-port demultiplexing
    Rist,
}

/// A parsed `scheme://host:port` server address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Transport scheme
    pub scheme: Scheme,
    /// Host name or address
    pub host: String,
    /// TCP or UDP port
    pub port: u16,
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, rest) = match s.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => ("tcp", s),
        };
        let scheme = match scheme {
            "tcp" => Scheme::Tcp,
            "tls" => Scheme::Tls,
            "ws" => Scheme::Ws,
            "wss" => Scheme::Wss,
            "rist" => Scheme::Rist,
            other => return Err(Error::Config(format!("unknown scheme '{other}'"))),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse::<u16>()
                    .map_err(|_| Error::Config(format!("bad port in '{s}'")))?,
            ),
            None => (rest.to_string(), crate::config::DEFAULT_STREAM_PORT),
        };
        if host.is_empty() {
            return Err(Error::Config(format!("missing host in '{s}'")));
        }
        Ok(Endpoint { scheme, host, port })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Tcp => "tcp",
            Scheme::Tls => "tls",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
            Scheme::Rist => "rist",
        };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

// =============================================================================
// Framing over byte streams
// =============================================================================

/// Reads length-delimited messages from any byte stream half
pub struct FramedReader<R> {
    inner: R,
    header_buf: [u8; BASE_MESSAGE_SIZE],
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    /// Wrap a read half
    pub fn new(inner: R) -> Self {
        FramedReader {
            inner,
            header_buf: [0u8; BASE_MESSAGE_SIZE],
        }
    }

    /// Read one message: fixed header, then `size` payload bytes
    pub async fn read_message(&mut self) -> Result<(BaseMessage, Bytes)> {
        self.inner.read_exact(&mut self.header_buf).await?;
        let header = BaseMessage::read(&self.header_buf)?;
        let mut payload = BytesMut::zeroed(header.size as usize);
        self.inner.read_exact(&mut payload).await?;
        Ok((header, payload.freeze()))
    }
}

/// Writes framed messages to any byte stream half
pub struct FramedWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    /// Wrap a write half
    pub fn new(inner: W) -> Self {
        FramedWriter { inner }
    }

    /// Write one encoded message
    pub async fn write_frame(&mut self, frame: &EncodedFrame) -> Result<()> {
        self.inner.write_all(&frame.bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write half
    pub async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

// =============================================================================
// Transport halves
// =============================================================================

/// Read half of an open transport
pub enum TransportReader {
    /// TCP or TLS byte stream
    Framed(FramedReader<Box<dyn AsyncR>>),
    /// WebSocket (plain or TLS)
    Ws(futures_util::stream::SplitStream<ws::WsStream>),
    /// RIST overlay delivery queue
    Rist(rist::RistReader),
}

impl TransportReader {
    /// Read the next message. An `Err` means the session is gone; the caller
    /// closes and, client-side, reconnects.
    pub async fn read_message(&mut self) -> Result<(BaseMessage, Bytes)> {
        match self {
            TransportReader::Framed(r) => r.read_message().await,
            TransportReader::Ws(r) => loop {
                let msg = r
                    .next()
                    .await
                    .ok_or_else(|| Error::Transport("websocket closed".into()))?
                    .map_err(|e| Error::Transport(e.to_string()))?;
                match msg {
                    WsMessage::Binary(data) => {
                        let header = BaseMessage::read(&data)?;
                        let payload = data.slice(BASE_MESSAGE_SIZE..);
                        if payload.len() != header.size as usize {
                            return Err(Error::Protocol(format!(
                                "websocket frame carries {} payload bytes, header says {}",
                                payload.len(),
                                header.size
                            )));
                        }
                        return Ok((header, payload));
                    }
                    WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                    WsMessage::Close(_) => {
                        return Err(Error::Transport("websocket closed by peer".into()))
                    }
                    other => {
                        log::warn!("ignoring unexpected websocket message: {other:?}");
                        continue;
                    }
                }
            },
            TransportReader::Rist(r) => r.read_message().await,
        }
    }
}

/// Write half of an open transport
pub enum TransportWriter {
    /// TCP or TLS byte stream
    Framed(FramedWriter<Box<dyn AsyncW>>),
    /// WebSocket (plain or TLS)
    Ws(futures_util::stream::SplitSink<ws::WsStream, WsMessage>),
    /// RIST overlay
    Rist(rist::RistWriter),
}

impl TransportWriter {
    /// Write one encoded message
    pub async fn write_frame(&mut self, frame: &EncodedFrame) -> Result<()> {
        match self {
            TransportWriter::Framed(w) => w.write_frame(frame).await,
            TransportWriter::Ws(w) => w
                .send(WsMessage::Binary(frame.bytes.clone()))
                .await
                .map_err(|e| Error::Transport(e.to_string())),
            TransportWriter::Rist(w) => w.write_frame(frame).await,
        }
    }

    /// Close the transport
    pub async fn close(&mut self) {
        let result = match self {
            TransportWriter::Framed(w) => w.close().await,
            TransportWriter::Ws(w) => w.close().await.map_err(|e| Error::Transport(e.to_string())),
            TransportWriter::Rist(w) => w.close().await,
        };
        if let Err(e) = result {
            log::debug!("transport close: {e}");
        }
    }
}

/// Open a client connection to `endpoint`.
///
/// `tls` carries certificate settings for the `tls` and `wss` schemes.
pub async fn connect(
    endpoint: &Endpoint,
    tls: &tls::TlsSettings,
) -> Result<(TransportReader, TransportWriter)> {
    match endpoint.scheme {
        Scheme::Tcp => tcp::connect(endpoint).await,
        Scheme::Tls => tls::connect(endpoint, tls).await,
        Scheme::Ws | Scheme::Wss => ws::connect(endpoint, tls).await,
        Scheme::Rist => rist::connect(endpoint).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing() {
        let e: Endpoint = "tcp://music.local:1704".parse().unwrap();
        assert_eq!(e.scheme, Scheme::Tcp);
        assert_eq!(e.host, "music.local");
        assert_eq!(e.port, 1704);

        let e: Endpoint = "music.local".parse().unwrap();
        assert_eq!(e.scheme, Scheme::Tcp);
        assert_eq!(e.port, crate::config::DEFAULT_STREAM_PORT);

        let e: Endpoint = "wss://10.0.0.2:1788".parse().unwrap();
        assert_eq!(e.scheme, Scheme::Wss);

        assert!("ftp://x:1".parse::<Endpoint>().is_err());
        assert!("tcp://:1704".parse::<Endpoint>().is_err());
        assert!("tcp://h:badport".parse::<Endpoint>().is_err());
    }
}
