// ABOUTME: WebSocket transport: one binary frame per wire message
// ABOUTME: HTTP upgrade on /stream, plain or TLS, shared stream type for client and server

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_tungstenite::{accept_async, client_async, WebSocketStream};

use crate::error::{Error, Result};
use crate::transport::{tls, AsyncRw, Endpoint, Scheme, TransportReader, TransportWriter};

/// WebSocket stream over any byte transport (TCP or TLS)
pub type WsStream = WebSocketStream<Box<dyn AsyncRw>>;

/// HTTP path for the audio stream upgrade
pub const STREAM_PATH: &str = "/stream";

/// Connect to `endpoint`, upgrading on [`STREAM_PATH`].
///
/// `wss` endpoints wrap the socket in TLS (per `settings`) before the
/// upgrade handshake.
pub async fn connect(
    endpoint: &Endpoint,
    settings: &tls::TlsSettings,
) -> Result<(TransportReader, TransportWriter)> {
    let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
    tcp.set_nodelay(true)?;

    let stream: Box<dyn AsyncRw> = match endpoint.scheme {
        Scheme::Wss => {
            let config = tls::client_config(settings)?;
            let connector = TlsConnector::from(Arc::new(config));
            let name = ServerName::try_from(endpoint.host.clone())
                .map_err(|_| Error::Config(format!("bad server name '{}'", endpoint.host)))?;
            Box::new(
                connector
                    .connect(name, tcp)
                    .await
                    .map_err(|e| Error::Transport(format!("tls handshake: {e}")))?,
            )
        }
        _ => Box::new(tcp),
    };

    let scheme = if endpoint.scheme == Scheme::Wss { "wss" } else { "ws" };
    let url = format!("{}://{}:{}{}", scheme, endpoint.host, endpoint.port, STREAM_PATH);
    let (ws, _response) = client_async(&url, stream)
        .await
        .map_err(|e| Error::Transport(format!("websocket handshake: {e}")))?;
    Ok(split(ws))
}

/// Accept the upgrade handshake on a server-side TCP stream
pub async fn accept(stream: TcpStream) -> Result<(TransportReader, TransportWriter)> {
    let _ = stream.set_nodelay(true);
    let boxed: Box<dyn AsyncRw> = Box::new(stream);
    let ws = accept_async(boxed)
        .await
        .map_err(|e| Error::Transport(format!("websocket accept: {e}")))?;
    Ok(split(ws))
}

/// Accept the upgrade handshake behind TLS (the HTTPS port)
pub async fn accept_tls(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
) -> Result<(TransportReader, TransportWriter)> {
    let _ = stream.set_nodelay(true);
    let stream = acceptor
        .accept(stream)
        .await
        .map_err(|e| Error::Transport(format!("tls accept: {e}")))?;
    let boxed: Box<dyn AsyncRw> = Box::new(stream);
    let ws = accept_async(boxed)
        .await
        .map_err(|e| Error::Transport(format!("websocket accept: {e}")))?;
    Ok(split(ws))
}

fn split(ws: WsStream) -> (TransportReader, TransportWriter) {
    let (sink, stream) = ws.split();
    (TransportReader::Ws(stream), TransportWriter::Ws(sink))
}
