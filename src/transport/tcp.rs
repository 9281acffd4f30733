// ABOUTME: Plain TCP transport: one framed message stream per connection
// ABOUTME: Used for both the client connect path and accepted server sessions

use tokio::net::TcpStream;

use crate::error::Result;
use crate::transport::{
    AsyncR, AsyncW, Endpoint, FramedReader, FramedWriter, TransportReader, TransportWriter,
};

/// Connect to `endpoint` over plain TCP
pub async fn connect(endpoint: &Endpoint) -> Result<(TransportReader, TransportWriter)> {
    let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
    stream.set_nodelay(true)?;
    Ok(wrap(stream))
}

/// Wrap an accepted TCP stream into transport halves
pub fn wrap(stream: TcpStream) -> (TransportReader, TransportWriter) {
    let _ = stream.set_nodelay(true);
    let (read, write) = stream.into_split();
    (
        TransportReader::Framed(FramedReader::new(Box::new(read) as Box<dyn AsyncR>)),
        TransportWriter::Framed(FramedWriter::new(Box::new(write) as Box<dyn AsyncW>)),
    )
}
