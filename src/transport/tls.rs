// ABOUTME: TLS transport: the TCP framing wrapped in rustls
// ABOUTME: Server cert/key loading, optional CA for client certificate verification

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::split;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{Error, Result};
use crate::transport::{
    AsyncR, AsyncW, Endpoint, FramedReader, FramedWriter, TransportReader, TransportWriter,
};

/// Certificate material for TLS transports.
///
/// Clients set `ca` to trust a self-signed server certificate and may present
/// `cert`/`key` when the server verifies client certificates. Servers require
/// `cert` and `key`; setting `ca` there turns on client-cert verification.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    /// PEM certificate (chain) file
    pub cert: Option<PathBuf>,
    /// PEM private key file
    pub key: Option<PathBuf>,
    /// Password for an encrypted private key
    pub key_password: Option<String>,
    /// PEM CA file used to verify the peer
    pub ca: Option<PathBuf>,
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let data = std::fs::read(path)
        .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
    let certs: std::result::Result<Vec<_>, _> = rustls_pemfile::certs(&mut data.as_slice()).collect();
    let certs = certs.map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path, password: Option<&str>) -> Result<PrivateKeyDer<'static>> {
    let data = std::fs::read(path)
        .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
    if data.windows(9).any(|w| w == b"ENCRYPTED") {
        // rustls only consumes plaintext keys; a password cannot help here.
        let _ = password;
        return Err(Error::Config(format!(
            "{} is an encrypted key; decrypt it first (e.g. openssl pkey)",
            path.display()
        )));
    }
    rustls_pemfile::private_key(&mut data.as_slice())
        .map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))?
        .ok_or_else(|| Error::Config(format!("no private key found in {}", path.display())))
}

fn root_store(ca: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca)? {
        roots
            .add(cert)
            .map_err(|e| Error::Config(format!("bad CA certificate: {e}")))?;
    }
    Ok(roots)
}

/// Build a rustls client config from `settings`
pub fn client_config(settings: &TlsSettings) -> Result<ClientConfig> {
    let ca = settings
        .ca
        .as_deref()
        .ok_or_else(|| Error::Config("tls client needs a CA file to verify the server".into()))?;
    let roots = root_store(ca)?;
    let builder = ClientConfig::builder().with_root_certificates(roots);
    let config = match (&settings.cert, &settings.key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(
                load_certs(cert)?,
                load_key(key, settings.key_password.as_deref())?,
            )
            .map_err(|e| Error::Config(format!("client cert: {e}")))?,
        _ => builder.with_no_client_auth(),
    };
    Ok(config)
}

/// Build a rustls server config from `settings`
pub fn server_config(settings: &TlsSettings) -> Result<ServerConfig> {
    let cert = settings
        .cert
        .as_deref()
        .ok_or_else(|| Error::Config("tls server needs a certificate file".into()))?;
    let key = settings
        .key
        .as_deref()
        .ok_or_else(|| Error::Config("tls server needs a key file".into()))?;
    let certs = load_certs(cert)?;
    let key = load_key(key, settings.key_password.as_deref())?;

    let builder = match &settings.ca {
        Some(ca) => {
            let verifier = WebPkiClientVerifier::builder(Arc::new(root_store(ca)?))
                .build()
                .map_err(|e| Error::Config(format!("client verifier: {e}")))?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        }
        None => ServerConfig::builder().with_no_client_auth(),
    };
    builder
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("server cert: {e}")))
}

/// Connect to `endpoint` and run the TLS handshake
pub async fn connect(
    endpoint: &Endpoint,
    settings: &TlsSettings,
) -> Result<(TransportReader, TransportWriter)> {
    let config = client_config(settings)?;
    let connector = TlsConnector::from(Arc::new(config));
    let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
    tcp.set_nodelay(true)?;
    let name = ServerName::try_from(endpoint.host.clone())
        .map_err(|_| Error::Config(format!("bad server name '{}'", endpoint.host)))?;
    let stream = connector
        .connect(name, tcp)
        .await
        .map_err(|e| Error::Transport(format!("tls handshake: {e}")))?;
    let (read, write) = split(stream);
    Ok((
        TransportReader::Framed(FramedReader::new(Box::new(read) as Box<dyn AsyncR>)),
        TransportWriter::Framed(FramedWriter::new(Box::new(write) as Box<dyn AsyncW>)),
    ))
}

/// Run the server-side handshake on an accepted TCP stream
pub async fn accept(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
) -> Result<(TransportReader, TransportWriter)> {
    let _ = stream.set_nodelay(true);
    let stream = acceptor
        .accept(stream)
        .await
        .map_err(|e| Error::Transport(format!("tls accept: {e}")))?;
    let (read, write) = split(stream);
    Ok((
        TransportReader::Framed(FramedReader::new(Box::new(read) as Box<dyn AsyncR>)),
        TransportWriter::Framed(FramedWriter::new(Box::new(write) as Box<dyn AsyncW>)),
    ))
}
