// ABOUTME: End-to-end client/server tests over loopback TCP
// ABOUTME: Handshake, chunk delivery, request timeout, cancellation on disconnect

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;

use snapstream::audio::chunk::PcmChunk;
use snapstream::audio::decode::{Decoder, PcmDecoder};
use snapstream::audio::format::SampleFormat;
use snapstream::client::connection::ClientConnection;
use snapstream::error::Error;
use snapstream::protocol::messages::{Hello, MessagePayload, TimeMsg, Tv};
use snapstream::server::{Server, ServerOptions, DEFAULT_STREAM_ID};
use snapstream::sync::clock::TimeProvider;
use snapstream::transport::tls::TlsSettings;
use snapstream::transport::Endpoint;

fn test_hello() -> Hello {
    Hello {
        mac: "00:11:22:33:44:55".into(),
        hostname: "test-host".into(),
        version: "0.1.0".into(),
        client_name: "Snapstream".into(),
        os: "linux".into(),
        arch: "x86_64".into(),
        instance: 1,
        id: "00:11:22:33:44:55".into(),
        username: None,
        password: None,
        protocol_version: 2,
    }
}

async fn start_server(options: ServerOptions) -> (Server, Endpoint) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Server::new(options).unwrap();
    let run = server.clone();
    tokio::spawn(async move {
        let _ = run.run_tcp_listener(listener).await;
    });
    let endpoint: Endpoint = format!("tcp://127.0.0.1:{port}").parse().unwrap();
    (server, endpoint)
}

async fn connect(
    endpoint: &Endpoint,
) -> (
    Arc<ClientConnection>,
    tokio::sync::mpsc::UnboundedReceiver<(snapstream::protocol::BaseMessage, MessagePayload)>,
) {
    ClientConnection::connect(endpoint, &TlsSettings::default(), TimeProvider::new())
        .await
        .unwrap()
}

// =============================================================================
// Handshake
// =============================================================================

#[tokio::test]
async fn test_clean_handshake_yields_settings_and_codec_header() {
    let mut options = ServerOptions::default();
    options.tcp_bind = None;
    let (_server, endpoint) = start_server(options).await;
    let (conn, mut events) = connect(&endpoint).await;

    let (base, reply) = conn
        .send_request(
            &MessagePayload::Hello(test_hello()),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    assert_ne!(base.refers_to, 0, "reply must reference the hello");
    let settings = match reply {
        MessagePayload::ServerSettings(s) => s,
        other => panic!("expected server settings, got {other:?}"),
    };
    assert_eq!(settings.buffer_ms, 1000);
    assert_eq!(settings.volume, 100);
    assert!(!settings.muted);

    // Codec header arrives next and initializes a pcm decoder to the
    // server's default format.
    let (_, payload) = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    let header = match payload {
        MessagePayload::CodecHeader(h) => h,
        other => panic!("expected codec header, got {other:?}"),
    };
    assert_eq!(header.codec, "pcm");
    assert_eq!(header.payload.len(), 44);

    let mut decoder = PcmDecoder::new();
    let format = decoder.set_header(&header).unwrap();
    assert_eq!(format, SampleFormat::new(48_000, 16, 2));
}

#[tokio::test]
async fn test_bad_credentials_close_the_session() {
    let mut options = ServerOptions::default();
    options.tcp_bind = None;
    options.username = Some("listener".into());
    options.password = Some("secret".into());
    let (_server, endpoint) = start_server(options).await;
    let (conn, _events) = connect(&endpoint).await;

    let result = conn
        .send_request(
            &MessagePayload::Hello(test_hello()),
            Duration::from_secs(2),
        )
        .await;
    // The server drops the connection without answering: the pending
    // request is cancelled (or times out if the close races the timer).
    assert!(matches!(result, Err(Error::Cancelled) | Err(Error::Timeout(_))));
}

// =============================================================================
// Time sync and chunk flow
// =============================================================================

#[tokio::test]
async fn test_time_request_is_echoed_with_latency() {
    let mut options = ServerOptions::default();
    options.tcp_bind = None;
    let (_server, endpoint) = start_server(options).await;
    let (conn, _events) = connect(&endpoint).await;

    let (base, reply) = conn
        .send_request(
            &MessagePayload::Time(TimeMsg::default()),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    match reply {
        MessagePayload::Time(t) => {
            // Loopback: the cross-clock latency is bounded by the clock
            // domains, but the reply must carry the server's stamps.
            assert_ne!(base.sent, Tv::default());
            let _ = t.latency;
        }
        other => panic!("expected time reply, got {other:?}"),
    }
}

#[tokio::test]
async fn test_fed_chunks_reach_subscribed_clients() {
    let mut options = ServerOptions::default();
    options.tcp_bind = None;
    let (server, endpoint) = start_server(options).await;
    let (conn, mut events) = connect(&endpoint).await;

    conn.send_request(
        &MessagePayload::Hello(test_hello()),
        Duration::from_secs(2),
    )
    .await
    .unwrap();
    // Skip the codec header.
    let _ = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap();

    let format = SampleFormat::new(48_000, 16, 2);
    let payload: Vec<u8> = (0..960u32 * 4).map(|i| (i % 251) as u8).collect();
    let chunk = PcmChunk::new(format, Tv::default(), Bytes::from(payload.clone())).unwrap();
    server.feed(DEFAULT_STREAM_ID, &chunk).unwrap();

    let (_, received) = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    match received {
        MessagePayload::WireChunk(wire) => {
            // PCM passthrough: payload is bit for bit what went in, and the
            // server stamped a recording time.
            assert_eq!(&wire.payload[..], &payload[..]);
            assert_ne!(wire.timestamp, Tv::default());
        }
        other => panic!("expected wire chunk, got {other:?}"),
    }
}

// =============================================================================
// Pending requests
// =============================================================================

/// A server that accepts and reads but never answers
async fn start_mute_server() -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut sink = vec![0u8; 4096];
                loop {
                    use tokio::io::AsyncReadExt;
                    if socket.read(&mut sink).await.unwrap_or(0) == 0 {
                        return;
                    }
                }
            });
        }
    });
    format!("tcp://127.0.0.1:{port}").parse().unwrap()
}

#[tokio::test]
async fn test_request_times_out_when_unanswered() {
    let endpoint = start_mute_server().await;
    let (conn, _events) = connect(&endpoint).await;

    let timeout = Duration::from_millis(100);
    let started = std::time::Instant::now();
    let result = conn
        .send_request(&MessagePayload::Time(TimeMsg::default()), timeout)
        .await;
    assert!(matches!(result, Err(Error::Timeout(_))));
    assert!(started.elapsed() < Duration::from_secs(1));

    // The connection survives a timeout: a later request still goes out.
    let again = conn
        .send_request(&MessagePayload::Time(TimeMsg::default()), timeout)
        .await;
    assert!(matches!(again, Err(Error::Timeout(_))));
}

#[tokio::test]
async fn test_reply_after_timeout_is_ignored() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        // Read one request, sit past the client's timeout, then answer it.
        let mut header = [0u8; 26];
        socket.read_exact(&mut header).await.unwrap();
        let base = snapstream::protocol::BaseMessage::read(&header).unwrap();
        let mut payload = vec![0u8; base.size as usize];
        socket.read_exact(&mut payload).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let frame = snapstream::protocol::messages::serialize(
            &MessagePayload::Time(TimeMsg::default()),
            1,
            base.id,
            Tv::default(),
        )
        .unwrap();
        let _ = socket.write_all(&frame.bytes).await;
        // Keep the socket open so the read loop stays alive.
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let endpoint: Endpoint = format!("tcp://127.0.0.1:{port}").parse().unwrap();
    let (conn, mut events) = connect(&endpoint).await;

    let result = conn
        .send_request(
            &MessagePayload::Time(TimeMsg::default()),
            Duration::from_millis(100),
        )
        .await;
    assert!(matches!(result, Err(Error::Timeout(_))));

    // The late reply must be swallowed, not surfaced as an event.
    let spurious = tokio::time::timeout(Duration::from_millis(500), events.recv()).await;
    assert!(spurious.is_err(), "late reply leaked as event");
}

#[tokio::test]
async fn test_disconnect_cancels_pending_requests() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        // Accept, linger briefly, then slam the door.
        let Ok((socket, _)) = listener.accept().await else {
            return;
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(socket);
    });

    let endpoint: Endpoint = format!("tcp://127.0.0.1:{port}").parse().unwrap();
    let (conn, mut events) = connect(&endpoint).await;

    let result = conn
        .send_request(
            &MessagePayload::Time(TimeMsg::default()),
            Duration::from_secs(10),
        )
        .await;
    assert!(
        matches!(result, Err(Error::Cancelled)),
        "expected cancellation, got {result:?}"
    );
    // And the event stream reports the close.
    assert!(events.recv().await.is_none());
}
