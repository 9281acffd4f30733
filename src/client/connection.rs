// ABOUTME: Client connection: transport ownership, read loop and request/response correlation
// ABOUTME: Pending requests resolve by refers_to, expire on timeout and cancel on shutdown

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::config::MAX_REQUEST_ID;
use crate::error::{Error, Result};
use crate::protocol::messages::{serialize, BaseMessage, MessagePayload};
use crate::sync::clock::TimeProvider;
use crate::transport::tls::TlsSettings;
use crate::transport::{self, Endpoint, TransportWriter};

/// A message that is not a reply to one of our requests
pub type ServerEvent = (BaseMessage, MessagePayload);

type PendingMap = Arc<Mutex<HashMap<u16, oneshot::Sender<ServerEvent>>>>;

/// An open connection to the server.
///
/// The read loop runs as its own task: replies (non-zero `refers_to`
/// matching a pending request) resolve that request, everything else is
/// forwarded as a [`ServerEvent`]. When the transport fails the event
/// channel closes and all pending requests are cancelled.
pub struct ClientConnection {
    writer: tokio::sync::Mutex<TransportWriter>,
    pending: PendingMap,
    next_msg_id: AtomicU16,
    time: TimeProvider,
}

impl ClientConnection {
    /// Connect to `endpoint` and start the read loop.
    ///
    /// Returns the connection plus the stream of unsolicited server events.
    pub async fn connect(
        endpoint: &Endpoint,
        tls: &TlsSettings,
        time: TimeProvider,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ServerEvent>)> {
        let (reader, writer) = transport::connect(endpoint, tls).await?;
        log::info!("connected to {endpoint}");

        let connection = Arc::new(ClientConnection {
            writer: tokio::sync::Mutex::new(writer),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_msg_id: AtomicU16::new(1),
            time,
        });

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(
            reader,
            Arc::clone(&connection.pending),
            connection.time.clone(),
            event_tx,
        ));

        Ok((connection, event_rx))
    }

    fn next_id(&self) -> u16 {
        let id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
        if id >= MAX_REQUEST_ID {
            self.next_msg_id.store(1, Ordering::Relaxed);
        }
        id
    }

    /// Send a message without expecting a reply
    pub async fn send(&self, payload: &MessagePayload) -> Result<()> {
        let frame = serialize(payload, self.next_id(), 0, self.time.now_tv())?;
        self.writer.lock().await.write_frame(&frame).await
    }

    /// Send a request and await its reply.
    ///
    /// On timeout the pending entry is removed, so a reply arriving later
    /// is dropped by the read loop rather than resolving anything.
    pub async fn send_request(
        &self,
        payload: &MessagePayload,
        timeout: Duration,
    ) -> Result<ServerEvent> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let frame = serialize(payload, id, 0, self.time.now_tv())?;
        if let Err(e) = self.writer.lock().await.write_frame(&frame).await {
            self.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(Error::Timeout(timeout))
            }
        }
    }

    /// Close the transport; pending requests get cancelled by the read loop
    pub async fn close(&self) {
        self.writer.lock().await.close().await;
    }
}

async fn read_loop(
    mut reader: transport::TransportReader,
    pending: PendingMap,
    time: TimeProvider,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
) {
    loop {
        let (mut base, payload) = match reader.read_message().await {
            Ok(m) => m,
            Err(e) => {
                log::info!("connection lost: {e}");
                break;
            }
        };
        base.received = time.now_tv();

        let payload = match MessagePayload::decode(&base, payload) {
            Ok(p) => p,
            Err(e) => {
                log::error!("undecodable message: {e}");
                break;
            }
        };
        if let MessagePayload::Unknown(msg_type, _) = &payload {
            log::warn!("ignoring message with unknown type {msg_type}");
            continue;
        }
        if let MessagePayload::StreamTags(_) = &payload {
            log::debug!("ignoring legacy stream tags");
            continue;
        }

        if base.refers_to != 0 {
            let waiter = pending.lock().unwrap().remove(&base.refers_to);
            match waiter {
                Some(tx) => {
                    let _ = tx.send((base, payload));
                }
                // Timed out or never ours; per the protocol a late reply
                // is silently dropped.
                None => log::debug!("reply for unknown request {}", base.refers_to),
            }
            continue;
        }

        if event_tx.send((base, payload)).is_err() {
            break;
        }
    }

    // Cancel everything still waiting: dropping the senders makes every
    // in-flight send_request return Cancelled.
    pending.lock().unwrap().clear();
}
