// ABOUTME: One connected streaming client: outbound queue plus writer task
// ABOUTME: Stale audio is dropped from the queue so slow clients cannot grow it unboundedly

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::audio::chunk::PcmChunk;
use crate::config::MAX_REQUEST_ID;
use crate::protocol::messages::{serialize, MessagePayload, WireChunk};
use crate::sync::clock::TimeProvider;
use crate::transport::TransportWriter;

/// Grace on top of the buffer target before a queued chunk is dropped
const QUEUE_GRACE_US: i64 = 100_000;

#[derive(Debug)]
enum Outbound {
    /// Audio; subject to the age-based drop policy
    Chunk(PcmChunk),
    /// Everything else, with an optional refers_to
    Message(MessagePayload, u16),
}

/// Endpoint for one connected client.
///
/// The session exclusively owns its transport write half (via the writer
/// task) and its outbound queue; the broadcaster holds only a weak
/// reference, cleaned up on disconnect. `sent` is stamped when a message
/// actually goes out, not when it is queued.
pub struct StreamSession {
    /// Server-local session number
    pub session_id: u64,
    client_id: Mutex<String>,
    buffer_us: AtomicI64,
    next_msg_id: AtomicU16,
    queue: Mutex<VecDeque<Outbound>>,
    wakeup: Notify,
    closed: AtomicBool,
    time: TimeProvider,
}

impl StreamSession {
    /// Create a session; `time` is the server clock used for stamping and
    /// for the queue age policy.
    pub fn new(session_id: u64, time: TimeProvider) -> Arc<Self> {
        Arc::new(StreamSession {
            session_id,
            client_id: Mutex::new(String::new()),
            buffer_us: AtomicI64::new(crate::config::DEFAULT_BUFFER_MS * 1_000),
            next_msg_id: AtomicU16::new(1),
            queue: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
            closed: AtomicBool::new(false),
            time,
        })
    }

    /// The client's stable unique id, empty until the Hello arrived
    pub fn client_id(&self) -> String {
        self.client_id.lock().unwrap().clone()
    }

    /// Record the client id after the handshake
    pub fn set_client_id(&self, id: String) {
        *self.client_id.lock().unwrap() = id;
    }

    /// Track the client's end-to-end buffer so the drop policy matches it
    pub fn set_buffer_ms(&self, buffer_ms: i64) {
        self.buffer_us.store(buffer_ms * 1_000, Ordering::Release);
    }

    /// True once the session is shutting down
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop the writer task and drop whatever is still queued
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.queue.lock().unwrap().clear();
        self.wakeup.notify_one();
    }

    /// Queue an audio chunk for this client
    pub fn send_chunk(&self, chunk: PcmChunk) {
        if self.is_closed() {
            return;
        }
        let mut queue = self.queue.lock().unwrap();
        self.prune_stale(&mut queue);
        queue.push_back(Outbound::Chunk(chunk));
        drop(queue);
        self.wakeup.notify_one();
    }

    /// Queue a control message
    pub fn send_message(&self, payload: MessagePayload) {
        self.send_reply(payload, 0);
    }

    /// Queue a reply to the client message with id `refers_to`
    pub fn send_reply(&self, payload: MessagePayload, refers_to: u16) {
        if self.is_closed() {
            return;
        }
        self.queue
            .lock()
            .unwrap()
            .push_back(Outbound::Message(payload, refers_to));
        self.wakeup.notify_one();
    }

    /// Drop queued chunks the client could no longer play. The chunk
    /// currently being written is already out of the queue and unaffected.
    fn prune_stale(&self, queue: &mut VecDeque<Outbound>) {
        let deadline = self.buffer_us.load(Ordering::Acquire) + QUEUE_GRACE_US;
        let now = self.time.local_now_us();
        let before = queue.len();
        queue.retain(|item| match item {
            Outbound::Chunk(chunk) => now - chunk.start_us() <= deadline,
            Outbound::Message(..) => true,
        });
        if queue.len() != before {
            log::debug!(
                "session {}: dropped {} stale chunks",
                self.session_id,
                before - queue.len()
            );
        }
    }

    fn next_id(&self) -> u16 {
        // Wrap at the request id bound like the client side does.
        let id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
        if id >= MAX_REQUEST_ID {
            self.next_msg_id.store(1, Ordering::Relaxed);
        }
        id
    }

    /// Drain the queue onto the transport until the session closes or the
    /// transport fails. Owns the write half for the session's lifetime.
    pub async fn run_writer(self: Arc<Self>, mut writer: TransportWriter) {
        loop {
            let item = loop {
                if self.is_closed() {
                    writer.close().await;
                    return;
                }
                let popped = self.queue.lock().unwrap().pop_front();
                match popped {
                    Some(item) => break item,
                    None => self.wakeup.notified().await,
                }
            };

            let (payload, refers_to) = match item {
                Outbound::Chunk(chunk) => (
                    MessagePayload::WireChunk(WireChunk {
                        timestamp: chunk.timestamp,
                        payload: chunk.payload().clone(),
                    }),
                    0,
                ),
                Outbound::Message(payload, refers_to) => (payload, refers_to),
            };

            let frame = match serialize(&payload, self.next_id(), refers_to, self.time.now_tv()) {
                Ok(frame) => frame,
                Err(e) => {
                    log::error!("session {}: serialize failed: {e}", self.session_id);
                    continue;
                }
            };
            if let Err(e) = writer.write_frame(&frame).await {
                log::error!("session {} write error: {e}", self.session_id);
                self.close();
                writer.close().await;
                return;
            }
        }
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("session_id", &self.session_id)
            .field("client_id", &self.client_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::SampleFormat;
    use crate::protocol::messages::Tv;

    #[test]
    fn stale_chunks_are_pruned_on_enqueue() {
        let time = TimeProvider::new();
        let session = StreamSession::new(1, time.clone());
        session.set_buffer_ms(100);

        let format = SampleFormat::new(48_000, 16, 2);
        // Recorded 10 s before the session clock: way past 100 ms + grace.
        let stale = PcmChunk::silence(format, Tv::from_micros(time.local_now_us() - 10_000_000), 20);
        let fresh = PcmChunk::silence(format, Tv::from_micros(time.local_now_us()), 20);
        session.send_chunk(stale);
        session.send_chunk(fresh);

        let queue = session.queue.lock().unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn close_clears_the_queue() {
        let session = StreamSession::new(2, TimeProvider::new());
        session.send_message(MessagePayload::ServerSettings(Default::default()));
        session.close();
        assert!(session.is_closed());
        assert!(session.queue.lock().unwrap().is_empty());
        // Messages after close are refused.
        session.send_message(MessagePayload::ServerSettings(Default::default()));
        assert!(session.queue.lock().unwrap().is_empty());
    }
}
