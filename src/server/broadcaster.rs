// ABOUTME: Fans encoded chunks out from a stream to its subscribed sessions
// ABOUTME: Sessions are held weakly; dead subscriptions are swept during broadcast

use std::collections::HashMap;
use std::sync::{Mutex, Weak};

use crate::audio::chunk::PcmChunk;
use crate::server::session::StreamSession;

/// Per-stream subscriber registry.
///
/// A chunk is shared by reference across subscribers: the payload is a
/// refcounted byte buffer, so fan-out clones are cheap. Each session then
/// applies its own queueing and drop policy.
#[derive(Default)]
pub struct Broadcaster {
    subscribers: Mutex<HashMap<String, Vec<Weak<StreamSession>>>>,
}

impl Broadcaster {
    /// Create an empty registry
    pub fn new() -> Self {
        Broadcaster::default()
    }

    /// Subscribe `session` to `stream_id`, replacing any other subscription
    /// it had (a client listens to exactly one stream).
    pub fn subscribe(&self, stream_id: &str, session: &std::sync::Arc<StreamSession>) {
        let mut subs = self.subscribers.lock().unwrap();
        for list in subs.values_mut() {
            list.retain(|weak| {
                weak.upgrade()
                    .map(|s| s.session_id != session.session_id)
                    .unwrap_or(false)
            });
        }
        subs.entry(stream_id.to_string())
            .or_default()
            .push(std::sync::Arc::downgrade(session));
    }

    /// Remove a session from every stream
    pub fn unsubscribe(&self, session_id: u64) {
        let mut subs = self.subscribers.lock().unwrap();
        for list in subs.values_mut() {
            list.retain(|weak| {
                weak.upgrade()
                    .map(|s| s.session_id != session_id)
                    .unwrap_or(false)
            });
        }
    }

    /// Enqueue `chunk` on every live subscriber of `stream_id`
    pub fn broadcast(&self, stream_id: &str, chunk: &PcmChunk) {
        let mut subs = self.subscribers.lock().unwrap();
        if let Some(list) = subs.get_mut(stream_id) {
            list.retain(|weak| match weak.upgrade() {
                Some(session) if !session.is_closed() => {
                    session.send_chunk(chunk.clone());
                    true
                }
                _ => false,
            });
        }
    }

    /// Number of live subscribers of `stream_id`
    pub fn subscriber_count(&self, stream_id: &str) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .get(stream_id)
            .map(|list| list.iter().filter(|w| w.upgrade().is_some()).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::clock::TimeProvider;

    #[test]
    fn subscribe_is_exclusive_per_session() {
        let b = Broadcaster::new();
        let session = StreamSession::new(1, TimeProvider::new());
        b.subscribe("radio", &session);
        b.subscribe("spotify", &session);
        assert_eq!(b.subscriber_count("radio"), 0);
        assert_eq!(b.subscriber_count("spotify"), 1);
    }

    #[test]
    fn dropped_sessions_disappear() {
        let b = Broadcaster::new();
        let session = StreamSession::new(1, TimeProvider::new());
        b.subscribe("radio", &session);
        assert_eq!(b.subscriber_count("radio"), 1);
        drop(session);
        assert_eq!(b.subscriber_count("radio"), 0);
    }
}
