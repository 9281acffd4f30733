// ABOUTME: Clock synchronization between client and server monotonic clocks
// ABOUTME: Maintains a median-filtered offset so server timestamps map into local time

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::protocol::messages::Tv;
use crate::stream::stats::RollingBuffer;

/// Number of offset samples kept for the median filter
const OFFSET_WINDOW: usize = 100;

/// Samples with a round trip above this are discarded (network congestion)
const MAX_RTT_US: i64 = 500_000;

/// Shared estimate of `offset = server_clock - local_clock` in microseconds.
///
/// One exchange: the client sends a Time request stamped `sent = t1`; the
/// server replies with `latency = t2 - t1` (its receive stamp minus the
/// client stamp, a cross-clock difference) and its own `sent = t3`; the
/// client stamps `received = t4`. Then
///
///   offset = ((t2 - t1) + (t3 - t4)) / 2
///
/// Each estimate lands in a rolling window; the exported offset is the
/// window median, which rejects single-sample outliers. Readers (the audio
/// callback among them) load one atomic and never take the window lock.
#[derive(Debug, Clone)]
pub struct TimeProvider {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    epoch: Instant,
    offset_us: AtomicI64,
    synced: AtomicBool,
    window: Mutex<RollingBuffer>,
}

impl TimeProvider {
    /// Create a provider with no offset (server time == local time)
    pub fn new() -> Self {
        TimeProvider {
            inner: Arc::new(Inner {
                epoch: Instant::now(),
                offset_us: AtomicI64::new(0),
                synced: AtomicBool::new(false),
                window: Mutex::new(RollingBuffer::new(OFFSET_WINDOW)),
            }),
        }
    }

    /// Local monotonic clock in microseconds since the provider was created
    pub fn local_now_us(&self) -> i64 {
        self.inner.epoch.elapsed().as_micros() as i64
    }

    /// Local monotonic clock as a wire timestamp
    pub fn now_tv(&self) -> Tv {
        Tv::from_micros(self.local_now_us())
    }

    /// Current estimate of the server's monotonic clock, in microseconds
    pub fn server_now_us(&self) -> i64 {
        self.local_now_us() + self.offset_us()
    }

    /// Current signed offset estimate in microseconds
    pub fn offset_us(&self) -> i64 {
        self.inner.offset_us.load(Ordering::Acquire)
    }

    /// True once at least one exchange has been folded in
    pub fn is_synced(&self) -> bool {
        self.inner.synced.load(Ordering::Acquire)
    }

    /// Fold in one completed exchange.
    ///
    /// `latency_c2s` is the server-filled latency (t2 - t1); `t3` is the
    /// server's transmit stamp, `t4` the local receive stamp.
    pub fn update(&self, latency_c2s: Tv, t3: Tv, t4: Tv) {
        let c2s = latency_c2s.to_micros();
        let s2c = t4.diff_micros(t3);
        let rtt = c2s + s2c;
        if rtt > MAX_RTT_US {
            log::debug!("discarding time sample, rtt {} us", rtt);
            return;
        }

        let estimate = (c2s - s2c) / 2;
        let median = {
            let mut window = self.inner.window.lock().unwrap();
            window.add(estimate);
            window.median()
        };
        self.inner.offset_us.store(median, Ordering::Release);
        self.inner.synced.store(true, Ordering::Release);
    }

    /// Reset the estimate, e.g. after reconnecting to a different server
    pub fn reset(&self) {
        self.inner.window.lock().unwrap().clear();
        self.inner.offset_us.store(0, Ordering::Release);
        self.inner.synced.store(false, Ordering::Release);
    }
}

impl Default for TimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_converges_to_injected_value() {
        let time = TimeProvider::new();
        // True offset 123_456 us, symmetric 1 ms one-way delay.
        for _ in 0..50 {
            let t1 = time.local_now_us();
            let t2 = t1 + 1_000 + 123_456;
            let t3 = t2 + 10;
            let t4 = t1 + 2_010;
            time.update(
                Tv::from_micros(t2 - t1),
                Tv::from_micros(t3),
                Tv::from_micros(t4),
            );
        }
        assert!(time.is_synced());
        assert!((time.offset_us() - 123_456).abs() < 100);
    }

    #[test]
    fn high_rtt_samples_are_discarded() {
        let time = TimeProvider::new();
        time.update(
            Tv::from_micros(400_000),
            Tv::from_micros(0),
            Tv::from_micros(400_000),
        );
        assert!(!time.is_synced());
        assert_eq!(time.offset_us(), 0);
    }
}
