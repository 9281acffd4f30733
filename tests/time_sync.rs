// ABOUTME: Clock synchronization convergence and robustness tests
// ABOUTME: Injected exchanges with known offsets must converge despite noise

use snapstream::protocol::messages::Tv;
use snapstream::sync::clock::TimeProvider;

/// Simulate one exchange with a true clock offset and asymmetric one-way
/// delays. `up`/`down` are in microseconds.
fn exchange(time: &TimeProvider, offset_us: i64, up_us: i64, down_us: i64) {
    // c2s = server receive - client send = up + offset (cross-clock)
    // s2c = client receive - server send = down - offset
    let t3 = 900_000_000i64; // arbitrary server clock
    let t4 = t3 + down_us - offset_us;
    time.update(
        Tv::from_micros(up_us + offset_us),
        Tv::from_micros(t3),
        Tv::from_micros(t4),
    );
}

#[test]
fn test_converges_to_true_offset_with_noise() {
    let time = TimeProvider::new();
    let offset = 123_456i64;

    // Deterministic +-500 us jitter on each direction.
    let mut noise = 17i64;
    for _ in 0..50 {
        noise = (noise * 31 + 7) % 1_000; // 0..999
        let up = 1_000 + (noise - 500);
        noise = (noise * 31 + 7) % 1_000;
        let down = 1_000 + (noise - 500);
        exchange(&time, offset, up, down);
    }

    assert!(time.is_synced());
    let err = (time.offset_us() - offset).abs();
    assert!(err < 200, "offset error {err} us");
}

#[test]
fn test_negative_offsets_work_the_same() {
    let time = TimeProvider::new();
    for _ in 0..30 {
        exchange(&time, -42_000, 800, 1_200);
    }
    let err = (time.offset_us() + 42_000).abs();
    assert!(err < 300, "offset error {err} us");
}

#[test]
fn test_single_outlier_is_rejected_by_the_median() {
    let time = TimeProvider::new();
    for _ in 0..20 {
        exchange(&time, 10_000, 1_000, 1_000);
    }
    // One exchange where the reply was stalled 400 ms on the way back.
    exchange(&time, 10_000, 1_000, 400_000 - 1_000);
    let err = (time.offset_us() - 10_000).abs();
    assert!(err < 100, "offset error {err} us after outlier");
}

#[test]
fn test_server_now_tracks_local_clock_plus_offset() {
    let time = TimeProvider::new();
    for _ in 0..10 {
        exchange(&time, 500_000, 100, 100);
    }
    let delta = time.server_now_us() - time.local_now_us();
    assert!((delta - 500_000).abs() < 1_000, "delta {delta}");
}

#[test]
fn test_reset_forgets_the_estimate() {
    let time = TimeProvider::new();
    exchange(&time, 10_000, 100, 100);
    assert!(time.is_synced());
    time.reset();
    assert!(!time.is_synced());
    assert_eq!(time.offset_us(), 0);
}
