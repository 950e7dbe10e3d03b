//! Per-channel statistics: atomic packet counters plus the round-trip timings the
//!  retransmit scheduler feeds on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Weight of the history in the smoothed trip time: `middle = (9*middle + sample) / 10`.
const TRIP_TIME_SMOOTHING: u32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sent: u64,
    pub received: u64,
    pub retransmits: u64,
    /// Duplicate DATA packets dropped on the receive side.
    pub drops: u64,
    pub acks_received: u64,
    /// ACKs for ids no longer in the send queue.
    pub duplicate_acks: u64,
    /// Most recent round-trip sample.
    pub trip_time: Duration,
    /// Smoothed round-trip time; this is what retransmit scheduling uses.
    pub trip_time_middle: Duration,
}

struct Timing {
    trip_time: Duration,
    trip_time_middle: Duration,
    last_activity: Instant,
    last_send: Instant,
    last_delay_check: Instant,
}

pub struct ChannelStats {
    started: Instant,
    sent: AtomicU64,
    received: AtomicU64,
    retransmits: AtomicU64,
    drops: AtomicU64,
    acks_received: AtomicU64,
    duplicate_acks: AtomicU64,
    timing: Mutex<Timing>,
}

impl ChannelStats {
    pub(crate) fn new() -> ChannelStats {
        let now = Instant::now();
        ChannelStats {
            started: now,
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            retransmits: AtomicU64::new(0),
            drops: AtomicU64::new(0),
            acks_received: AtomicU64::new(0),
            duplicate_acks: AtomicU64::new(0),
            timing: Mutex::new(Timing {
                trip_time: Duration::ZERO,
                trip_time_middle: Duration::ZERO,
                last_activity: now,
                last_send: now,
                last_delay_check: now,
            }),
        }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub(crate) fn record_send(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recv(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retransmit(&self) {
        self.retransmits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_drop(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ack(&self) {
        self.acks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate_ack(&self) {
        self.duplicate_acks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Folds a fresh round-trip sample into the timings. The first sample initializes
    ///  the smoothed value directly.
    pub(crate) fn record_trip_time(&self, sample: Duration) -> Duration {
        let mut timing = self.timing.lock().unwrap();
        timing.trip_time = sample;
        timing.trip_time_middle = if timing.trip_time_middle.is_zero() {
            sample
        } else {
            (timing.trip_time_middle * TRIP_TIME_SMOOTHING + sample) / (TRIP_TIME_SMOOTHING + 1)
        };
        timing.trip_time_middle
    }

    pub fn trip_time(&self) -> Duration {
        self.timing.lock().unwrap().trip_time
    }

    pub fn trip_time_middle(&self) -> Duration {
        self.timing.lock().unwrap().trip_time_middle
    }

    pub(crate) fn touch_activity(&self) {
        self.timing.lock().unwrap().last_activity = Instant::now();
    }

    pub(crate) fn last_activity_elapsed(&self) -> Duration {
        self.timing.lock().unwrap().last_activity.elapsed()
    }

    pub(crate) fn touch_send(&self) {
        self.timing.lock().unwrap().last_send = Instant::now();
    }

    pub(crate) fn last_send_elapsed(&self) -> Duration {
        self.timing.lock().unwrap().last_send.elapsed()
    }

    /// Returns true - and re-arms the window - when the pacing delay is due for
    ///  re-evaluation.
    pub(crate) fn delay_check_due(&self, interval: Duration) -> bool {
        let mut timing = self.timing.lock().unwrap();
        if timing.last_delay_check.elapsed() > interval {
            timing.last_delay_check = Instant::now();
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let timing = self.timing.lock().unwrap();
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            retransmits: self.retransmits.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
            duplicate_acks: self.duplicate_acks.load(Ordering::Relaxed),
            trip_time: timing.trip_time,
            trip_time_middle: timing.trip_time_middle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_trip_time_sample_initializes_middle() {
        let stats = ChannelStats::new();
        let middle = stats.record_trip_time(Duration::from_millis(100));
        assert_eq!(middle, Duration::from_millis(100));
        assert_eq!(stats.trip_time(), Duration::from_millis(100));
    }

    #[test]
    fn test_trip_time_smoothing() {
        let stats = ChannelStats::new();
        stats.record_trip_time(Duration::from_millis(100));
        let middle = stats.record_trip_time(Duration::from_millis(200));

        // (9*100 + 200) / 10
        assert_eq!(middle, Duration::from_millis(110));
        assert_eq!(stats.trip_time(), Duration::from_millis(200));
        assert_eq!(stats.trip_time_middle(), Duration::from_millis(110));
    }

    #[test]
    fn test_counters() {
        let stats = ChannelStats::new();
        stats.record_send();
        stats.record_send();
        stats.record_recv();
        stats.record_drop();
        stats.record_ack();
        stats.record_duplicate_ack();
        stats.record_retransmit();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sent, 2);
        assert_eq!(snapshot.received, 1);
        assert_eq!(snapshot.drops, 1);
        assert_eq!(snapshot.acks_received, 1);
        assert_eq!(snapshot.duplicate_acks, 1);
        assert_eq!(snapshot.retransmits, 1);
    }

    #[test]
    fn test_delay_check_window() {
        let stats = ChannelStats::new();
        std::thread::sleep(Duration::from_millis(2));
        assert!(stats.delay_check_due(Duration::from_millis(1)));
        assert!(!stats.delay_check_due(Duration::from_millis(1)));
    }
}
