//! Clock sources for leases, retention and row timestamps
//!
//! Lease expiry is evaluated against a [`Clock`] owned by the coordination
//! ensemble, so tests can drive failover deterministically with a
//! [`ManualClock`] while binaries run on the monotonic [`SystemClock`].

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Time source shared by the ensemble and the storage nodes
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Nanoseconds since the Unix epoch; never goes backward
    fn now_nanos(&self) -> i64;

    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> i64 {
        self.now_nanos() / 1_000_000
    }

    /// Maximum tolerated skew between this clock and the writers' clocks
    fn max_skew(&self) -> Duration {
        Duration::ZERO
    }

    /// Retention cutoff shifted earlier by the skew margin so rows stamped by
    /// a clock running ahead are not expired prematurely.
    fn retention_cutoff_nanos(&self, retention: Duration) -> i64 {
        self.now_nanos() - retention.as_nanos() as i64 - self.max_skew().as_nanos() as i64
    }
}

/// Wall clock whose readings strictly increase, even across a backward
/// step of the system time
#[derive(Debug)]
pub struct SystemClock {
    last_ns: AtomicI64,
    max_skew: Duration,
}

impl SystemClock {
    pub fn new(max_skew: Duration) -> Self {
        Self {
            last_ns: AtomicI64::new(0),
            max_skew,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.now_nanos())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl Clock for SystemClock {
    fn now_nanos(&self) -> i64 {
        let wall = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        let next = |last: i64| wall.max(last + 1);
        match self
            .last_ns
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| Some(next(last)))
        {
            Ok(last) | Err(last) => next(last),
        }
    }

    fn max_skew(&self) -> Duration {
        self.max_skew
    }
}

/// Manually advanced clock for deterministic lease and retention tests
#[derive(Debug)]
pub struct ManualClock {
    now_ns: AtomicI64,
}

impl ManualClock {
    /// Start at the given millisecond timestamp
    pub fn starting_at_ms(ms: i64) -> Self {
        Self {
            now_ns: AtomicI64::new(ms * 1_000_000),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ns
            .fetch_add(by.as_nanos() as i64, Ordering::AcqRel);
    }

    pub fn set_ms(&self, ms: i64) {
        self.now_ns.store(ms * 1_000_000, Ordering::Release);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        // 2024-01-01T00:00:00Z
        Self::starting_at_ms(1_704_067_200_000)
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> i64 {
        self.now_ns.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_system_clock_readings_are_unique_across_threads() {
        let clock = Arc::new(SystemClock::default());
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let clock = Arc::clone(&clock);
                std::thread::spawn(move || {
                    let readings: Vec<i64> = (0..500).map(|_| clock.now_nanos()).collect();
                    assert!(readings.windows(2).all(|w| w[0] < w[1]));
                    readings
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for reader in readers {
            for ts in reader.join().unwrap() {
                assert!(seen.insert(ts), "duplicate reading {ts}");
            }
        }
    }

    #[test]
    fn test_retention_cutoff_leaves_room_for_skew() {
        let clock = SystemClock::new(Duration::from_secs(60));
        let cutoff = clock.retention_cutoff_nanos(Duration::from_secs(3_600));
        let gap = clock.now_nanos() - cutoff;
        assert!(gap >= Duration::from_secs(3_660).as_nanos() as i64);

        let manual = ManualClock::starting_at_ms(10_000);
        assert_eq!(
            manual.retention_cutoff_nanos(Duration::from_secs(4)),
            6_000 * 1_000_000
        );
    }

    #[test]
    fn test_manual_clock_moves_only_when_told() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_at_ms(1_000));
        assert_eq!(clock.now_ms(), 1_000);
        assert_eq!(clock.now_ms(), 1_000);

        let manual = ManualClock::default();
        manual.advance(Duration::from_millis(250));
        assert_eq!(manual.now_ms(), 1_704_067_200_250);
        manual.set_ms(5_000);
        assert_eq!(manual.now_ms(), 5_000);
    }
}
