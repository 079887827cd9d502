use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Time source for cycle logic and auth stamps.
///
/// Everything that reads the clock goes through this trait so cycles replay
/// deterministically in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Strictly increasing millisecond stamp. Two calls never return the
    /// same value within a process, even inside the same millisecond.
    fn monotonic_millis(&self) -> i64;
}

/// Wall-clock implementation backed by `Utc::now()`.
pub struct SystemClock {
    last_stamp: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            last_stamp: AtomicI64::new(0),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_millis(&self) -> i64 {
        let wall = Utc::now().timestamp_millis();
        // Bump past the last issued stamp if the wall clock has not advanced.
        let prev = self
            .last_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(wall.max(last + 1))
            })
            .unwrap_or(0);
        wall.max(prev + 1)
    }
}

/// Fixed clock for tests; advances only when told to.
pub struct FixedClock {
    now_ms: AtomicI64,
    stamp: AtomicI64,
}

impl FixedClock {
    pub fn at(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now_ms: AtomicI64::new(now.timestamp_millis()),
            stamp: AtomicI64::new(0),
        })
    }

    pub fn advance_millis(&self, delta: i64) {
        self.now_ms.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set(&self, now: DateTime<Utc>) {
        self.now_ms.store(now.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.now_ms.load(Ordering::SeqCst))
            .expect("fixed clock millis in range")
    }

    fn monotonic_millis(&self) -> i64 {
        let wall = self.now_ms.load(Ordering::SeqCst);
        let prev = self
            .stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(wall.max(last + 1))
            })
            .unwrap_or(0);
        wall.max(prev + 1)
    }
}
