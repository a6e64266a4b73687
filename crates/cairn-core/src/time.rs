//! Monotonic timestamps.
//!
//! Every engine call takes the current timestamp and expiry values are
//! absolute, so the whole endpoint shares one steady clock: nanoseconds
//! since an arbitrary process-local epoch. Wall-clock time is never used.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Monotonic nanoseconds since the process epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp(epoch().elapsed().as_nanos() as u64)
    }

    pub const fn from_nanos(nanos: u64) -> Self {
        Timestamp(nanos)
    }

    pub const fn nanos(self) -> u64 {
        self.0
    }

    pub fn saturating_add(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_add(duration.as_nanos() as u64))
    }

    /// Duration until `self`, measured from `earlier`. Zero if already past.
    pub fn saturating_since(self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }

    /// The `Instant` this timestamp corresponds to, for interop with
    /// deadline-based waits.
    pub fn as_instant(self) -> Instant {
        epoch() + Duration::from_nanos(self.0)
    }
}

impl std::ops::Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        self.saturating_add(rhs)
    }
}
