// Clock collaborator
// Supplies the default `at` for writes. Explicit timestamps bypass it.

use crate::temporal::truncate_to_micros;
use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

pub trait Clock: Send + Sync {
    /// Current time, never earlier than any value previously returned.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock that strictly increases.
///
/// Two calls within the same microsecond, or a system clock stepping back
/// (NTP correction), yield the last value plus one microsecond, so every
/// write stamped by one clock gets a distinct `at`.
#[derive(Debug)]
pub struct SystemClock {
    last: Mutex<DateTime<Utc>>,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            last: Mutex::new(DateTime::<Utc>::MIN_UTC),
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
        let wall = truncate_to_micros(Utc::now());
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        *last = if wall > *last {
            wall
        } else {
            *last + Duration::microseconds(1)
        };
        *last
    }
}

/// Hand-driven clock for backfills and tests.
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        ManualClock {
            current: Mutex::new(truncate_to_micros(start)),
        }
    }

    /// Jump to `time`. Moving backwards is ignored.
    pub fn set(&self, time: DateTime<Utc>) {
        let time = truncate_to_micros(time);
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if time > *current {
            *current = time;
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if by > Duration::zero() {
            *current = truncate_to_micros(*current + by);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}
