//! Wall-clock abstraction for record timestamps.
//!
//! Production uses [`SystemClock`] (local civil time, like the log's readers expect).
//! [`ManualClock`] gives tests full control over what timestamp a record gets.

use chrono::{Duration, NaiveDateTime};
use std::sync::{Arc, Mutex};

/// Source of record timestamps.
pub trait Clock: Send + Sync + 'static {
    /// Current local civil time.
    fn now(&self) -> NaiveDateTime;
}

/// Real local time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<NaiveDateTime>>,
}

impl ManualClock {
    /// Start the clock at `start`.
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock to `at` (backwards is allowed).
    pub fn set(&self, at: NaiveDateTime) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = at;
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}
