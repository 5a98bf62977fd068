//! Injected time source. Everything that reads the wall clock goes
//! through [`Clock`] so duration and recovery math is deterministic in
//! tests.

use std::sync::Arc;

use time::OffsetDateTime;

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

pub type SharedClock = Arc<dyn Clock>;

/// Production clock: UTC wall time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

// ---------------------------------------------------------------------------
// Test clock
// ---------------------------------------------------------------------------

/// A clock that only moves when told to.
#[cfg(test)]
pub struct ManualClock(std::sync::Mutex<OffsetDateTime>);

#[cfg(test)]
impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self(std::sync::Mutex::new(start))
    }

    pub fn advance(&self, by: time::Duration) {
        let mut now = self.0.lock().unwrap();
        *now += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.0.lock().unwrap()
    }
}
