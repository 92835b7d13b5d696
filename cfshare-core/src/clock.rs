use std::sync::Mutex;

use chrono::DateTime;
use chrono::Duration;
use chrono::FixedOffset;
use chrono::Local;

/// Injectable source of "now": collaborators (subprocess launcher, HTTP
/// round-tripper, clock) are threaded through explicitly rather than
/// reached for as a process-wide singleton.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}

/// Deterministic clock for tests: starts at construction time and only
/// advances when explicitly told to, so TTL/reaper tests don't need to
/// sleep on the wall clock.
pub struct FakeClock {
    now: Mutex<DateTime<FixedOffset>>,
}

impl FakeClock {
    pub fn new(start: DateTime<FixedOffset>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = match self.now.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard += by;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<FixedOffset> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
