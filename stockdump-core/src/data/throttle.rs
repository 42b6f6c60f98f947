//! Global request throttle.
//!
//! Enforces a minimum interval between request starts across all workers.
//! Callers block until their slot arrives; the throttle never rejects.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RequestThrottle {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    /// A throttle that never waits.
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Reserve the next request slot and sleep until it arrives.
    ///
    /// Returns how long the caller waited.
    pub fn acquire(&self) -> Duration {
        let wait = self.reserve(Instant::now());
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
        wait
    }

    /// Reserve a slot relative to `now` and return the delay until it starts.
    fn reserve(&self, now: Instant) -> Duration {
        if self.min_interval.is_zero() {
            return Duration::ZERO;
        }
        let mut next = self.next_slot.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = match *next {
            Some(at) if at > now => at,
            _ => now,
        };
        *next = Some(slot + self.min_interval);
        slot - now
    }
}

impl Default for RequestThrottle {
    fn default() -> Self {
        Self::unlimited()
    }
}
