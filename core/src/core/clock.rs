//! Controllable clock for driving ban cooldowns without waiting.
//!
//! Production pools use `mockable::DefaultClock`; `MutableClock` only moves
//! when told to.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local, TimeDelta, Utc};
use mockable::Clock;

pub struct MutableClock(Mutex<DateTime<Utc>>);

impl MutableClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    /// Moves the clock forward, saturating at the largest representable time.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.lock_clock();
        *now = TimeDelta::from_std(delta)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.lock_clock() = to;
    }

    fn lock_clock(&self) -> MutexGuard<'_, DateTime<Utc>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clock for MutableClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.lock_clock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutable_clock_moves_only_on_request() {
        let start = Utc::now();
        let clock = MutableClock::new(start);
        assert_eq!(clock.utc(), start);

        clock.advance(Duration::from_secs(60));
        assert_eq!(clock.utc(), start + TimeDelta::seconds(60));

        clock.set(DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(clock.utc(), DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn test_advance_saturates() {
        let clock = MutableClock::new(Utc::now());
        clock.advance(Duration::from_secs(u64::MAX));
        assert_eq!(clock.utc(), DateTime::<Utc>::MAX_UTC);
    }
}
