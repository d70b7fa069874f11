//! Time source used for cache timestamps and staleness checks.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to. Used to pin staleness boundaries.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start),
    }
  }

  pub fn set(&self, instant: DateTime<Utc>) {
    *self.lock() = instant;
  }

  pub fn advance(&self, by: Duration) {
    *self.lock() += by;
  }

  fn lock(&self) -> MutexGuard<'_, DateTime<Utc>> {
    self.now.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.lock()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_manual_clock_moves_only_when_told() {
    let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let clock = ManualClock::new(start);
    assert_eq!(clock.now(), start);

    clock.advance(Duration::minutes(10));
    assert_eq!(clock.now(), start + Duration::minutes(10));

    clock.set(start);
    assert_eq!(clock.now(), start);
  }

  #[test]
  fn test_manual_clock_survives_poisoned_lock() {
    let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let clock = std::sync::Arc::new(ManualClock::new(start));

    let poisoner = clock.clone();
    let _ = std::thread::spawn(move || {
      let _guard = poisoner.now.lock().unwrap();
      panic!("poison the clock");
    })
    .join();
    assert!(clock.now.is_poisoned());

    clock.advance(Duration::minutes(5));
    assert_eq!(clock.now(), start + Duration::minutes(5));

    clock.set(start);
    assert_eq!(clock.now(), start);
  }
}
