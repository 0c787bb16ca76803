/// Wall-clock source.
///
/// Log files carry local, zone-less timestamps, so every instant in the
/// engine is a `NaiveDateTime` in local time. Elapsed time is always derived
/// from `now()` rather than counted timer ticks, which keeps timeouts correct
/// across process sleep/resume.

use std::sync::Mutex;

use chrono::{Duration, Local, NaiveDateTime};

pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// The real local clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Hand-driven clock for deterministic tests.
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, instant: NaiveDateTime) {
        *self.now.lock().unwrap() = instant;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap()
    }
}

/// Seconds from `from` to `to` as a float; negative if `to` is earlier.
pub fn seconds_between(from: NaiveDateTime, to: NaiveDateTime) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn base() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(base());
        clock.advance(Duration::seconds(90));
        assert_eq!(clock.now(), base() + Duration::seconds(90));
    }

    #[test]
    fn seconds_between_is_signed() {
        let later = base() + Duration::milliseconds(2500);
        assert_eq!(seconds_between(base(), later), 2.5);
        assert_eq!(seconds_between(later, base()), -2.5);
    }
}
