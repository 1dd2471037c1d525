//! Exchange-local wall clock.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Source of "now" in the exchange timezone.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Tz>;

    /// Calendar date in the exchange timezone.
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// System clock projected into the exchange timezone.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeClock {
    tz: Tz,
}

impl ExchangeClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }
}

impl Clock for ExchangeClock {
    fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.tz)
    }
}

/// Today's occurrence of `at`, or `None` if it has already passed.
///
/// Ambiguous or skipped local times (DST) resolve to the earliest valid
/// instant; Asia/Seoul has no DST so this only matters for other zones.
pub fn pending_buy_time(now: DateTime<Tz>, at: NaiveTime) -> Option<DateTime<Tz>> {
    let target = now
        .timezone()
        .from_local_datetime(&now.date_naive().and_time(at))
        .earliest()?;
    (now < target).then_some(target)
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Manually driven clock.
    pub struct FixedClock {
        now: Mutex<DateTime<Tz>>,
    }

    impl FixedClock {
        pub fn new(now: DateTime<Tz>) -> Self {
            Self {
                now: Mutex::new(now),
            }
        }

        pub fn seoul(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> Self {
            let now = chrono_tz::Asia::Seoul
                .with_ymd_and_hms(y, m, d, h, min, s)
                .single()
                .expect("valid Seoul time");
            Self::new(now)
        }

        pub fn set(&self, now: DateTime<Tz>) {
            *self.now.lock().unwrap() = now;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Tz> {
            *self.now.lock().unwrap()
        }
    }
}
