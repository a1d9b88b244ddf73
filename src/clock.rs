use chrono::{DateTime, Duration, Local, TimeZone};
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};

/// Source of wall-clock time for quota windows.
///
/// Quota windows close at local midnight, so the clock hands out local
/// timestamps rather than monotonic instants.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Clock whose time only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<DateTime<Local>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Local>) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut t = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        *t += by;
    }

    pub fn set(&self, to: DateTime<Local>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// First local midnight strictly after `now`.
///
/// When midnight does not exist locally (a DST gap at 00:00) the earliest valid
/// instant of the next day is used instead.
pub fn next_local_midnight(now: DateTime<Local>) -> DateTime<Local> {
    let tomorrow = now.date_naive() + Duration::days(1);
    let midnight = tomorrow.and_hms_opt(0, 0, 0).unwrap_or_default();
    match Local.from_local_datetime(&midnight).earliest() {
        Some(t) => t,
        None => (0..24)
            .filter_map(|h| {
                tomorrow
                    .and_hms_opt(h, 0, 0)
                    .and_then(|dt| Local.from_local_datetime(&dt).earliest())
            })
            .next()
            .unwrap_or_else(|| now + Duration::days(1)),
    }
}
