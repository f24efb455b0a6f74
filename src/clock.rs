use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Source of wall-clock time for the scheduler.
///
/// Production code uses [`SystemClock`]. Tests substitute a clock that follows
/// tokio's paused time so timers and wall time advance together.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Current time in the school's zone
pub fn now_in(clock: &dyn Clock, tz: Tz) -> DateTime<Tz> {
    clock.now_utc().with_timezone(&tz)
}

/// Resolve a wall-clock time on `date` in `tz`.
///
/// Daylight-saving transitions are handled explicitly:
/// - a time that occurs twice (fall back) resolves to its first occurrence
/// - a time that does not exist (spring forward) moves forward to the first
///   valid instant after the gap, whatever its position inside the gap
pub fn local_time_on(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Tz>> {
    let naive = date.and_time(time);
    if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
        return Some(dt);
    }

    // Transitions fall on whole minutes
    let minute = naive.with_second(0).and_then(|n| n.with_nanosecond(0))?;
    (1..=MAX_GAP_MINUTES).find_map(|step| {
        tz.from_local_datetime(&(minute + Duration::minutes(step)))
            .earliest()
    })
}

const MAX_GAP_MINUTES: i64 = 24 * 60;

/// The first instant of the day after `now`, in `now`'s zone
pub fn next_local_midnight(now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    let tomorrow = now.date_naive().succ_opt()?;
    local_time_on(now.timezone(), tomorrow, NaiveTime::MIN)
}
