//! Optional date/time-of-day window restricting when a target syncs.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// Every bound is optional. A start time later than the end time means the
/// daily window crosses midnight (22:00 - 02:00). Date bounds apply to the
/// day the daily window opened, so 01:00 on the day after `end_date` still
/// belongs to the last window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncWindow {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
}

impl SyncWindow {
    pub fn is_unbounded(&self) -> bool {
        *self == Self::default()
    }

    fn date_allowed(&self, day: NaiveDate) -> bool {
        self.start_date.map_or(true, |d| day >= d) && self.end_date.map_or(true, |d| day <= d)
    }

    fn crosses_midnight(&self) -> bool {
        matches!((self.start_time, self.end_time), (Some(s), Some(e)) if s > e)
    }

    /// Whether `now` (local wall-clock time) falls inside the window.
    pub fn contains(&self, now: NaiveDateTime) -> bool {
        let today = now.date();
        let time = now.time();

        if self.crosses_midnight() {
            let (start, end) = match (self.start_time, self.end_time) {
                (Some(s), Some(e)) => (s, e),
                _ => return false,
            };
            // tonight's window, or the one that opened yesterday evening
            let tonight = time >= start && self.date_allowed(today);
            let last_night = time <= end
                && today
                    .checked_sub_signed(Duration::days(1))
                    .is_some_and(|y| self.date_allowed(y));
            return tonight || last_night;
        }

        self.date_allowed(today)
            && self.start_time.map_or(true, |s| time >= s)
            && self.end_time.map_or(true, |e| time <= e)
    }

    pub fn contains_now(&self) -> bool {
        self.contains(chrono::Local::now().naive_local())
    }
}
