//! Lightweight cron expression matcher.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds)
//! Field forms: *, */N, N, a-b, a-b/N and comma lists of those.
//! Day-of-week accepts 0-7 where both 0 and 7 mean Sunday.
//!
//! All five fields must match at once; day-of-month and day-of-week are
//! ANDed rather than ORed as in classic cron.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveTime, TimeZone, Timelike};
use std::str::FromStr;

use pulse_core::error::{PulseError, Result};

/// How far ahead (in days) to look for a match. Covers Feb 29 paired with a weekday.
const SEARCH_HORIZON_DAYS: i64 = 366 * 28;

/// A parsed 5-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days: Vec<u32>,
    months: Vec<u32>,
    weekdays: Vec<u32>,
}

const FIELDS: [(&str, u32, u32); 5] = [
    ("minute", 0, 59),
    ("hour", 0, 23),
    ("day", 1, 31),
    ("month", 1, 12),
    ("day of week", 0, 7),
];

impl CronExpr {
    /// Strict parse. Any malformed or out-of-range field is an error.
    pub fn parse(minute: &str, hour: &str, day: &str, month: &str, day_of_week: &str) -> Result<Self> {
        let raw = [minute, hour, day, month, day_of_week];
        let mut sets: Vec<Vec<u32>> = Vec::with_capacity(5);
        for (field, (name, min, max)) in raw.iter().zip(FIELDS) {
            let values = parse_field(field, min, max).ok_or_else(|| {
                PulseError::validation(format!("Invalid cron {name} field: '{field}'"))
            })?;
            sets.push(values);
        }
        Ok(Self::from_sets(sets))
    }

    /// Lenient parse used at run time: a malformed field matches everything.
    pub fn lenient(minute: &str, hour: &str, day: &str, month: &str, day_of_week: &str) -> Self {
        let raw = [minute, hour, day, month, day_of_week];
        let sets = raw
            .iter()
            .zip(FIELDS)
            .map(|(field, (name, min, max))| {
                parse_field(field, min, max).unwrap_or_else(|| {
                    tracing::warn!("Invalid cron {name} field '{field}', treating as '*'");
                    (min..=max).collect()
                })
            })
            .collect();
        Self::from_sets(sets)
    }

    fn from_sets(mut sets: Vec<Vec<u32>>) -> Self {
        let mut weekdays: Vec<u32> = sets.pop().unwrap_or_default();
        for d in weekdays.iter_mut() {
            if *d == 7 {
                *d = 0;
            }
        }
        weekdays.sort_unstable();
        weekdays.dedup();
        let months = sets.pop().unwrap_or_default();
        let days = sets.pop().unwrap_or_default();
        let hours = sets.pop().unwrap_or_default();
        let minutes = sets.pop().unwrap_or_default();
        Self { minutes, hours, days, months, weekdays }
    }

    /// Earliest matching minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        let tz = after.timezone();
        let start = after.naive_local().with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let mut date = start.date();
        let first_time = start.time();

        for day_index in 0..SEARCH_HORIZON_DAYS {
            if self.matches_date(date) {
                let floor = if day_index == 0 { first_time } else { NaiveTime::MIN };
                if let Some(time) = self.first_time_from(floor) {
                    let local = date.and_time(time);
                    if let Some(found) = tz.from_local_datetime(&local).single() {
                        return Some(found);
                    }
                }
            }
            date = date.succ_opt()?;
        }

        None
    }

    fn matches_date(&self, date: chrono::NaiveDate) -> bool {
        self.months.contains(&date.month())
            && self.days.contains(&date.day())
            && self.weekdays.contains(&date.weekday().num_days_from_sunday())
    }

    fn first_time_from(&self, floor: NaiveTime) -> Option<NaiveTime> {
        for &h in self.hours.iter().filter(|h| **h >= floor.hour()) {
            for &m in &self.minutes {
                if h == floor.hour() && m < floor.minute() {
                    continue;
                }
                return NaiveTime::from_hms_opt(h, m, 0);
            }
        }
        None
    }
}

impl FromStr for CronExpr {
    type Err = PulseError;

    fn from_str(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(PulseError::validation(format!(
                "Invalid cron expression: '{expression}' (need 5 fields: MIN HOUR DOM MON DOW)"
            )));
        }
        Self::parse(parts[0], parts[1], parts[2], parts[3], parts[4])
    }
}

/// Parse a cron field into a sorted list of matching values.
fn parse_field(field: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    let field = field.trim();
    if field.is_empty() {
        return None;
    }

    let mut values = Vec::new();
    for part in field.split(',') {
        values.extend(parse_part(part.trim(), min, max)?);
    }
    values.sort_unstable();
    values.dedup();
    Some(values)
}

fn parse_part(part: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    let (range, step) = match part.split_once('/') {
        Some((range, step)) => {
            let n: u32 = step.parse().ok()?;
            if n == 0 {
                return None;
            }
            (range, n)
        }
        None => (part, 1),
    };

    let (lo, hi) = if range == "*" {
        (min, max)
    } else if let Some((a, b)) = range.split_once('-') {
        (a.parse().ok()?, b.parse().ok()?)
    } else {
        let n: u32 = range.parse().ok()?;
        // "N/step" runs from N to the end of the field.
        if step > 1 { (n, max) } else { (n, n) }
    };

    if lo < min || hi > max || lo > hi {
        return None;
    }
    Some((lo..=hi).step_by(step as usize).collect())
}
