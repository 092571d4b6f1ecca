//! Recurrence calculator: the next due timestamp for a schedule.
//!
//! Pure computation over a decoded [`RecurrenceSpec`], performed in the
//! server's fixed UTC offset. Nothing in here touches storage.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use pulse_core::error::{PulseError, Result};

use crate::cron::CronExpr;

const DAY_SECS: i64 = 86_400;

/// Interval kind as persisted in schedule rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalType {
    Once,
    Daily,
    Weekly,
    Monthly,
    Yearly,
    Custom,
}

impl IntervalType {
    pub fn code(self) -> i64 {
        match self {
            Self::Once => 1,
            Self::Daily => 2,
            Self::Weekly => 3,
            Self::Monthly => 4,
            Self::Yearly => 5,
            Self::Custom => 6,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            1 => Self::Once,
            2 => Self::Daily,
            3 => Self::Weekly,
            4 => Self::Monthly,
            5 => Self::Yearly,
            6 => Self::Custom,
            _ => return None,
        })
    }

    pub fn is_recurring(self) -> bool {
        self != Self::Once
    }
}

/// 24-hour "HH:MM" time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(PulseError::validation(format!("Invalid time of day {hour}:{minute}")));
        }
        Ok(Self { hour, minute })
    }

    fn naive(self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or(NaiveTime::MIN)
    }
}

impl FromStr for TimeOfDay {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| PulseError::validation(format!("Invalid time '{s}', expected HH:MM")))?;
        let hour = h.parse().map_err(|_| PulseError::validation(format!("Invalid hour in '{s}'")))?;
        let minute = m.parse().map_err(|_| PulseError::validation(format!("Invalid minute in '{s}'")))?;
        Self::new(hour, minute)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = PulseError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl From<Weekday> for chrono::Weekday {
    fn from(w: Weekday) -> Self {
        match w {
            Weekday::Monday => chrono::Weekday::Mon,
            Weekday::Tuesday => chrono::Weekday::Tue,
            Weekday::Wednesday => chrono::Weekday::Wed,
            Weekday::Thursday => chrono::Weekday::Thu,
            Weekday::Friday => chrono::Weekday::Fri,
            Weekday::Saturday => chrono::Weekday::Sat,
            Weekday::Sunday => chrono::Weekday::Sun,
        }
    }
}

fn default_yearly_interval() -> u32 { 1 }
fn wildcard() -> String { "*".into() }

/// Decoded interval configuration. Each variant carries only its own fields.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "interval", rename_all = "snake_case")]
pub enum RecurrenceSpec {
    #[default]
    Once,
    Daily {
        #[serde(default)]
        time: TimeOfDay,
    },
    Weekly {
        weekday: Weekday,
        #[serde(default)]
        time: TimeOfDay,
    },
    Monthly {
        /// 1-31; 31 means "last day of the month".
        month_date: u32,
        #[serde(default)]
        time: TimeOfDay,
    },
    Yearly {
        month: u32,
        month_date: u32,
        #[serde(default = "default_yearly_interval")]
        yearly_interval: u32,
        #[serde(default)]
        time: TimeOfDay,
    },
    Custom {
        #[serde(default = "wildcard")]
        minute: String,
        #[serde(default = "wildcard")]
        hour: String,
        #[serde(default = "wildcard")]
        day: String,
        #[serde(default = "wildcard")]
        month: String,
        #[serde(default = "wildcard")]
        day_of_week: String,
    },
}

impl RecurrenceSpec {
    pub fn interval_type(&self) -> IntervalType {
        match self {
            Self::Once => IntervalType::Once,
            Self::Daily { .. } => IntervalType::Daily,
            Self::Weekly { .. } => IntervalType::Weekly,
            Self::Monthly { .. } => IntervalType::Monthly,
            Self::Yearly { .. } => IntervalType::Yearly,
            Self::Custom { .. } => IntervalType::Custom,
        }
    }

    /// Reject values the calculator would otherwise have to guess about.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Monthly { month_date, .. } if !(1..=31).contains(month_date) => Err(
                PulseError::validation(format!("month_date must be 1-31, got {month_date}")),
            ),
            Self::Yearly { month, month_date, yearly_interval, .. } => {
                if !(1..=12).contains(month) {
                    return Err(PulseError::validation(format!("month must be 1-12, got {month}")));
                }
                if !(1..=31).contains(month_date) {
                    return Err(PulseError::validation(format!("month_date must be 1-31, got {month_date}")));
                }
                if *yearly_interval < 1 {
                    return Err(PulseError::validation("yearly_interval must be at least 1"));
                }
                Ok(())
            }
            Self::Custom { minute, hour, day, month, day_of_week } => {
                CronExpr::parse(minute, hour, day, month, day_of_week).map(|_| ())
            }
            _ => Ok(()),
        }
    }
}

/// Shift applied after the interval is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", content = "secs", rename_all = "snake_case")]
pub enum Delay {
    #[default]
    None,
    /// Fire this many seconds earlier.
    Before(i64),
    /// Fire this many seconds later.
    After(i64),
}

impl Delay {
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Before(s) | Self::After(s) if *s < 0 => {
                Err(PulseError::validation(format!("delay must not be negative, got {s}")))
            }
            _ => Ok(()),
        }
    }
}

/// Where the first occurrence is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseDateMode {
    #[default]
    Now,
    /// The user's enrolment start in the course.
    Relative,
    /// A configured timestamp.
    Fixed(i64),
}

impl BaseDateMode {
    pub fn resolve(self, enrolment_time: Option<i64>, now: i64) -> i64 {
        match self {
            Self::Now => now,
            Self::Relative => enrolment_time.filter(|t| *t > 0).unwrap_or(now),
            Self::Fixed(ts) => ts,
        }
    }
}

/// Inputs for one calculation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunContext {
    pub base_time: i64,
    pub now: i64,
    pub last_run: Option<i64>,
    /// Caller-forced time (e.g. a due date trigger).
    pub expected_run_time: Option<i64>,
    /// Event time supplied by a delay-capable condition.
    pub delay_anchor: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
pub struct RecurrenceCalculator {
    tz: FixedOffset,
}

impl Default for RecurrenceCalculator {
    fn default() -> Self {
        Self::utc()
    }
}

impl RecurrenceCalculator {
    pub fn new(tz: FixedOffset) -> Self {
        Self { tz }
    }

    pub fn utc() -> Self {
        Self { tz: chrono::Utc.fix() }
    }

    pub fn timezone(&self) -> FixedOffset {
        self.tz
    }

    /// Next due timestamp for `spec`, with `delay` applied last.
    pub fn next_run(&self, spec: &RecurrenceSpec, delay: Delay, ctx: &RunContext) -> i64 {
        let computed = self.interval_time(spec, ctx);
        self.apply_delay(computed, delay, ctx)
    }

    fn interval_time(&self, spec: &RecurrenceSpec, ctx: &RunContext) -> i64 {
        let seed = ctx.expected_run_time.or(ctx.last_run).unwrap_or(ctx.base_time);
        let local = self.local(seed);

        match spec {
            RecurrenceSpec::Once => ctx.expected_run_time.unwrap_or(ctx.base_time.max(ctx.now)),
            RecurrenceSpec::Daily { time } => {
                let date = local.date_naive() + Duration::days(1);
                self.at(date, *time)
            }
            RecurrenceSpec::Weekly { weekday, time } => {
                let current = local.weekday().num_days_from_monday() as i64;
                let target = chrono::Weekday::from(*weekday).num_days_from_monday() as i64;
                let mut ahead = (target - current).rem_euclid(7);
                if ahead == 0 {
                    ahead = 7;
                }
                self.at(local.date_naive() + Duration::days(ahead), *time)
            }
            RecurrenceSpec::Monthly { month_date, time } => {
                let first = first_of_next_month(local.date_naive());
                let date = if *month_date >= 31 {
                    last_day_of_month(first)
                } else {
                    first + Duration::days(i64::from(month_date.saturating_sub(1)))
                };
                self.at(date, *time)
            }
            RecurrenceSpec::Yearly { month, month_date, yearly_interval, time } => {
                let year = local.year() + (*yearly_interval).max(1) as i32;
                let month = (*month).clamp(1, 12);
                let date = NaiveDate::from_ymd_opt(year, month, *month_date)
                    .unwrap_or_else(|| clamp_to_month(year, month, *month_date));
                self.at(date, *time)
            }
            RecurrenceSpec::Custom { minute, hour, day, month, day_of_week } => {
                let from = ctx.expected_run_time.or(ctx.last_run).unwrap_or(ctx.now);
                let cron = CronExpr::lenient(minute, hour, day, month, day_of_week);
                match cron.next_after(self.local(from)) {
                    Some(next) => next.timestamp(),
                    None => {
                        tracing::warn!("Cron expression never matches, falling back to one day later");
                        from + DAY_SECS
                    }
                }
            }
        }
    }

    fn apply_delay(&self, computed: i64, delay: Delay, ctx: &RunContext) -> i64 {
        // Anchors only drive the first occurrence; chained runs follow the interval.
        let anchor = if ctx.expected_run_time.is_none() && ctx.last_run.is_none() {
            ctx.delay_anchor
        } else {
            None
        };
        match delay {
            Delay::None => computed,
            Delay::After(secs) => anchor.unwrap_or(computed) + secs,
            Delay::Before(secs) => match (ctx.expected_run_time, anchor) {
                (Some(expected), _) => expected - secs,
                (None, Some(anchor)) => anchor - secs,
                (None, None) => computed - secs,
            },
        }
    }

    fn local(&self, ts: i64) -> DateTime<FixedOffset> {
        self.tz
            .timestamp_opt(ts, 0)
            .single()
            .unwrap_or_else(|| self.tz.from_utc_datetime(&NaiveDateTime::default()))
    }

    fn at(&self, date: NaiveDate, time: TimeOfDay) -> i64 {
        let local = date.and_time(time.naive());
        match self.tz.from_local_datetime(&local).single() {
            Some(dt) => dt.timestamp(),
            None => local.and_utc().timestamp() - i64::from(self.tz.local_minus_utc()),
        }
    }
}

fn first_of_next_month(date: NaiveDate) -> NaiveDate {
    let (y, m) = if date.month() == 12 { (date.year() + 1, 1) } else { (date.year(), date.month() + 1) };
    NaiveDate::from_ymd_opt(y, m, 1).unwrap_or(date)
}

fn last_day_of_month(first: NaiveDate) -> NaiveDate {
    first_of_next_month(first).pred_opt().unwrap_or(first)
}

fn clamp_to_month(year: i32, month: u32, day: u32) -> NaiveDate {
    let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MIN);
    let last = last_day_of_month(first);
    if day > last.day() { last } else { first }
}
