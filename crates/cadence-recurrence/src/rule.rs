use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{RecurrenceError, Result};

/// Calendar unit a rule steps through, plus the unit-specific placement data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "unit", rename_all = "snake_case")]
pub enum Frequency {
    /// `anchor + k·interval` minutes. The clock is ignored.
    Minute,

    /// Once a day at the rule's clock time.
    Day,

    /// Once per listed weekday in every `interval`-th Monday-aligned week.
    Week { weekdays: Vec<Weekday> },

    /// On a fixed day (or the last day) of every `interval`-th month.
    Month { day_of_month: DayOfMonth },

    /// On a fixed 1-based month and day of every `interval`-th year.
    Year { month_of_year: u32, month_day: u32 },
}

/// Day-of-month placement for monthly rules.
///
/// Serialised as a bare number or the string `"last"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DayOfMonthRepr", into = "DayOfMonthRepr")]
pub enum DayOfMonth {
    Day(u32),
    Last,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum DayOfMonthRepr {
    Number(u32),
    Keyword(String),
}

impl TryFrom<DayOfMonthRepr> for DayOfMonth {
    type Error = String;

    fn try_from(repr: DayOfMonthRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            DayOfMonthRepr::Number(n) => Ok(DayOfMonth::Day(n)),
            DayOfMonthRepr::Keyword(k) if k.eq_ignore_ascii_case("last") => Ok(DayOfMonth::Last),
            DayOfMonthRepr::Keyword(other) => Err(format!("unknown day of month: {other}")),
        }
    }
}

impl From<DayOfMonth> for DayOfMonthRepr {
    fn from(day: DayOfMonth) -> Self {
        match day {
            DayOfMonth::Day(n) => DayOfMonthRepr::Number(n),
            DayOfMonth::Last => DayOfMonthRepr::Keyword("last".to_string()),
        }
    }
}

impl DayOfMonth {
    /// Resolve against the true length of `year`/`month`.
    ///
    /// A fixed day past the end of a short month lands on that month's last day.
    pub fn resolve(self, year: i32, month: u32) -> Option<u32> {
        let last = days_in_month(year, month)?;
        Some(match self {
            DayOfMonth::Day(day) => day.min(last),
            DayOfMonth::Last => last,
        })
    }
}

/// Wall-clock time (UTC) applied to day, week, month and year rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockTime {
    pub hour: u32,
    pub minute: u32,
}

impl ClockTime {
    pub const fn new(hour: u32, minute: u32) -> Self {
        Self { hour, minute }
    }
}

impl Default for ClockTime {
    fn default() -> Self {
        Self::new(9, 0)
    }
}

/// Declarative description of a recurring schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    #[serde(flatten)]
    pub frequency: Frequency,
    /// Step count in the frequency's unit. Must be at least 1.
    #[serde(default = "default_interval")]
    pub interval: u32,
    /// Earliest instant an occurrence may fall on.
    pub anchor: DateTime<Utc>,
    /// Inclusive latest instant an occurrence may fall on.
    #[serde(default)]
    pub boundary: Option<DateTime<Utc>>,
    /// Maximum number of occurrences ever computed, skipped ones included.
    #[serde(default)]
    pub cap: Option<u64>,
    /// Leading occurrences that are computed and counted but never emitted.
    #[serde(default)]
    pub skip: u64,
    #[serde(default)]
    pub clock: Option<ClockTime>,
}

fn default_interval() -> u32 {
    1
}

impl RecurrenceRule {
    pub fn new(frequency: Frequency, anchor: DateTime<Utc>) -> Self {
        Self {
            frequency,
            interval: 1,
            anchor,
            boundary: None,
            cap: None,
            skip: 0,
            clock: None,
        }
    }

    pub fn with_interval(mut self, interval: u32) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_boundary(mut self, boundary: DateTime<Utc>) -> Self {
        self.boundary = Some(boundary);
        self
    }

    pub fn with_cap(mut self, cap: u64) -> Self {
        self.cap = Some(cap);
        self
    }

    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_clock(mut self, hour: u32, minute: u32) -> Self {
        self.clock = Some(ClockTime::new(hour, minute));
        self
    }

    /// Clock time in effect, falling back to 09:00.
    pub fn clock_or_default(&self) -> ClockTime {
        self.clock.unwrap_or_default()
    }

    /// Check the rule for coherence. Every problem is reported as `InvalidRule`.
    pub fn validate(&self) -> Result<()> {
        if self.interval == 0 {
            return Err(invalid("interval must be at least 1"));
        }

        if let Some(clock) = self.clock {
            if clock.hour > 23 || clock.minute > 59 {
                return Err(invalid(format!(
                    "clock {:02}:{:02} is not a valid time of day",
                    clock.hour, clock.minute
                )));
            }
        }

        match &self.frequency {
            Frequency::Minute | Frequency::Day => {}
            Frequency::Week { weekdays } => {
                if weekdays.is_empty() {
                    return Err(invalid("weekly rules need at least one weekday"));
                }
            }
            Frequency::Month { day_of_month } => {
                if let DayOfMonth::Day(day) = day_of_month {
                    if !(1..=31).contains(day) {
                        return Err(invalid(format!("day of month {day} is out of range 1-31")));
                    }
                }
            }
            Frequency::Year {
                month_of_year,
                month_day,
            } => {
                if !(1..=12).contains(month_of_year) {
                    return Err(invalid(format!(
                        "month of year {month_of_year} is out of range 1-12"
                    )));
                }
                // Leap year so 29 February stays valid.
                let longest = days_in_month(2000, *month_of_year).unwrap_or(31);
                if *month_day == 0 || *month_day > longest {
                    return Err(invalid(format!(
                        "day {month_day} does not exist in month {month_of_year}"
                    )));
                }
            }
        }

        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> RecurrenceError {
    RecurrenceError::InvalidRule(reason.into())
}

/// Number of days in `month` (1-based) of `year`, leap years included.
pub fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let (next_year, next_month) = if month == 12 {
        (year.checked_add(1)?, 1)
    } else {
        (year, month + 1)
    };
    let first_of_next = NaiveDate::from_ymd_opt(next_year, next_month, 1)?;
    first_of_next.pred_opt().map(|d| d.day())
}
