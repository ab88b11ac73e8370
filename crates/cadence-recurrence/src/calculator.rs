//! Forward-only cursor over a [`RecurrenceRule`].
//!
//! The calculator is pure: it performs no I/O and reads the wall clock only in
//! [`RecurrenceCalculator::peek`]. Each instance owns its cursor exclusively
//! and cannot be rewound; rebuild it from the rule to start over.

use std::collections::VecDeque;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    error::{RecurrenceError, Result},
    rule::{ClockTime, DayOfMonth, Frequency, RecurrenceRule},
};

/// One computed run-time and its absolute 0-based ordinal in the unskipped sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    pub timestamp: DateTime<Utc>,
    pub index: u64,
}

/// Per-unit generator state. Produces raw candidates with no cap, boundary
/// or skip applied.
#[derive(Debug, Clone)]
enum Cursor {
    /// Minute and day rules: `first + step·stride`.
    Fixed {
        first: DateTime<Utc>,
        stride: Duration,
        step: i32,
    },
    /// Month and year rules: absolute month number `first_month + step·stride_months`.
    Calendar {
        first_month: i64,
        stride_months: i64,
        day: DayOfMonth,
        clock: ClockTime,
        step: i64,
    },
    /// Week rules: groups of weekday occurrences every `stride_weeks` weeks.
    Weekly {
        anchor: DateTime<Utc>,
        reference: NaiveDate,
        stride_weeks: i64,
        weekdays: Vec<Weekday>,
        clock: ClockTime,
        group: i64,
        queue: VecDeque<DateTime<Utc>>,
    },
}

impl Cursor {
    fn for_rule(rule: &RecurrenceRule) -> Option<Self> {
        let anchor = rule.anchor;
        let clock = rule.clock_or_default();
        let interval = i64::from(rule.interval);

        match &rule.frequency {
            Frequency::Minute => Some(Cursor::Fixed {
                first: anchor,
                stride: Duration::try_minutes(interval)?,
                step: 0,
            }),

            Frequency::Day => {
                let mut first = at_clock(anchor.date_naive(), clock)?;
                // Alignment step only; independent of the interval.
                if first < anchor {
                    first = first.checked_add_signed(Duration::days(1))?;
                }
                Some(Cursor::Fixed {
                    first,
                    stride: Duration::try_days(interval)?,
                    step: 0,
                })
            }

            Frequency::Week { weekdays } => {
                let mut weekdays = weekdays.clone();
                weekdays.sort_by_key(|d| d.num_days_from_monday());
                weekdays.dedup();

                let monday = monday_of(anchor.date_naive())?;
                let has_valid = weekdays.iter().any(|day| {
                    weekday_at(monday, *day, clock).is_some_and(|candidate| candidate >= anchor)
                });
                // Interval counting starts at the first week holding a valid occurrence.
                let reference = if has_valid {
                    monday
                } else {
                    monday.checked_add_signed(Duration::weeks(1))?
                };

                Some(Cursor::Weekly {
                    anchor,
                    reference,
                    stride_weeks: interval,
                    weekdays,
                    clock,
                    group: 0,
                    queue: VecDeque::new(),
                })
            }

            Frequency::Month { day_of_month } => {
                let mut first_month = month_number(anchor.year(), anchor.month());
                if resolve_month(first_month, *day_of_month, clock)? < anchor {
                    first_month += 1;
                }
                Some(Cursor::Calendar {
                    first_month,
                    stride_months: interval,
                    day: *day_of_month,
                    clock,
                    step: 0,
                })
            }

            Frequency::Year {
                month_of_year,
                month_day,
            } => {
                let day = DayOfMonth::Day(*month_day);
                let mut first_month = month_number(anchor.year(), *month_of_year);
                if resolve_month(first_month, day, clock)? < anchor {
                    first_month += 12;
                }
                Some(Cursor::Calendar {
                    first_month,
                    stride_months: interval.checked_mul(12)?,
                    day,
                    clock,
                    step: 0,
                })
            }
        }
    }

    /// Next raw candidate, or `None` once chrono's representable range is left.
    fn next_candidate(&mut self) -> Option<DateTime<Utc>> {
        match self {
            Cursor::Fixed {
                first,
                stride,
                step,
            } => {
                let offset = stride.checked_mul(*step)?;
                let candidate = first.checked_add_signed(offset)?;
                *step = step.checked_add(1)?;
                Some(candidate)
            }

            Cursor::Calendar {
                first_month,
                stride_months,
                day,
                clock,
                step,
            } => {
                let month = stride_months
                    .checked_mul(*step)
                    .and_then(|offset| first_month.checked_add(offset))?;
                let candidate = resolve_month(month, *day, *clock)?;
                *step += 1;
                Some(candidate)
            }

            Cursor::Weekly {
                anchor,
                reference,
                stride_weeks,
                weekdays,
                clock,
                group,
                queue,
            } => loop {
                if let Some(candidate) = queue.pop_front() {
                    return Some(candidate);
                }
                let weeks = stride_weeks.checked_mul(*group)?;
                let week_start = reference.checked_add_signed(Duration::try_weeks(weeks)?)?;
                for day in weekdays.iter() {
                    let candidate = weekday_at(week_start, *day, *clock)?;
                    // Only the first group can hold occurrences before the anchor.
                    if candidate >= *anchor {
                        queue.push_back(candidate);
                    }
                }
                *group += 1;
            },
        }
    }
}

/// Resumable generator of occurrences for a single rule.
#[derive(Debug, Clone)]
pub struct RecurrenceCalculator {
    rule: RecurrenceRule,
    cursor: Cursor,
    /// Index the pending (or next computed) candidate carries.
    next_index: u64,
    pending: Option<DateTime<Utc>>,
    /// Candidates at or before this instant are consumed without being emitted.
    not_after: Option<DateTime<Utc>>,
    exhausted: bool,
}

impl RecurrenceCalculator {
    /// Validate `rule` and position the cursor before its first occurrence.
    pub fn new(rule: RecurrenceRule) -> Result<Self> {
        rule.validate()?;
        let cursor = Cursor::for_rule(&rule).ok_or_else(|| {
            RecurrenceError::InvalidRule("anchor is outside the supported date range".to_string())
        })?;
        Ok(Self {
            rule,
            cursor,
            next_index: 0,
            pending: None,
            not_after: None,
            exhausted: false,
        })
    }

    /// Rebuild a calculator for a job that already ran.
    ///
    /// The first `rule.skip + successful_runs` occurrences are skipped and,
    /// when `last_completed` is known, every occurrence at or before it is
    /// suppressed too. Indices stay absolute and cap keeps counting from the
    /// rule's first occurrence, so a restart never re-emits a past run.
    pub fn resume(
        rule: RecurrenceRule,
        successful_runs: u64,
        last_completed: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        let skip = rule.skip.saturating_add(successful_runs);
        let mut calculator = Self::new(rule.with_skip(skip))?;
        calculator.not_after = last_completed;
        Ok(calculator)
    }

    pub fn rule(&self) -> &RecurrenceRule {
        &self.rule
    }

    /// Number of occurrences computed so far, skipped ones included.
    pub fn computed(&self) -> u64 {
        self.next_index
    }

    /// Whether another emittable occurrence exists, optionally only one due
    /// within `within` of the current time.
    pub fn peek(&mut self, within: Option<Duration>) -> bool {
        self.peek_at(Utc::now(), within)
    }

    /// [`peek`](Self::peek) against an explicit "now".
    pub fn peek_at(&mut self, now: DateTime<Utc>, within: Option<Duration>) -> bool {
        self.settle();
        match (self.pending, within) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(timestamp), Some(span)) => match now.checked_add_signed(span) {
                Some(horizon) => timestamp <= horizon,
                None => true,
            },
        }
    }

    /// Return and consume the next occurrence.
    ///
    /// Fails with [`RecurrenceError::Exhausted`] when none remains.
    pub fn advance(&mut self) -> Result<Occurrence> {
        self.settle();
        let timestamp = self.pending.take().ok_or(RecurrenceError::Exhausted)?;
        let occurrence = Occurrence {
            timestamp,
            index: self.next_index,
        };
        self.next_index += 1;
        Ok(occurrence)
    }

    /// Compute candidates until one is emittable or the rule is exhausted.
    fn settle(&mut self) {
        while !self.exhausted {
            let candidate = match self.pending {
                Some(candidate) => candidate,
                None => {
                    if self.rule.cap.is_some_and(|cap| self.next_index >= cap) {
                        self.exhausted = true;
                        break;
                    }
                    match self.cursor.next_candidate() {
                        Some(candidate)
                            if self.rule.boundary.map_or(true, |end| candidate <= end) =>
                        {
                            self.pending = Some(candidate);
                            candidate
                        }
                        _ => {
                            self.exhausted = true;
                            break;
                        }
                    }
                }
            };

            let suppressed = self.next_index < self.rule.skip
                || self.not_after.is_some_and(|cutoff| candidate <= cutoff);
            if !suppressed {
                break;
            }
            trace!(index = self.next_index, %candidate, "occurrence suppressed");
            self.pending = None;
            self.next_index += 1;
        }
    }
}

impl Iterator for RecurrenceCalculator {
    type Item = Occurrence;

    fn next(&mut self) -> Option<Occurrence> {
        if self.peek_at(Utc::now(), None) {
            self.advance().ok()
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Calendar helpers
// ---------------------------------------------------------------------------

fn at_clock(date: NaiveDate, clock: ClockTime) -> Option<DateTime<Utc>> {
    date.and_hms_opt(clock.hour, clock.minute, 0)
        .map(|naive| naive.and_utc())
}

fn monday_of(date: NaiveDate) -> Option<NaiveDate> {
    let back = i64::from(date.weekday().num_days_from_monday());
    date.checked_sub_signed(Duration::days(back))
}

fn weekday_at(monday: NaiveDate, day: Weekday, clock: ClockTime) -> Option<DateTime<Utc>> {
    let offset = i64::from(day.num_days_from_monday());
    at_clock(monday.checked_add_signed(Duration::days(offset))?, clock)
}

/// Months since year 0, with January = 0.
fn month_number(year: i32, month: u32) -> i64 {
    i64::from(year) * 12 + i64::from(month) - 1
}

fn resolve_month(month_number: i64, day: DayOfMonth, clock: ClockTime) -> Option<DateTime<Utc>> {
    let year = i32::try_from(month_number.div_euclid(12)).ok()?;
    let month = u32::try_from(month_number.rem_euclid(12)).ok()? + 1;
    let day = day.resolve(year, month)?;
    at_clock(NaiveDate::from_ymd_opt(year, month, day)?, clock)
}
