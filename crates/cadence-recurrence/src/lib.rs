//! `cadence-recurrence`: turns a declarative recurrence rule into a strictly
//! increasing, resumable sequence of occurrence timestamps.
//!
//! # Units
//!
//! | Unit     | Placement                                                  |
//! |----------|------------------------------------------------------------|
//! | `minute` | `anchor + k·interval` minutes, clock ignored               |
//! | `day`    | clock time every `interval` days                           |
//! | `week`   | listed weekdays of every `interval`-th Monday-aligned week |
//! | `month`  | fixed day or last day of every `interval`-th month         |
//! | `year`   | fixed month/day of every `interval`-th year                |
//!
//! All times are UTC. Occurrences stop at the inclusive `boundary` or after
//! `cap` computed occurrences, whichever comes first.

pub mod calculator;
pub mod error;
pub mod rule;

pub use calculator::{Occurrence, RecurrenceCalculator};
pub use error::{RecurrenceError, Result};
pub use rule::{days_in_month, ClockTime, DayOfMonth, Frequency, RecurrenceRule};
