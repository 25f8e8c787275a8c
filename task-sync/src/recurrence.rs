//! Taskwarrior recurrence periods
//!
//! Parses `recur` values such as `weekly`, `3days` or `2mo` into the
//! interval fields the local `recurring` table stores, and computes the
//! concrete due date of a generated instance from its `imask` offset.

use crate::error::{SyncError, SyncResult};
use crate::store::{FromRow, HasLocalId, LocalId, Row};
use chrono::{DateTime, Datelike, Duration, Months, Utc, Weekday};

/// Bit per weekday, Monday is bit 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeekdayMask(u8);

impl WeekdayMask {
    pub const WORKDAYS: WeekdayMask = WeekdayMask(0b0001_1111);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecurrenceInterval {
    pub minutes: i64,
    pub hours: i64,
    pub days: i64,
    pub months: u32,
    pub years: u32,
    pub weekdays: WeekdayMask,
}

impl RecurrenceInterval {
    /// Parse a Taskwarrior period. Periods without a local representation
    /// (seconds, ISO durations, unknown words) fail with
    /// `UnsupportedRecurrence`.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::UnsupportedRecurrence` for unrepresentable periods.
    pub fn parse(text: &str) -> SyncResult<Self> {
        let text = text.trim().to_ascii_lowercase();
        let unsupported = || SyncError::UnsupportedRecurrence(text.clone());

        let named = match text.as_str() {
            "hourly" => Some(Self::hours(1)),
            "daily" | "day" => Some(Self::days(1)),
            "weekly" | "week" | "sennight" => Some(Self::days(7)),
            "biweekly" | "fortnight" => Some(Self::days(14)),
            "monthly" | "month" => Some(Self::months(1)),
            "bimonthly" => Some(Self::months(2)),
            "quarterly" | "quarter" => Some(Self::months(3)),
            "semiannual" => Some(Self::months(6)),
            "annual" | "yearly" | "year" => Some(Self::years(1)),
            "biannual" | "biyearly" => Some(Self::years(2)),
            "weekdays" => Some(Self {
                weekdays: WeekdayMask::WORKDAYS,
                ..Self::default()
            }),
            _ => None,
        };
        if let Some(interval) = named {
            return Ok(interval);
        }

        let split = text
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(unsupported)?;
        let (count, unit) = text.split_at(split);
        let count: u32 = if count.is_empty() {
            1
        } else {
            count.parse().map_err(|_| unsupported())?
        };
        if count == 0 {
            return Err(unsupported());
        }
        let n = i64::from(count);

        match unit.trim() {
            "min" | "mins" | "minute" | "minutes" => Ok(Self::minutes(n)),
            "h" | "hr" | "hrs" | "hour" | "hours" => Ok(Self::hours(n)),
            "d" | "day" | "days" => Ok(Self::days(n)),
            "w" | "wk" | "wks" | "week" | "weeks" => Ok(Self::days(n * 7)),
            "mo" | "mos" | "mth" | "mths" | "month" | "months" => Ok(Self::months(count)),
            "q" | "qtr" | "qtrs" | "quarter" | "quarters" => {
                Ok(Self::months(count.checked_mul(3).ok_or_else(unsupported)?))
            }
            "y" | "yr" | "yrs" | "year" | "years" => Ok(Self::years(count)),
            _ => Err(unsupported()),
        }
    }

    fn minutes(minutes: i64) -> Self {
        Self { minutes, ..Self::default() }
    }

    fn hours(hours: i64) -> Self {
        Self { hours, ..Self::default() }
    }

    fn days(days: i64) -> Self {
        Self { days, ..Self::default() }
    }

    fn months(months: u32) -> Self {
        Self { months, ..Self::default() }
    }

    fn years(years: u32) -> Self {
        Self { years, ..Self::default() }
    }

    /// Due date of the `offset`-th instance generated from `start`.
    pub fn apply_offset(&self, start: DateTime<Utc>, offset: u32) -> Option<DateTime<Utc>> {
        if !self.weekdays.is_empty() {
            let mut current = start;
            let mut remaining = offset;
            while remaining > 0 {
                current = current.checked_add_signed(Duration::days(1))?;
                if self.weekdays.contains(current.weekday()) {
                    remaining -= 1;
                }
            }
            return Some(current);
        }

        let months = self
            .years
            .checked_mul(12)?
            .checked_add(self.months)?
            .checked_mul(offset)?;
        let span = Duration::minutes(self.minutes)
            .checked_add(&Duration::hours(self.hours))?
            .checked_add(&Duration::days(self.days))?
            .checked_mul(i32::try_from(offset).ok()?)?;

        start
            .checked_add_months(Months::new(months))?
            .checked_add_signed(span)
    }

    /// Values for a row in the local `recurring` table.
    pub fn to_row(&self, label: &str, start: Option<i64>, end: Option<i64>) -> Row {
        Row::new()
            .with("label", label)
            .with("minutes", self.minutes)
            .with("hours", self.hours)
            .with("days", self.days)
            .with("months", i64::from(self.months))
            .with("years", i64::from(self.years))
            .with("weekdays", i64::from(self.weekdays.bits()))
            .with("for_due", 1)
            .with("start_date", start)
            .with("end_date", end)
    }
}

/// Row of the local `recurring` table
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecurrence {
    pub id: LocalId,
    pub label: String,
    pub interval: RecurrenceInterval,
    pub start_date: Option<i64>,
    pub end_date: Option<i64>,
}

impl FromRow for StoredRecurrence {
    fn from_row(row: &Row) -> SyncResult<Self> {
        let unsigned = |column: &str| -> SyncResult<u32> {
            Ok(u32::try_from(row.opt_i64(column)?.unwrap_or(0)).unwrap_or(0))
        };
        let weekdays = u8::try_from(row.opt_i64("weekdays")?.unwrap_or(0)).unwrap_or(0);

        Ok(Self {
            id: row.i64("id")?,
            label: row.opt_string("label")?.unwrap_or_default(),
            interval: RecurrenceInterval {
                minutes: row.opt_i64("minutes")?.unwrap_or(0),
                hours: row.opt_i64("hours")?.unwrap_or(0),
                days: row.opt_i64("days")?.unwrap_or(0),
                months: unsigned("months")?,
                years: unsigned("years")?,
                weekdays: WeekdayMask(weekdays),
            },
            start_date: row.opt_i64("start_date")?,
            end_date: row.opt_i64("end_date")?,
        })
    }
}

impl HasLocalId for StoredRecurrence {
    fn local_id(&self) -> LocalId {
        self.id
    }
}
