//! Five-field cron expressions.

use crate::errors::CronError;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Years searched ahead before an expression is declared unsatisfiable.
const SEARCH_YEARS: i32 = 5;

/// A parsed `minute hour day-of-month month day-of-week` expression, in UTC.
///
/// Fields accept `*`, single values, `a-b` ranges, `/step` and
/// comma-separated lists. Months and weekdays also accept three-letter
/// names, and weekday `7` is Sunday. When both day fields are restricted a
/// day matches if either does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CronExpression {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[] };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[] };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[] };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12, names: &MONTH_NAMES };
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 7, names: &DAY_NAMES };

impl FieldSpec {
    fn error(&self, value: &str, reason: impl Into<String>) -> CronError {
        CronError::InvalidField {
            field: self.name,
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    fn value(&self, raw: &str) -> Result<u32, CronError> {
        let lower = raw.to_ascii_lowercase();
        let value = match self.names.iter().position(|name| *name == lower) {
            // Month names start at 1, weekday names at 0.
            Some(index) => u32::try_from(index).map_err(|_| self.error(raw, "bad name"))? + self.min,
            None => raw
                .parse::<u32>()
                .map_err(|_| self.error(raw, "not a number"))?,
        };
        if value < self.min || value > self.max {
            return Err(self.error(raw, format!("must be between {} and {}", self.min, self.max)));
        }
        Ok(value)
    }

    fn parse(&self, field: &str) -> Result<u64, CronError> {
        let mut mask = 0u64;
        for item in field.split(',') {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => {
                    let step = step
                        .parse::<u32>()
                        .ok()
                        .filter(|s| *s > 0)
                        .ok_or_else(|| self.error(item, "step must be a positive number"))?;
                    (range, Some(step))
                }
                None => (item, None),
            };

            let (start, end) = if range == "*" {
                (self.min, self.max)
            } else if let Some((a, b)) = range.split_once('-') {
                let (a, b) = (self.value(a)?, self.value(b)?);
                if a > b {
                    return Err(self.error(item, "range start is after its end"));
                }
                (a, b)
            } else {
                let value = self.value(range)?;
                // `a/step` runs from `a` to the end of the field.
                (value, if step.is_some() { self.max } else { value })
            };

            let step = step.unwrap_or(1);
            let mut value = Some(start);
            while let Some(current) = value.filter(|v| *v <= end) {
                mask |= 1 << current;
                value = current.checked_add(step);
            }
        }
        if mask == 0 {
            return Err(self.error(field, "matches nothing"));
        }
        Ok(mask)
    }
}

fn expand_alias(alias: &str) -> Result<&'static str, CronError> {
    match alias {
        "@yearly" | "@annually" => Ok("0 0 1 1 *"),
        "@monthly" => Ok("0 0 1 * *"),
        "@weekly" => Ok("0 0 * * 0"),
        "@daily" | "@midnight" => Ok("0 0 * * *"),
        "@hourly" => Ok("0 * * * *"),
        other => Err(CronError::UnknownAlias(other.to_string())),
    }
}

const fn has(mask: u64, value: u32) -> bool {
    mask & (1 << value) != 0
}

impl CronExpression {
    /// Parses an expression or an `@` alias.
    ///
    /// # Errors
    ///
    /// Returns `CronError` describing the first problem found.
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let trimmed = expression.trim();
        let body = if trimmed.starts_with('@') {
            expand_alias(trimmed)?
        } else {
            trimmed
        };

        let fields: Vec<&str> = body.split_whitespace().collect();
        let &[minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(CronError::FieldCount {
                expression: expression.to_string(),
                found: fields.len(),
            });
        };

        let mut days_of_week = DAY_OF_WEEK.parse(dow)?;
        if has(days_of_week, 7) {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: trimmed.to_string(),
            minutes: MINUTE.parse(minute)?,
            hours: HOUR.parse(hour)?,
            days_of_month: DAY_OF_MONTH.parse(dom)?,
            months: MONTH.parse(month)?,
            days_of_week,
            dom_restricted: !dom.starts_with('*'),
            dow_restricted: !dow.starts_with('*'),
        })
    }

    /// The expression as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = has(self.days_of_month, date.day());
        let dow = has(self.days_of_week, date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// Returns true if the expression fires at this minute.
    #[must_use]
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        has(self.months, at.month())
            && self.day_matches(at.date_naive())
            && has(self.hours, at.hour())
            && has(self.minutes, at.minute())
    }

    /// The first fire time strictly after `after`, at minute resolution.
    ///
    /// Returns `None` if nothing matches within the next few years, as with
    /// `0 0 30 2 *`.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let limit = after.year() + SEARCH_YEARS;
        let mut t = after
            .with_second(0)?
            .with_nanosecond(0)?
            .checked_add_signed(Duration::minutes(1))?;

        while t.year() <= limit {
            if !has(self.months, t.month()) {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = NaiveDate::from_ymd_opt(year, month, 1)?
                    .and_hms_opt(0, 0, 0)?
                    .and_utc();
                continue;
            }
            if !self.day_matches(t.date_naive()) {
                t = t.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?.and_utc();
                continue;
            }
            if !has(self.hours, t.hour()) {
                t = t.with_minute(0)?.checked_add_signed(Duration::hours(1))?;
                continue;
            }
            if !has(self.minutes, t.minute()) {
                t = t.checked_add_signed(Duration::minutes(1))?;
                continue;
            }
            return Some(t);
        }
        None
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for CronExpression {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CronExpression {
    type Error = CronError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CronExpression> for String {
    fn from(value: CronExpression) -> Self {
        value.source
    }
}
