use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, Timelike, Utc};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CronError {
    #[error("expected 5 or 6 fields, got {0}")]
    FieldCount(usize),
    #[error("invalid {field} value {value:?}")]
    InvalidValue { field: &'static str, value: String },
    #[error("{field} value {value} is outside {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("unknown alias {0}")]
    UnknownAlias(String),
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
}

const SECONDS: FieldSpec = FieldSpec {
    name: "second",
    min: 0,
    max: 59,
    names: &[],
};
const MINUTES: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
};
const HOURS: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
};
const DAYS_OF_MONTH: FieldSpec = FieldSpec {
    name: "day of month",
    min: 1,
    max: 31,
    names: &[],
};
const MONTHS: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &[
        "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
    ],
};
const DAYS_OF_WEEK: FieldSpec = FieldSpec {
    name: "day of week",
    min: 0,
    max: 7,
    names: &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"],
};

/// Allowed values of one field as a bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    bits: u64,
    restricted: bool,
}

impl Field {
    fn contains(&self, value: u32) -> bool {
        self.bits & (1 << value) != 0
    }

    fn parse(spec: &FieldSpec, text: &str) -> Result<Self, CronError> {
        let mut bits = 0u64;
        let mut restricted = true;
        for part in text.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step.parse().map_err(|_| invalid(spec, part))?;
                    if step == 0 {
                        return Err(invalid(spec, part));
                    }
                    (range, step)
                }
                None => (part, 1),
            };
            let (start, end) = match range {
                "*" | "?" => {
                    if step == 1 && text.split(',').count() == 1 {
                        restricted = false;
                    }
                    (spec.min, spec.max)
                }
                _ => match range.split_once('-') {
                    Some((a, b)) => (value(spec, a)?, value(spec, b)?),
                    None if part.contains('/') => (value(spec, range)?, spec.max),
                    None => {
                        let v = value(spec, range)?;
                        (v, v)
                    }
                },
            };
            if start > end {
                return Err(invalid(spec, part));
            }
            for v in (start..=end).step_by(step as usize) {
                bits |= 1 << v;
            }
        }
        if bits == 0 {
            return Err(invalid(spec, text));
        }
        Ok(Self { bits, restricted })
    }
}

fn invalid(spec: &FieldSpec, text: &str) -> CronError {
    CronError::InvalidValue {
        field: spec.name,
        value: text.to_string(),
    }
}

fn value(spec: &FieldSpec, text: &str) -> Result<u32, CronError> {
    let upper = text.to_ascii_uppercase();
    let v = match spec.names.iter().position(|n| *n == upper) {
        Some(index) => index as u32 + if spec.min == 1 { 1 } else { 0 },
        None => text.parse().map_err(|_| invalid(spec, text))?,
    };
    if v < spec.min || v > spec.max {
        return Err(CronError::OutOfRange {
            field: spec.name,
            value: v,
            min: spec.min,
            max: spec.max,
        });
    }
    Ok(v)
}

/// A parsed cron expression, evaluated in UTC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    seconds: Field,
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    days_of_week: Field,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let source = expression.trim();
        let expanded = match source {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            alias if alias.starts_with('@') => {
                return Err(CronError::UnknownAlias(alias.to_string()));
            }
            other => other,
        };
        let fields: Vec<&str> = expanded.split_whitespace().collect();
        let (seconds, rest) = match fields.len() {
            5 => ("0", &fields[..]),
            6 => (fields[0], &fields[1..]),
            n => return Err(CronError::FieldCount(n)),
        };
        let mut days_of_week = Field::parse(&DAYS_OF_WEEK, rest[4])?;
        // 7 is another name for Sunday
        if days_of_week.contains(7) {
            days_of_week.bits = (days_of_week.bits & !(1 << 7)) | 1;
        }
        Ok(Self {
            source: source.to_string(),
            seconds: Field::parse(&SECONDS, seconds)?,
            minutes: Field::parse(&MINUTES, rest[0])?,
            hours: Field::parse(&HOURS, rest[1])?,
            days_of_month: Field::parse(&DAYS_OF_MONTH, rest[2])?,
            months: Field::parse(&MONTHS, rest[3])?,
            days_of_week,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        match (self.days_of_month.restricted, self.days_of_week.restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First firing strictly after `after`. `None` when the expression can
    /// never fire (such as February 30th).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let limit = after.year() + 8;
        let mut t = after.with_nanosecond(0)? + TimeDelta::seconds(1);
        while t.year() <= limit {
            if !self.months.contains(t.month()) {
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
            if !self.hours.contains(t.hour()) {
                t = t.with_minute(0)?.with_second(0)? + TimeDelta::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t = t.with_second(0)? + TimeDelta::minutes(1);
                continue;
            }
            if !self.seconds.contains(t.second()) {
                t += TimeDelta::seconds(1);
                continue;
            }
            return Some(t);
        }
        None
    }

    /// The next `count` firings after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut times = Vec::with_capacity(count);
        let mut cursor = after;
        while times.len() < count {
            match self.next_after(cursor) {
                Some(next) => {
                    times.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        times
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
