//! Cron schedule parsing
//!
//! Standard 5-field expressions (`minute hour day-of-month month
//! day-of-week`) where each field accepts `*`, `N`, `A-B`, `*/S`, `A-B/S`,
//! `N/S` and comma separated lists, plus the `@hourly`-style descriptors and
//! `@every <duration>`.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, Timelike};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid schedule '{expr}': {reason}")]
    Invalid { expr: String, reason: String },

    #[error("schedule '{0}' never fires within a year")]
    NeverFires(String),
}

/// Set of allowed values for one cron field, as a bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    bits: u64,
    /// Field starts with `*` (matters for day matching)
    wildcard: bool,
}

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        self.bits & (1u64 << value) != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Spec {
    Fields {
        minute: FieldSet,
        hour: FieldSet,
        day_of_month: FieldSet,
        month: FieldSet,
        day_of_week: FieldSet,
    },
    Every(Duration),
}

/// When the capture scheduler fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    spec: Spec,
    raw: String,
}

impl CronSchedule {
    pub fn parse(raw: &str) -> Result<Self, ScheduleError> {
        let expr = raw.trim();
        let invalid = |reason: String| ScheduleError::Invalid {
            expr: expr.to_string(),
            reason,
        };

        let fields = match expr {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            _ => expr,
        };

        if let Some(every) = fields.strip_prefix("@every") {
            let interval = parse_duration(every.trim()).map_err(invalid)?;
            return Ok(Self {
                spec: Spec::Every(interval),
                raw: expr.to_string(),
            });
        }

        let parts: Vec<&str> = fields.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(invalid(format!(
                "expected 5 fields or a descriptor, got {}",
                parts.len()
            )));
        }

        let mut day_of_week = parse_field(parts[4], 0, 7).map_err(invalid)?;
        // 7 is an alias for Sunday
        if day_of_week.contains(7) {
            day_of_week.bits |= 1;
        }

        Ok(Self {
            spec: Spec::Fields {
                minute: parse_field(parts[0], 0, 59).map_err(invalid)?,
                hour: parse_field(parts[1], 0, 23).map_err(invalid)?,
                day_of_month: parse_field(parts[2], 1, 31).map_err(invalid)?,
                month: parse_field(parts[3], 1, 12).map_err(invalid)?,
                day_of_week,
            },
            raw: expr.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Next firing time strictly after `now`
    pub fn next_after(&self, now: DateTime<Local>) -> Result<DateTime<Local>, ScheduleError> {
        match &self.spec {
            Spec::Every(interval) => ChronoDuration::from_std(*interval)
                .ok()
                .and_then(|interval| now.checked_add_signed(interval))
                .ok_or_else(|| ScheduleError::NeverFires(self.raw.clone())),
            Spec::Fields { .. } => {
                let start = now
                    .with_second(0)
                    .and_then(|t| t.with_nanosecond(0))
                    .unwrap_or(now);
                // Scan forward minute by minute up to 366 days
                let max_minutes = 366 * 24 * 60;
                (1..=max_minutes)
                    .map(|offset| start + ChronoDuration::minutes(offset))
                    .find(|candidate| self.matches(candidate))
                    .ok_or_else(|| ScheduleError::NeverFires(self.raw.clone()))
            }
        }
    }

    fn matches(&self, candidate: &DateTime<Local>) -> bool {
        let Spec::Fields {
            minute,
            hour,
            day_of_month,
            month,
            day_of_week,
        } = &self.spec
        else {
            return false;
        };

        if !minute.contains(candidate.minute())
            || !hour.contains(candidate.hour())
            || !month.contains(candidate.month())
        {
            return false;
        }

        let dom = day_of_month.contains(candidate.day());
        let dow = day_of_week.contains(candidate.weekday().num_days_from_sunday());
        if day_of_month.wildcard || day_of_week.wildcard {
            dom && dow
        } else {
            dom || dow
        }
    }
}

fn parse_field(raw: &str, min: u32, max: u32) -> Result<FieldSet, String> {
    let mut bits = 0u64;
    for part in raw.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step in '{part}'"))?;
                if step == 0 {
                    return Err(format!("zero step in '{part}'"));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((start, end)) = range.split_once('-') {
            (parse_value(start, min, max)?, parse_value(end, min, max)?)
        } else {
            let value = parse_value(range, min, max)?;
            // `N/S` runs from N to the end of the range
            (value, if step.is_some() { max } else { value })
        };
        if start > end {
            return Err(format!("range '{range}' is reversed"));
        }

        let step = step.unwrap_or(1) as usize;
        for value in (start..=end).step_by(step) {
            bits |= 1u64 << value;
        }
    }

    Ok(FieldSet {
        bits,
        wildcard: raw.starts_with('*'),
    })
}

fn parse_value(raw: &str, min: u32, max: u32) -> Result<u32, String> {
    let value: u32 = raw
        .parse()
        .map_err(|_| format!("invalid value '{raw}'"))?;
    if value < min || value > max {
        return Err(format!("value '{raw}' out of range ({min}-{max})"));
    }
    Ok(value)
}

/// Parse durations such as `30s`, `5m`, `1h30m`
fn parse_duration(raw: &str) -> Result<Duration, String> {
    if raw.is_empty() {
        return Err("missing duration".to_string());
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in raw.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration '{raw}'"))?;
        digits.clear();
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            _ => return Err(format!("unknown unit '{c}' in '{raw}'")),
        };
        total = value
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(|| format!("duration '{raw}' overflows"))?;
    }
    if !digits.is_empty() {
        return Err(format!("duration '{raw}' is missing a unit"));
    }
    if total == 0 {
        return Err("duration must be positive".to_string());
    }
    Ok(Duration::from_secs(total))
}
