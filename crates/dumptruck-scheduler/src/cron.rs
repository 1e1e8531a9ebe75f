//! Cron expression parser.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds)
//! Field syntax: *, N, A-B, */S, A-B/S, N/S and comma lists of those.
//! Month and weekday names (JAN, MON, ...) are accepted; weekday 7 is Sunday.
//! Example: "0 2 * * *" = every day at 02:00
//!
//! Hand-rolled on chrono, no cron crate dependency.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, TimeZone, Timelike, Utc};
use dumptruck_core::error::{DumptruckError, Result};

/// How many days ahead to search before giving up. Large enough for
/// "29 2 * * 1"-style expressions that only line up every few decades.
const MAX_SEARCH_DAYS: u32 = 366 * 30;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed, immutable cron schedule bound to a timezone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
    offset: FixedOffset,
}

impl CronSchedule {
    /// Parse an expression evaluated in `timezone` (`UTC` or `+HH:MM`).
    pub fn parse(expression: &str, timezone: &str) -> Result<Self> {
        let offset = parse_timezone(timezone)?;
        let expanded = expand_macro(expression.trim());
        let parts: Vec<&str> = expanded.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(invalid(
                expression,
                "need 5 fields: MIN HOUR DOM MON DOW",
            ));
        }

        let field = |spec: &str, min: u32, max: u32, names: &[&str], base: u32| {
            parse_field(spec, min, max, names, base).map_err(|reason| invalid(expression, &reason))
        };

        let minutes = field(parts[0], 0, 59, &[], 0)?;
        let hours = field(parts[1], 0, 23, &[], 0)?;
        let days_of_month = field(parts[2], 1, 31, &[], 0)?;
        let months = field(parts[3], 1, 12, &MONTH_NAMES, 1)?;
        let mut days_of_week = field(parts[4], 0, 7, &WEEKDAY_NAMES, 0)?;
        // 7 is an alias for Sunday
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            expression: expression.trim().to_string(),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: !parts[2].starts_with('*'),
            dow_restricted: !parts[4].starts_with('*'),
            offset,
        })
    }

    /// Parse an expression evaluated in UTC.
    pub fn utc(expression: &str) -> Result<Self> {
        Self::parse(expression, "UTC")
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// True when `at` is exactly on a matching minute boundary.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.offset);
        local.second() == 0
            && local.nanosecond() == 0
            && bit(self.minutes, local.minute())
            && bit(self.hours, local.hour())
            && self.day_matches(local.date_naive())
    }

    /// First matching time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.offset);
        let floored = local.with_second(0)?.with_nanosecond(0)?;
        self.search_from(floored + Duration::minutes(1))
    }

    /// First matching time at or after `at`.
    pub fn next_at_or_after(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = at.with_timezone(&self.offset);
        let floored = local.with_second(0)?.with_nanosecond(0)?;
        if floored == local {
            self.search_from(floored)
        } else {
            self.search_from(floored + Duration::minutes(1))
        }
    }

    /// Matching times starting at or after `from`.
    pub fn upcoming(&self, from: DateTime<Utc>) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        std::iter::successors(self.next_at_or_after(from), move |prev| self.next_after(*prev))
    }

    fn search_from(&self, start: DateTime<FixedOffset>) -> Option<DateTime<Utc>> {
        let mut date = start.date_naive();
        let mut earliest = (start.hour(), start.minute());

        for _ in 0..MAX_SEARCH_DAYS {
            if self.day_matches(date) {
                if let Some((h, m)) = self.first_time_from(earliest) {
                    let naive = date.and_hms_opt(h, m, 0)?;
                    let local = self.offset.from_local_datetime(&naive).single()?;
                    return Some(local.with_timezone(&Utc));
                }
            }
            date = date.succ_opt()?;
            earliest = (0, 0);
        }

        None
    }

    fn first_time_from(&self, (hour, minute): (u32, u32)) -> Option<(u32, u32)> {
        for h in hour..24 {
            if !bit(self.hours, h) {
                continue;
            }
            let first_minute = if h == hour { minute } else { 0 };
            if let Some(m) = (first_minute..60).find(|m| bit(self.minutes, *m)) {
                return Some((h, m));
            }
        }
        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        if !bit(self.months, date.month()) {
            return false;
        }
        let dom = bit(self.days_of_month, date.day());
        let dow = bit(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

impl std::fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.expression, self.offset)
    }
}

/// Parse `UTC`, `Z`, `Etc/UTC` or a fixed `+HH:MM` / `-HHMM` offset.
pub fn parse_timezone(timezone: &str) -> Result<FixedOffset> {
    let tz = timezone.trim();
    let utc = FixedOffset::east_opt(0).ok_or_else(|| invalid_tz(tz))?;
    if tz.is_empty() || matches!(tz.to_ascii_uppercase().as_str(), "UTC" | "Z" | "GMT" | "ETC/UTC") {
        return Ok(utc);
    }

    let (sign, rest) = match tz.as_bytes()[0] {
        b'+' => (1, &tz[1..]),
        b'-' => (-1, &tz[1..]),
        _ => return Err(invalid_tz(tz)),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid_tz(tz));
    }
    let hours: i32 = digits[..2].parse().map_err(|_| invalid_tz(tz))?;
    let minutes: i32 = digits[2..].parse().map_err(|_| invalid_tz(tz))?;
    if hours > 23 || minutes > 59 {
        return Err(invalid_tz(tz));
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(|| invalid_tz(tz))
}

fn expand_macro(expression: &str) -> &str {
    match expression {
        "@yearly" | "@annually" => "0 0 1 1 *",
        "@monthly" => "0 0 1 * *",
        "@weekly" => "0 0 * * 0",
        "@daily" | "@midnight" => "0 0 * * *",
        "@hourly" => "0 * * * *",
        other => other,
    }
}

/// Parse a cron field into a bitmask of matching values.
fn parse_field(
    field: &str,
    min: u32,
    max: u32,
    names: &[&str],
    name_base: u32,
) -> std::result::Result<u64, String> {
    let mut mask = 0u64;
    for part in field.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(format!("empty list entry in '{field}'"));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("bad step '{step}' in '{part}'"))?;
                if step == 0 {
                    return Err(format!("zero step in '{part}'"));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let lo = parse_value(a, names, name_base)?;
            let hi = parse_value(b, names, name_base)?;
            if lo > hi {
                return Err(format!("descending range '{range}'"));
            }
            (lo, hi)
        } else {
            let n = parse_value(range, names, name_base)?;
            // "N/S" means from N to the end of the field
            if step.is_some() { (n, max) } else { (n, n) }
        };

        if lo < min || hi > max {
            return Err(format!("'{part}' out of range {min}-{max}"));
        }
        for v in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
            mask |= 1 << v;
        }
    }
    Ok(mask)
}

fn parse_value(raw: &str, names: &[&str], name_base: u32) -> std::result::Result<u32, String> {
    if let Ok(n) = raw.parse::<u32>() {
        return Ok(n);
    }
    let upper = raw.to_ascii_uppercase();
    names
        .iter()
        .position(|n| *n == upper)
        .map(|i| i as u32 + name_base)
        .ok_or_else(|| format!("unknown value '{raw}'"))
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1 << value) != 0
}

fn invalid(expression: &str, reason: &str) -> DumptruckError {
    DumptruckError::InvalidCron {
        expression: expression.to_string(),
        reason: reason.to_string(),
    }
}

fn invalid_tz(timezone: &str) -> DumptruckError {
    DumptruckError::InvalidCron {
        expression: timezone.to_string(),
        reason: "timezone must be UTC or a fixed offset like +05:30".into(),
    }
}
