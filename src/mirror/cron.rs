//! Six-field cron schedules (seconds granularity).
//!
//! The dialect is the usual Quartz-flavored one: `sec min hour
//! day-of-month month day-of-week`, where `?` is an alias for `*`, fields
//! take lists, ranges and steps, and months/weekdays also accept names.
//! When both day fields are restricted, a day matching either fires, as
//! cron has always done. `next_after` is deterministic, which is what makes
//! schedules testable.
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

use crate::Error;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

#[derive(Debug, Clone)]
struct Field {
    values: Vec<u32>,
    restricted: bool,
}

impl Field {
    fn contains(&self, v: u32) -> bool {
        self.values.binary_search(&v).is_ok()
    }
}

/// A parsed cron schedule.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    seconds: Field,
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    days_of_week: Field,
}

fn bad(expr: &str) -> Error {
    Error::Mirror(format!("invalid cron expression: {}", expr))
}

fn parse_atom(atom: &str, names: Option<&[&str]>, min: u32, max: u32) -> Option<u32> {
    if let Ok(n) = atom.parse::<u32>() {
        if n >= min && n <= max {
            return Some(n);
        }
        return None;
    }
    let names = names?;
    let upper = atom.to_ascii_uppercase();
    names
        .iter()
        .position(|n| *n == upper)
        .map(|i| i as u32 + min)
}

fn parse_field(
    expr: &str,
    raw: &str,
    min: u32,
    max: u32,
    names: Option<&[&str]>,
) -> Result<Field, Error> {
    if raw == "*" || raw == "?" {
        return Ok(Field {
            values: (min..=max).collect(),
            restricted: false,
        });
    }
    let mut values = Vec::new();
    for part in raw.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| bad(expr))?;
                if step == 0 {
                    return Err(bad(expr));
                }
                (range, step)
            }
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let a = parse_atom(a, names, min, max).ok_or_else(|| bad(expr))?;
            let b = parse_atom(b, names, min, max).ok_or_else(|| bad(expr))?;
            if a > b {
                return Err(bad(expr));
            }
            (a, b)
        } else {
            let v = parse_atom(range, names, min, max).ok_or_else(|| bad(expr))?;
            // A bare value with a step means "from v to max".
            if part.contains('/') {
                (v, max)
            } else {
                (v, v)
            }
        };
        let mut v = lo;
        while v <= hi {
            values.push(v);
            v += step;
        }
    }
    values.sort_unstable();
    values.dedup();
    if values.is_empty() {
        return Err(bad(expr));
    }
    Ok(Field {
        values,
        restricted: true,
    })
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<CronSchedule, Error> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(bad(expr));
        }
        let mut days_of_week = parse_field(expr, fields[5], 0, 7, Some(&DAY_NAMES))?;
        // Both 0 and 7 mean Sunday.
        if days_of_week.contains(7) {
            days_of_week.values.retain(|v| *v != 7);
            days_of_week.values.insert(0, 0);
            days_of_week.values.dedup();
        }
        Ok(CronSchedule {
            seconds: parse_field(expr, fields[0], 0, 59, None)?,
            minutes: parse_field(expr, fields[1], 0, 59, None)?,
            hours: parse_field(expr, fields[2], 0, 23, None)?,
            days_of_month: parse_field(expr, fields[3], 1, 31, None)?,
            months: parse_field(expr, fields[4], 1, 12, Some(&MONTH_NAMES))?,
            days_of_week,
        })
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        if !self.months.contains(date.month()) {
            return false;
        }
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

    /// The first fire time strictly after `now`. `None` when no day within
    /// the next four years matches, which only degenerate expressions
    /// produce.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = (now + Duration::seconds(1)).with_nanosecond(0)?;
        let mut date = start.date_naive();
        let first_day_time = start.time();

        for day in 0..(4 * 366) {
            if self.day_matches(date) {
                let earliest = if day == 0 {
                    Some(first_day_time)
                } else {
                    None
                };
                if let Some((h, m, s)) = self.first_time_at_or_after(earliest) {
                    let naive = date.and_hms_opt(h, m, s)?;
                    return Some(Utc.from_utc_datetime(&naive));
                }
            }
            date = date.succ_opt()?;
        }
        None
    }

    /// Smallest (hour, minute, second) of this schedule at or after
    /// `earliest` (start of day when `None`).
    fn first_time_at_or_after(
        &self,
        earliest: Option<chrono::NaiveTime>,
    ) -> Option<(u32, u32, u32)> {
        let (eh, em, es) = match earliest {
            Some(t) => (t.hour(), t.minute(), t.second()),
            None => (0, 0, 0),
        };
        for &h in &self.hours.values {
            if h < eh {
                continue;
            }
            for &m in &self.minutes.values {
                if h == eh && m < em {
                    continue;
                }
                for &s in &self.seconds.values {
                    if h == eh && m == em && s < es {
                        continue;
                    }
                    return Some((h, m, s));
                }
            }
        }
        None
    }
}
