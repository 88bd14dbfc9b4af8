//! Six-field, second-granularity cron expressions.
//!
//! Fields are `second minute hour day-of-month month day-of-week`, with
//! months counted from 0 (January) and weekdays from 0 (Sunday). Each field
//! is a comma separated list of `n`, `a-b`, `a-b/step` or `*/step` tokens.

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};
use std::str::FromStr;

use crate::error::CronParseError;

/// Deadline used when a window has no explicit end (2099-01-01).
pub const DEFAULT_DEADLINE_MS: i64 = 4_070_880_000_000;

const FIELD_NAMES: [&str; 6] = ["second", "minute", "hour", "date", "month", "day"];
const FIELD_RANGES: [(u32, u32); 6] = [(0, 59), (0, 59), (0, 23), (1, 31), (0, 11), (0, 6)];

/// A parsed cron expression: one bit set per allowed value of each field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    fields: [u64; 6],
}

impl Schedule {
    /// Parse a six-field expression.
    pub fn parse(expression: &str) -> Result<Self, CronParseError> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 6 {
            return Err(CronParseError::FieldCount { found: parts.len() });
        }

        let mut fields = [0u64; 6];
        for (index, part) in parts.iter().enumerate() {
            fields[index] = parse_field(part, index)?;
        }
        Ok(Self { fields })
    }

    /// Whether every field allows the calendar position of `at`.
    pub fn matches<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> bool {
        let values = [
            at.second(),
            at.minute(),
            at.hour(),
            at.day(),
            at.month0(),
            at.weekday().num_days_from_sunday(),
        ];
        values
            .iter()
            .zip(self.fields.iter())
            .all(|(value, mask)| mask & (1u64 << value) != 0)
    }

    /// Whether `value` is allowed in the field at `index` (zero-based).
    pub fn allows(&self, index: usize, value: u32) -> bool {
        value < 64 && self.fields.get(index).is_some_and(|mask| mask & (1u64 << value) != 0)
    }
}

impl FromStr for Schedule {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_field(field: &str, index: usize) -> Result<u64, CronParseError> {
    let (min, max) = FIELD_RANGES[index];
    let name = FIELD_NAMES[index];
    let invalid = || CronParseError::InvalidField {
        index: index + 1,
        name,
        field: field.to_string(),
    };

    let expanded = field.replace('*', &format!("{min}-{max}"));
    let mut mask = 0u64;

    for token in expanded.split(',') {
        let (range, step) = match token.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (token, None),
        };
        let (left, right) = match range.split_once('-') {
            Some((left, right)) => (left, Some(right)),
            None => (range, None),
        };

        let left = parse_number(left).ok_or_else(invalid)?;
        let right = match right {
            Some(text) => Some(parse_number(text).ok_or_else(invalid)?),
            None => None,
        };
        let step = match step {
            Some(text) => Some(parse_number(text).ok_or_else(invalid)?),
            None => None,
        };

        let left = left.max(min);
        let right = right.unwrap_or(left).min(max);
        // A zero step behaves like no step.
        let step = step.filter(|step| *step > 0).unwrap_or(1);

        let mut value = left;
        while value <= right {
            mask |= 1u64 << value;
            match value.checked_add(step) {
                Some(next) => value = next,
                None => break,
            }
        }
    }

    if mask == 0 {
        return Err(CronParseError::EmptyField {
            index: index + 1,
            name,
        });
    }
    Ok(mask)
}

fn parse_number(text: &str) -> Option<u32> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

/// Walks the instants matching a [`Schedule`] inside a time window.
///
/// Both bounds are normalized to whole seconds: the start is floored and
/// advanced by one second, the deadline is floored. The window therefore
/// excludes its start instant and includes its deadline, so consecutive
/// windows `[a, b]`, `[b, c]` never report the same instant twice.
#[derive(Debug, Clone)]
pub struct CronTime<Tz: TimeZone = Local> {
    schedule: Schedule,
    cursor: i64,
    deadline: i64,
    tz: Tz,
}

impl CronTime<Local> {
    /// Evaluate `expression` from now until the default deadline, in local time.
    pub fn new(expression: &str) -> Result<Self, CronParseError> {
        Self::with_window(expression, None, None)
    }

    /// Evaluate `expression` over `[start, deadline]` (milliseconds since
    /// the epoch), in local time. Missing bounds default to now and
    /// [`DEFAULT_DEADLINE_MS`].
    pub fn with_window(
        expression: &str,
        start: Option<i64>,
        deadline: Option<i64>,
    ) -> Result<Self, CronParseError> {
        let schedule = Schedule::parse(expression)?;
        Ok(Self::from_schedule(schedule, start, deadline, Local))
    }
}

impl<Tz: TimeZone> CronTime<Tz> {
    /// Evaluate an already parsed schedule in the given time zone.
    pub fn from_schedule(
        schedule: Schedule,
        start: Option<i64>,
        deadline: Option<i64>,
        tz: Tz,
    ) -> Self {
        let start = start.unwrap_or_else(crate::clock::now_millis);
        let deadline = deadline.unwrap_or(DEFAULT_DEADLINE_MS);

        Self {
            schedule,
            cursor: start.div_euclid(1000) * 1000 + 1000,
            deadline: deadline.div_euclid(1000) * 1000,
            tz,
        }
    }

    /// The schedule being evaluated.
    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Next matching instant, or `None` once the cursor passes the deadline.
    pub fn next_match(&mut self) -> Option<DateTime<Tz>> {
        while self.cursor <= self.deadline {
            let candidate = self.tz.timestamp_millis_opt(self.cursor).single();
            self.cursor += 1000;
            if let Some(at) = candidate {
                if self.schedule.matches(&at) {
                    return Some(at);
                }
            }
        }
        None
    }
}

impl<Tz: TimeZone> Iterator for CronTime<Tz> {
    type Item = DateTime<Tz>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_match()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn at(h: u32, m: u32, s: u32, ms: i64) -> i64 {
        Utc.with_ymd_and_hms(2020, 1, 1, h, m, s)
            .unwrap()
            .timestamp_millis()
            + ms
    }

    fn window(expression: &str, start: i64, deadline: i64) -> CronTime<Utc> {
        let schedule = Schedule::parse(expression).unwrap();
        CronTime::from_schedule(schedule, Some(start), Some(deadline), Utc)
    }

    #[test]
    fn test_whole_second_window_includes_deadline() {
        let mut cron = window("* * * * * *", at(10, 0, 0, 0), at(10, 0, 1, 0));
        let next = cron.next_match().unwrap();
        assert_eq!(next.timestamp_millis(), at(10, 0, 1, 0));
        assert!(cron.next_match().is_none());
    }

    #[test]
    fn test_millisecond_offsets_are_floored() {
        let mut cron = window("* * * * * *", at(10, 0, 0, 500), at(10, 0, 1, 500));
        assert_eq!(cron.next_match().unwrap().timestamp_millis(), at(10, 0, 1, 0));

        let mut cron = window("* * * * * *", at(10, 0, 0, 500), at(10, 0, 1, 0));
        assert_eq!(cron.next_match().unwrap().timestamp_millis(), at(10, 0, 1, 0));
    }

    #[test]
    fn test_sub_second_window_never_matches() {
        let mut cron = window("* * * * * *", at(10, 0, 0, 500), at(10, 0, 0, 600));
        assert!(cron.next_match().is_none());

        let mut cron = window("* * * * * *", at(10, 0, 0, 0), at(10, 0, 0, 600));
        assert!(cron.next_match().is_none());
    }

    #[test]
    fn test_repeated_calls_enumerate_window() {
        let mut cron = window("* * * * * *", at(10, 0, 0, 0), at(10, 0, 3, 0));
        cron.next_match();
        cron.next_match();
        assert_eq!(cron.next_match().unwrap().timestamp_millis(), at(10, 0, 3, 0));
        assert!(cron.next_match().is_none());
    }

    #[test]
    fn test_adjacent_small_windows_fire_once_per_second() {
        let start = at(10, 0, 0, 0);
        let deadline = at(10, 0, 10, 0);
        let interval = 10;

        let mut times = 0;
        let mut current = start;
        while current + interval <= deadline {
            if window("* * * * * *", current, current + interval).next_match().is_some() {
                times += 1;
            }
            current += interval;
        }
        assert_eq!(times, 10);
    }

    #[test]
    fn test_matches_are_increasing_whole_seconds() {
        let matches: Vec<i64> = window("*/5 * * * * *", at(10, 0, 0, 0), at(10, 1, 0, 0))
            .map(|t| t.timestamp_millis())
            .collect();
        assert_eq!(matches.len(), 12);
        assert!(matches.windows(2).all(|w| w[0] < w[1]));
        assert!(matches.iter().all(|t| t % 1000 == 0));
        assert_eq!(matches[0], at(10, 0, 5, 0));
        assert_eq!(matches[11], at(10, 1, 0, 0));
    }

    #[test]
    fn test_calendar_fields() {
        // 2020-01-05 is a Sunday.
        let start = at(0, 0, 0, 0);
        let deadline = start + 7 * 86_400_000;
        let mut cron = window("0 30 12 * 0 0", start, deadline);
        let next = cron.next_match().unwrap();
        assert_eq!(
            next,
            Utc.with_ymd_and_hms(2020, 1, 5, 12, 30, 0).unwrap()
        );
        assert!(cron.next_match().is_none());
    }

    #[test]
    fn test_month_is_zero_based() {
        let schedule = Schedule::parse("0 0 0 1 1 *").unwrap();
        assert!(schedule.matches(&Utc.with_ymd_and_hms(2020, 2, 1, 0, 0, 0).unwrap()));
        assert!(!schedule.matches(&Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()));
    }

    #[test]
    fn test_parse_lists_ranges_and_steps() {
        let schedule = Schedule::parse("1,3-5,10-20/5 * * * * *").unwrap();
        let seconds: Vec<u32> = (0..60).filter(|s| schedule.allows(0, *s)).collect();
        assert_eq!(seconds, vec![1, 3, 4, 5, 10, 15, 20]);

        let schedule: Schedule = "*/15 * * * * *".parse().unwrap();
        let seconds: Vec<u32> = (0..60).filter(|s| schedule.allows(0, *s)).collect();
        assert_eq!(seconds, vec![0, 15, 30, 45]);
    }

    #[test]
    fn test_parse_clamps_out_of_range_bounds() {
        let schedule = Schedule::parse("50-99 * 20-30 0-2 * *").unwrap();
        let seconds: Vec<u32> = (0..64).filter(|s| schedule.allows(0, *s)).collect();
        assert_eq!(seconds, (50..60).collect::<Vec<_>>());
        let hours: Vec<u32> = (0..64).filter(|h| schedule.allows(2, *h)).collect();
        assert_eq!(hours, vec![20, 21, 22, 23]);
        let days: Vec<u32> = (0..64).filter(|d| schedule.allows(3, *d)).collect();
        assert_eq!(days, vec![1, 2]);
    }

    #[test]
    fn test_parse_huge_step_stops_at_bound() {
        let schedule = Schedule::parse("1/4294967295 * * * * *").unwrap();
        let seconds: Vec<u32> = (0..64).filter(|s| schedule.allows(0, *s)).collect();
        assert_eq!(seconds, vec![1]);

        let schedule = Schedule::parse("0-59/4294967295 * * * * *").unwrap();
        let seconds: Vec<u32> = (0..64).filter(|s| schedule.allows(0, *s)).collect();
        assert_eq!(seconds, vec![0]);
    }

    #[test]
    fn test_parse_wrong_field_count() {
        assert_eq!(
            Schedule::parse("* * * * *"),
            Err(CronParseError::FieldCount { found: 5 })
        );
        assert_eq!(
            Schedule::parse("* * * * * * *"),
            Err(CronParseError::FieldCount { found: 7 })
        );
        assert_eq!(
            Schedule::parse(""),
            Err(CronParseError::FieldCount { found: 0 })
        );
    }

    #[test]
    fn test_parse_invalid_field() {
        assert_eq!(
            Schedule::parse("* x * * * *"),
            Err(CronParseError::InvalidField {
                index: 2,
                name: "minute",
                field: "x".to_string(),
            })
        );
        assert!(matches!(
            Schedule::parse("* * 1- * * *"),
            Err(CronParseError::InvalidField { index: 3, .. })
        ));
        assert!(matches!(
            Schedule::parse("1,,2 * * * * *"),
            Err(CronParseError::InvalidField { index: 1, .. })
        ));
    }

    #[test]
    fn test_parse_empty_field() {
        assert_eq!(
            Schedule::parse("* * 30 * * *"),
            Err(CronParseError::EmptyField {
                index: 3,
                name: "hour",
            })
        );
    }

    #[test]
    fn test_local_constructor() {
        let mut cron = CronTime::with_window("* * * * * *", Some(0), Some(2000)).unwrap();
        assert_eq!(cron.next_match().unwrap().timestamp_millis(), 1000);
        assert_eq!(cron.next_match().unwrap().timestamp_millis(), 2000);
        assert!(cron.next_match().is_none());
        assert!(CronTime::new("bad").is_err());
    }
}
