//! Calendar windows for reports

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::models::{TransactionRecord, UsagePoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl FromStr for WindowKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daily" | "day" => Ok(WindowKind::Daily),
            "weekly" | "week" => Ok(WindowKind::Weekly),
            "monthly" | "month" => Ok(WindowKind::Monthly),
            "yearly" | "year" => Ok(WindowKind::Yearly),
            other => Err(format!("unknown report window: {}", other)),
        }
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WindowKind::Daily => "daily",
            WindowKind::Weekly => "weekly",
            WindowKind::Monthly => "monthly",
            WindowKind::Yearly => "yearly",
        };
        f.write_str(label)
    }
}

/// What to do with a record whose timestamp cannot be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnparsablePolicy {
    /// Place the record at `now`, so it always lands in the current window.
    #[default]
    TreatAsNow,
    Exclude,
}

/// Anything that can be placed in a window.
pub trait Timestamped {
    fn recorded_at(&self) -> Option<DateTime<Utc>>;
}

impl Timestamped for UsagePoint {
    fn recorded_at(&self) -> Option<DateTime<Utc>> {
        self.recorded_at
    }
}

impl Timestamped for TransactionRecord {
    fn recorded_at(&self) -> Option<DateTime<Utc>> {
        self.recorded_at
    }
}

/// Parses the timestamp shapes the backend and the views produce.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    const NAIVE_FORMATS: [&str; 3] =
        ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Converts contract seconds to the backend's display format.
pub fn from_unix_seconds(secs: u64) -> (String, Option<DateTime<Utc>>) {
    match i64::try_from(secs).ok().and_then(|s| Utc.timestamp_opt(s, 0).single()) {
        Some(at) => (at.format("%Y-%m-%d %H:%M:%S").to_string(), Some(at)),
        None => (secs.to_string(), None),
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

/// Inclusive lower bound of the window containing `now`.
pub fn window_start(kind: WindowKind, now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive();
    let start = match kind {
        WindowKind::Daily => today,
        WindowKind::Weekly => {
            today - Duration::days(i64::from(today.weekday().num_days_from_monday()))
        }
        WindowKind::Monthly => today.with_day(1).unwrap_or(today),
        WindowKind::Yearly => NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap_or(today),
    };
    midnight(start)
}

/// Keeps the records falling in `[window_start(kind, now), now]`, preserving order.
pub fn filter_by_window<T>(
    records: &[T],
    kind: WindowKind,
    now: DateTime<Utc>,
    policy: UnparsablePolicy,
) -> Vec<T>
where
    T: Timestamped + Clone,
{
    let start = window_start(kind, now);
    let mut unparsable = 0usize;

    let kept: Vec<T> = records
        .iter()
        .filter(|record| {
            let at = match (record.recorded_at(), policy) {
                (Some(at), _) => at,
                (None, UnparsablePolicy::TreatAsNow) => {
                    unparsable += 1;
                    now
                }
                (None, UnparsablePolicy::Exclude) => {
                    unparsable += 1;
                    return false;
                }
            };
            at >= start && at <= now
        })
        .cloned()
        .collect();

    if unparsable > 0 {
        tracing::warn!(
            "{} record(s) with unparsable timestamps handled as {:?} in {} window",
            unparsable,
            policy,
            kind
        );
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(raw: &str) -> DateTime<Utc> {
        parse_timestamp(raw).unwrap()
    }

    fn point(raw: &str) -> UsagePoint {
        UsagePoint {
            amount_mb: 1,
            cumulative_mb: 1,
            timestamp: raw.to_string(),
            recorded_at: parse_timestamp(raw),
        }
    }

    #[test]
    fn daily_window_starts_at_midnight() {
        let now = at("2024-06-15 10:00:00");
        let records = vec![point("2024-06-15 00:00:01"), point("2024-06-14 23:59:59")];
        let kept = filter_by_window(&records, WindowKind::Daily, now, UnparsablePolicy::TreatAsNow);
        assert_eq!(kept, vec![records[0].clone()]);
    }

    #[test]
    fn weekly_window_anchors_on_monday() {
        // 2024-06-12 is a Wednesday
        let now = at("2024-06-12 09:30:00");
        assert_eq!(window_start(WindowKind::Weekly, now), at("2024-06-10 00:00:00"));

        let records = vec![point("2024-06-10 00:00:00"), point("2024-06-09 23:00:00")];
        let kept =
            filter_by_window(&records, WindowKind::Weekly, now, UnparsablePolicy::TreatAsNow);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].timestamp, "2024-06-10 00:00:00");
    }

    #[test]
    fn monthly_and_yearly_bounds() {
        let now = at("2024-06-15 10:00:00");
        assert_eq!(window_start(WindowKind::Monthly, now), at("2024-06-01 00:00:00"));
        assert_eq!(window_start(WindowKind::Yearly, now), at("2024-01-01 00:00:00"));
    }

    #[test]
    fn future_records_fall_outside() {
        let now = at("2024-06-15 10:00:00");
        let records = vec![point("2024-06-15 10:00:00"), point("2024-06-15 10:00:01")];
        let kept = filter_by_window(&records, WindowKind::Daily, now, UnparsablePolicy::TreatAsNow);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn unparsable_timestamps_follow_policy() {
        let now = at("2024-06-15 10:00:00");
        let records = vec![point("not a date"), point("2023-01-01 00:00:00")];

        let as_now =
            filter_by_window(&records, WindowKind::Daily, now, UnparsablePolicy::TreatAsNow);
        assert_eq!(as_now.len(), 1);
        assert_eq!(as_now[0].timestamp, "not a date");

        let excluded =
            filter_by_window(&records, WindowKind::Yearly, now, UnparsablePolicy::Exclude);
        assert!(excluded.is_empty());
    }

    #[test]
    fn parses_rfc3339_and_backend_format() {
        assert_eq!(at("2024-06-15T10:00:00Z"), at("2024-06-15 10:00:00"));
        assert_eq!(from_unix_seconds(1_718_445_600).0, "2024-06-15 10:00:00");
    }
}
