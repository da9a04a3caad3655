//! Daily accounting derived from time entries.
//!
//! Daily logs are never patched in place: every reconciliation recomputes them
//! from the complete entry set, so repeated runs over the same entries agree.

use crate::models::TimeEntry;
use chrono::{Datelike, Duration, NaiveDate};
use std::collections::{BTreeMap, HashMap};

pub type DailyLogs = BTreeMap<NaiveDate, u64>;

/// Group-by-sum of entry durations per calendar day.
pub fn aggregate<'a, I>(entries: I) -> DailyLogs
where
    I: IntoIterator<Item = &'a TimeEntry>,
{
    let mut logs = DailyLogs::new();
    for entry in entries {
        *logs.entry(entry.date).or_insert(0) += entry.duration_seconds;
    }
    logs
}

pub fn daily_logs_by_demand(entries: &[TimeEntry]) -> HashMap<String, DailyLogs> {
    let mut grouped: HashMap<String, Vec<&TimeEntry>> = HashMap::new();
    for entry in entries {
        grouped.entry(entry.demand_id.clone()).or_default().push(entry);
    }
    grouped
        .into_iter()
        .map(|(demand_id, entries)| (demand_id, aggregate(entries)))
        .collect()
}

pub fn total_seconds(logs: &DailyLogs) -> u64 {
    logs.values().sum()
}

/// Monday through Friday of the week containing `today`, with logged seconds.
pub fn week_breakdown(logs: &DailyLogs, today: NaiveDate) -> [(NaiveDate, u64); 5] {
    let monday = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
    std::array::from_fn(|offset| {
        let day = monday + Duration::days(offset as i64);
        (day, logs.get(&day).copied().unwrap_or(0))
    })
}

/// Renders seconds as `HH:MMh`.
pub fn format_hours(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    format!("{:02}:{:02}h", hours, minutes)
}
