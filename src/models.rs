use crate::errors::{AppError, AppResult};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A stored row as exchanged with the remote store.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Store-managed write counter stamped on every row.
pub const REVISION_FIELD: &str = "revision";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Demands,
    SubActivities,
    TimeEntries,
}

impl Collection {
    pub const DEMAND_STATE: [Collection; 3] =
        [Collection::Demands, Collection::SubActivities, Collection::TimeEntries];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Demands => "demands",
            Self::SubActivities => "sub_activities",
            Self::TimeEntries => "time_entries",
        }
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw {
            "demands" => Ok(Self::Demands),
            "sub_activities" => Ok(Self::SubActivities),
            "time_entries" => Ok(Self::TimeEntries),
            other => Err(AppError::Internal(format!("unknown collection '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DemandStatus {
    #[default]
    Open,
    InProgress,
    Completed,
    Blocked,
    Cancelled,
}

impl DemandStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Blocked => "BLOCKED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Difficulty {
    #[serde(rename = "FÁCIL")]
    Easy,
    #[default]
    #[serde(rename = "MÉDIA")]
    Medium,
    #[serde(rename = "DIFÍCIL")]
    Hard,
    #[serde(rename = "EXTREMA")]
    Extreme,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubActivity {
    pub id: String,
    pub title: String,
    pub completed: bool,
}

/// A demand as materialized in the local cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemandRecord {
    pub id: String,
    pub title: String,
    pub status: DemandStatus,
    pub priority: Priority,
    pub difficulty: Difficulty,
    pub requester: Option<String>,
    pub responsible: Option<String>,
    pub contract: Option<String>,
    pub description: Option<String>,
    pub start_date: Option<String>,
    pub due_date: Option<String>,
    pub order: i64,
    pub accumulated_seconds: u64,
    pub timer_running: bool,
    pub timer_started_at: Option<DateTime<Utc>>,
    pub timer_session: Option<String>,
    pub sub_activities: Vec<SubActivity>,
    pub daily_logs: BTreeMap<NaiveDate, u64>,
    pub revision: u64,
}

impl DemandRecord {
    pub fn is_running(&self) -> bool {
        self.timer_running && self.timer_started_at.is_some()
    }

    /// Seconds of the session in progress, zero when stopped.
    pub fn running_elapsed(&self, now: DateTime<Utc>) -> u64 {
        match (self.timer_running, self.timer_started_at) {
            (true, Some(started_at)) => elapsed_seconds(started_at, now),
            _ => 0,
        }
    }
}

/// Whole seconds between two instants, clamped at zero under clock skew.
pub fn elapsed_seconds(started_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    u64::try_from((now - started_at).num_seconds()).unwrap_or(0)
}

/// Store shape of a demand row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemandRow {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub status: DemandStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(default)]
    pub requester: Option<String>,
    #[serde(default)]
    pub responsible: Option<String>,
    #[serde(default)]
    pub contract: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub accumulated_seconds: u64,
    #[serde(default)]
    pub timer_running: bool,
    #[serde(default)]
    pub timer_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timer_session: Option<String>,
    #[serde(default)]
    pub revision: u64,
}

impl DemandRow {
    pub fn into_record(self, sub_activities: Vec<SubActivity>, daily_logs: BTreeMap<NaiveDate, u64>) -> DemandRecord {
        // A row with the flag set but no start time is treated as stopped.
        let timer_running = self.timer_running && self.timer_started_at.is_some();
        DemandRecord {
            id: self.id,
            title: self.title,
            status: self.status,
            priority: self.priority,
            difficulty: self.difficulty,
            requester: self.requester,
            responsible: self.responsible,
            contract: self.contract,
            description: self.description,
            start_date: self.start_date,
            due_date: self.due_date,
            order: self.order,
            accumulated_seconds: self.accumulated_seconds,
            timer_running,
            timer_started_at: if timer_running { self.timer_started_at } else { None },
            timer_session: if timer_running { self.timer_session } else { None },
            sub_activities,
            daily_logs,
            revision: self.revision,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubActivityRow {
    pub id: String,
    pub demand_id: String,
    pub title: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeEntry {
    pub id: String,
    pub demand_id: String,
    #[serde(rename = "duration")]
    pub duration_seconds: u64,
    pub date: NaiveDate,
    #[serde(default)]
    pub revision: u64,
}

/// Editable fields of a demand, as submitted by the record form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemandDraft {
    pub title: String,
    #[serde(default)]
    pub status: DemandStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub difficulty: Difficulty,
    pub requester: Option<String>,
    pub responsible: Option<String>,
    pub contract: Option<String>,
    pub description: Option<String>,
    pub start_date: Option<String>,
    pub due_date: Option<String>,
    /// Manual edits overwrite the accumulated total when set.
    pub accumulated_seconds: Option<u64>,
}

impl DemandDraft {
    pub fn to_patch(&self) -> AppResult<Row> {
        let mut row = Row::new();
        row.insert("title".to_string(), self.title.clone().into());
        row.insert("status".to_string(), serde_json::to_value(self.status)?);
        row.insert("priority".to_string(), serde_json::to_value(self.priority)?);
        row.insert("difficulty".to_string(), serde_json::to_value(self.difficulty)?);
        row.insert("requester".to_string(), serde_json::to_value(&self.requester)?);
        row.insert("responsible".to_string(), serde_json::to_value(&self.responsible)?);
        row.insert("contract".to_string(), serde_json::to_value(&self.contract)?);
        row.insert("description".to_string(), serde_json::to_value(&self.description)?);
        row.insert("start_date".to_string(), serde_json::to_value(&self.start_date)?);
        row.insert("due_date".to_string(), serde_json::to_value(&self.due_date)?);
        if let Some(seconds) = self.accumulated_seconds {
            row.insert("accumulated_seconds".to_string(), seconds.into());
        }
        Ok(row)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagCategory {
    Requester,
    Responsible,
    Contract,
}

impl TagCategory {
    pub fn field(self) -> &'static str {
        match self {
            Self::Requester => "requester",
            Self::Responsible => "responsible",
            Self::Contract => "contract",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMember {
    pub key: String,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RealtimeStatus {
    Connecting,
    Online,
    Offline,
}

pub fn row_from<T: Serialize>(value: &T) -> AppResult<Row> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(AppError::Internal(format!("expected object row, got {}", other))),
    }
}

pub fn parse_row<T: serde::de::DeserializeOwned>(row: &Row) -> AppResult<T> {
    Ok(serde_json::from_value(serde_json::Value::Object(row.clone()))?)
}

pub fn row_id(row: &Row) -> Option<&str> {
    row.get("id").and_then(|value| value.as_str())
}

pub fn row_revision(row: &Row) -> u64 {
    row.get(REVISION_FIELD).and_then(|value| value.as_u64()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn demand_row_parses_store_shape() {
        let row: Row = serde_json::from_value(serde_json::json!({
            "id": "DEM-001",
            "title": "Contract review",
            "status": "IN_PROGRESS",
            "difficulty": "DIFÍCIL",
            "order": 3,
            "accumulated_seconds": 3600,
            "timer_running": true,
            "timer_started_at": "2025-10-10T09:00:00Z",
            "revision": 7
        }))
        .expect("row");

        let parsed: DemandRow = parse_row(&row).expect("parse");
        assert_eq!(parsed.status, DemandStatus::InProgress);
        assert_eq!(parsed.difficulty, Difficulty::Hard);
        assert_eq!(parsed.priority, Priority::Medium);
        let record = parsed.into_record(Vec::new(), BTreeMap::new());
        assert!(record.is_running());
        assert_eq!(record.revision, 7);
    }

    #[test]
    fn running_flag_without_start_time_is_stopped() {
        let row: Row = serde_json::from_value(serde_json::json!({
            "id": "DEM-002",
            "title": "Broken row",
            "timer_running": true
        }))
        .expect("row");
        let record = parse_row::<DemandRow>(&row)
            .expect("parse")
            .into_record(Vec::new(), BTreeMap::new());
        assert!(!record.timer_running);
        assert!(record.timer_started_at.is_none());
    }

    #[test]
    fn elapsed_is_clamped_under_skew() {
        let start = Utc.with_ymd_and_hms(2025, 10, 10, 9, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2025, 10, 10, 8, 59, 0).unwrap();
        assert_eq!(elapsed_seconds(start, earlier), 0);
        assert_eq!(elapsed_seconds(earlier, start), 60);
    }
}
