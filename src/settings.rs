use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const STRATEGY_ENV: &str = "DEMAND_SYNC_STRATEGY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcileStrategy {
    /// Reload every demand collection on each notification.
    Full,
    /// Patch the notified row when the event carries one.
    Incremental,
}

impl ReconcileStrategy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "full" => Some(Self::Full),
            "incremental" => Some(Self::Incremental),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    pub reconcile_strategy: ReconcileStrategy,
    pub guarded_stop: bool,
    pub suppress_zero_duration_entries: bool,
    pub display_tick_ms: u64,
    pub presence_heartbeat_ms: u64,
    pub presence_timeout_ms: u64,
    pub notice_capacity: usize,
    pub change_channel_capacity: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            reconcile_strategy: ReconcileStrategy::Incremental,
            guarded_stop: true,
            suppress_zero_duration_entries: false,
            display_tick_ms: 1_000,
            presence_heartbeat_ms: 15_000,
            presence_timeout_ms: 45_000,
            notice_capacity: 64,
            change_channel_capacity: 1_024,
        }
    }
}

impl SyncSettings {
    /// Reads settings from a YAML file; missing keys keep their defaults.
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut settings: SyncSettings = serde_yaml::from_str(&raw)?;
        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_env() -> Self {
        let mut settings = Self::default();
        settings.apply_env();
        settings
    }

    /// Merges a JSON patch over the current values.
    pub fn apply_overrides(&self, update: serde_json::Value) -> AppResult<Self> {
        let mut merged = serde_json::to_value(self)?;
        merge_json(&mut merged, update);
        let settings: SyncSettings = serde_json::from_value(merged)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn display_tick(&self) -> Duration {
        Duration::from_millis(self.display_tick_ms)
    }

    pub fn presence_heartbeat(&self) -> Duration {
        Duration::from_millis(self.presence_heartbeat_ms)
    }

    pub fn presence_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.presence_timeout_ms).unwrap_or(i64::MAX))
    }

    fn apply_env(&mut self) {
        if let Ok(raw) = std::env::var(STRATEGY_ENV) {
            match ReconcileStrategy::parse(&raw) {
                Some(strategy) => self.reconcile_strategy = strategy,
                None => tracing::warn!(value = %raw, "ignoring unknown reconcile strategy override"),
            }
        }
    }

    fn validate(&self) -> AppResult<()> {
        if self.display_tick_ms == 0 || self.presence_heartbeat_ms == 0 {
            return Err(AppError::Internal("tick and heartbeat intervals must be positive".to_string()));
        }
        if self.presence_timeout_ms <= self.presence_heartbeat_ms {
            return Err(AppError::Internal(
                "presenceTimeoutMs must exceed presenceHeartbeatMs".to_string(),
            ));
        }
        if self.notice_capacity == 0 || self.change_channel_capacity == 0 {
            return Err(AppError::Internal("channel capacities must be positive".to_string()));
        }
        Ok(())
    }
}

pub(crate) fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ReconcileStrategy, SyncSettings};
    use std::io::Write;

    #[test]
    fn yaml_file_overrides_only_listed_keys() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "guardedStop: false\ndisplayTickMs: 250").expect("write");

        let settings = SyncSettings::load(file.path()).expect("load");
        assert!(!settings.guarded_stop);
        assert_eq!(settings.display_tick_ms, 250);
        assert_eq!(settings.presence_timeout_ms, 45_000);
    }

    #[test]
    fn json_overrides_merge_and_validate() {
        let settings = SyncSettings::default()
            .apply_overrides(serde_json::json!({ "reconcileStrategy": "full" }))
            .expect("merge");
        assert_eq!(settings.reconcile_strategy, ReconcileStrategy::Full);

        let err = SyncSettings::default()
            .apply_overrides(serde_json::json!({ "presenceTimeoutMs": 10 }))
            .expect_err("timeout below heartbeat");
        assert!(err.to_string().contains("presenceTimeoutMs"));
    }
}
