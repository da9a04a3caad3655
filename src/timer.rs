//! Per-demand work timers.
//!
//! A timer is RUNNING while the demand row carries `timer_started_at` and a
//! `timer_session` token, STOPPED otherwise. Elapsed time is only computed when
//! a session closes, from the store clock, and lands in a time entry whose id
//! is the session token.

use crate::cache::{CacheSnapshot, LocalCache};
use crate::errors::{AppError, AppResult};
use crate::models::{
    elapsed_seconds, parse_row, row_from, Collection, DemandRecord, DemandRow, DemandStatus, Row, TimeEntry,
};
use crate::store::RemoteStore;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use uuid::Uuid;

const MAX_CLOSE_ATTEMPTS: usize = 3;
/// Written with every guarded close: which session was credited, and how much.
const LAST_SESSION: &str = "timer_last_session";
const LAST_SESSION_SECONDS: &str = "timer_last_session_seconds";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerPolicy {
    /// Session-token idempotency plus a guarded RUNNING -> STOPPED transition.
    pub guarded_stop: bool,
    pub suppress_zero_duration_entries: bool,
}

impl Default for TimerPolicy {
    fn default() -> Self {
        Self {
            guarded_stop: true,
            suppress_zero_duration_entries: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSession {
    pub demand_id: String,
    pub session: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClose {
    pub demand_id: String,
    /// Seconds credited to the demand by this close.
    pub elapsed_seconds: u64,
    /// Every entry of the session, oldest first; empty when nothing was recorded.
    pub entries: Vec<TimeEntry>,
    pub accumulated_seconds: u64,
}

#[derive(Debug, Default)]
struct SessionEntries {
    entries: Vec<TimeEntry>,
    inserted: Option<TimeEntry>,
}

impl SessionEntries {
    fn total(&self) -> u64 {
        self.entries.iter().map(|entry| entry.duration_seconds).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountingEvent {
    Started(TimerSession),
    Closed { close: SessionClose, finished: bool },
    Promoted { demand_id: String },
}

#[derive(Clone)]
pub struct TimerManager {
    store: Arc<dyn RemoteStore>,
    cache: LocalCache,
    policy: TimerPolicy,
    focused: Arc<StdMutex<Vec<String>>>,
    events: mpsc::Sender<AccountingEvent>,
}

impl TimerManager {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        cache: LocalCache,
        policy: TimerPolicy,
        events: mpsc::Sender<AccountingEvent>,
    ) -> Self {
        Self {
            store,
            cache,
            policy,
            focused: Arc::new(StdMutex::new(Vec::new())),
            events,
        }
    }

    pub async fn start(&self, demand_id: &str) -> AppResult<TimerSession> {
        let record = self.cached(demand_id)?;
        if record.is_running() {
            return Err(AppError::InvalidState(format!("timer for {} is already running", demand_id)));
        }

        let started_at = self.store.now();
        let session = Uuid::new_v4().to_string();
        if self.policy.guarded_stop {
            // The cache can lag, and rows written before sessions existed run without a token.
            let (current, raw) = self.load_row(demand_id).await?;
            if current.timer_running && current.timer_started_at.is_some() {
                return Err(AppError::InvalidState(format!("timer for {} is already running", demand_id)));
            }
            let mut expected = Row::new();
            expected.insert("timer_session".to_string(), serde_json::Value::Null);
            expected.insert(
                "timer_running".to_string(),
                raw.get("timer_running").cloned().unwrap_or(serde_json::Value::Null),
            );
            let patch = start_patch(&session, started_at, current.status);
            let applied = self
                .store
                .update_where(Collection::Demands, demand_id, expected, patch)
                .await?;
            if applied.is_none() {
                return Err(AppError::Conflict(format!("timer for {} was started elsewhere", demand_id)));
            }
        } else {
            self.store
                .update(Collection::Demands, demand_id, start_patch(&session, started_at, record.status))
                .await?;
        }

        let started = TimerSession {
            demand_id: demand_id.to_string(),
            session,
            started_at,
        };
        tracing::info!(demand_id = %demand_id, session = %started.session, "timer started");
        self.emit(AccountingEvent::Started(started.clone())).await;
        Ok(started)
    }

    pub async fn stop(&self, demand_id: &str) -> AppResult<SessionClose> {
        let close = self.close(demand_id, false).await?;
        self.emit(AccountingEvent::Closed {
            close: close.clone(),
            finished: false,
        })
        .await;
        Ok(close)
    }

    /// Closes a focus session: same accounting as `stop`, tolerated on a
    /// stopped timer, and drops the demand from the focus set.
    pub async fn finish(&self, demand_id: &str) -> AppResult<SessionClose> {
        let close = self.close(demand_id, true).await?;
        self.unfocus(demand_id);
        self.emit(AccountingEvent::Closed {
            close: close.clone(),
            finished: true,
        })
        .await;
        Ok(close)
    }

    /// Starts a stopped timer or stops a running one.
    pub async fn toggle(&self, demand_id: &str) -> AppResult<Option<SessionClose>> {
        if self.cached(demand_id)?.is_running() {
            self.stop(demand_id).await.map(Some)
        } else {
            self.start(demand_id).await.map(|_| None)
        }
    }

    /// Adds a demand to the local focus set, promoting OPEN to IN_PROGRESS.
    pub async fn focus(&self, demand_id: &str) -> AppResult<bool> {
        let record = self.cached(demand_id)?;
        {
            let mut focused = self.focused.lock().map_err(|_| AppError::Internal("focus set poisoned".to_string()))?;
            if focused.iter().any(|id| id == demand_id) {
                return Ok(false);
            }
            focused.push(demand_id.to_string());
        }
        if record.status == DemandStatus::Open {
            let mut patch = Row::new();
            patch.insert("status".to_string(), json!(DemandStatus::InProgress));
            self.store.update(Collection::Demands, demand_id, patch).await?;
            self.emit(AccountingEvent::Promoted {
                demand_id: demand_id.to_string(),
            })
            .await;
        }
        Ok(true)
    }

    pub fn unfocus(&self, demand_id: &str) -> bool {
        match self.focused.lock() {
            Ok(mut focused) => {
                let before = focused.len();
                focused.retain(|id| id != demand_id);
                before != focused.len()
            }
            Err(_) => false,
        }
    }

    pub fn focused_ids(&self) -> Vec<String> {
        self.focused.lock().map(|focused| focused.clone()).unwrap_or_default()
    }

    /// Focused demands plus every demand with a running timer.
    pub fn focused_demands(&self, snapshot: &CacheSnapshot) -> Vec<DemandRecord> {
        let focused = self.focused_ids();
        snapshot
            .demands
            .iter()
            .filter(|demand| demand.is_running() || focused.iter().any(|id| *id == demand.id))
            .cloned()
            .collect()
    }

    async fn close(&self, demand_id: &str, finishing: bool) -> AppResult<SessionClose> {
        if self.policy.guarded_stop {
            self.close_guarded(demand_id, finishing).await
        } else {
            self.close_unguarded(demand_id, finishing).await
        }
    }

    async fn close_guarded(&self, demand_id: &str, finishing: bool) -> AppResult<SessionClose> {
        let (mut current, mut raw) = self.load_row(demand_id).await?;
        let (Some(started_at), true) = (current.timer_started_at, current.timer_running) else {
            return self.not_running(current, finishing).await;
        };
        let session = current
            .timer_session
            .clone()
            .unwrap_or_else(|| legacy_session_key(demand_id, started_at));
        let now = self.store.now();
        let elapsed = elapsed_seconds(started_at, now);

        let recorded = self.record_session(&session, demand_id, elapsed, now).await?;
        let credited = recorded.total();

        for _ in 0..MAX_CLOSE_ATTEMPTS {
            let mut expected = Row::new();
            expected.insert("timer_session".to_string(), json!(current.timer_session));
            expected.insert(
                "accumulated_seconds".to_string(),
                raw.get("accumulated_seconds").cloned().unwrap_or(serde_json::Value::Null),
            );
            let accumulated = current.accumulated_seconds.saturating_add(credited);
            let mut patch = cleared_timer_patch();
            patch.insert("accumulated_seconds".to_string(), accumulated.into());
            patch.insert(LAST_SESSION.to_string(), session.clone().into());
            patch.insert(LAST_SESSION_SECONDS.to_string(), credited.into());

            let applied = self
                .store
                .update_where(Collection::Demands, demand_id, expected, patch)
                .await
                .map_err(|error| uncredited(demand_id, credited, &error))?;
            if applied.is_some() {
                tracing::info!(demand_id = %demand_id, elapsed, credited, accumulated, "timer session closed");
                return Ok(SessionClose {
                    demand_id: demand_id.to_string(),
                    elapsed_seconds: credited,
                    entries: recorded.entries,
                    accumulated_seconds: accumulated,
                });
            }

            (current, raw) = self
                .load_row(demand_id)
                .await
                .map_err(|error| uncredited(demand_id, credited, &error))?;
            if current.timer_session.as_deref() != Some(session.as_str()) && current.timer_started_at != Some(started_at) {
                tracing::warn!(demand_id = %demand_id, session = %session, "session already closed by another client");
                if let Some(ours) = &recorded.inserted {
                    self.withdraw_uncredited(&raw, &session, ours).await;
                }
                return Err(AppError::Conflict(format!("timer session for {} was already closed", demand_id)));
            }
        }
        Err(AppError::AccountingLoss {
            demand_id: demand_id.to_string(),
            elapsed_seconds: credited,
            reason: "timer kept changing while it was being stopped; stop again to settle".to_string(),
        })
    }

    /// Stop sequence without idempotency or guards: read the cached record,
    /// append an entry under a fresh id, then overwrite the totals.
    async fn close_unguarded(&self, demand_id: &str, finishing: bool) -> AppResult<SessionClose> {
        let record = self.cached(demand_id)?;
        let Some(started_at) = record.timer_started_at.filter(|_| record.timer_running) else {
            if finishing {
                return Ok(SessionClose {
                    demand_id: demand_id.to_string(),
                    elapsed_seconds: 0,
                    entries: Vec::new(),
                    accumulated_seconds: record.accumulated_seconds,
                });
            }
            return Err(AppError::InvalidState(format!("timer for {} is not running", demand_id)));
        };
        let now = self.store.now();
        let elapsed = elapsed_seconds(started_at, now);
        let mut entries = Vec::new();
        if elapsed > 0 || !self.policy.suppress_zero_duration_entries {
            let entry = self
                .insert_entry(&Uuid::new_v4().to_string(), demand_id, elapsed, now)
                .await
                .map_err(|error| unrecorded(demand_id, elapsed, error))?;
            entries.push(entry);
        }
        let accumulated = record.accumulated_seconds.saturating_add(elapsed);
        let mut patch = cleared_timer_patch();
        patch.insert("accumulated_seconds".to_string(), accumulated.into());
        self.store.update(Collection::Demands, demand_id, patch).await?;
        Ok(SessionClose {
            demand_id: demand_id.to_string(),
            elapsed_seconds: elapsed,
            entries,
            accumulated_seconds: accumulated,
        })
    }

    async fn not_running(&self, current: DemandRow, finishing: bool) -> AppResult<SessionClose> {
        if !finishing {
            return Err(AppError::InvalidState(format!("timer for {} is not running", current.id)));
        }
        if current.timer_running || current.timer_session.is_some() {
            // Half-written row: clear it without crediting anything.
            self.store
                .update(Collection::Demands, &current.id, cleared_timer_patch())
                .await?;
        }
        Ok(SessionClose {
            demand_id: current.id,
            elapsed_seconds: 0,
            entries: Vec::new(),
            accumulated_seconds: current.accumulated_seconds,
        })
    }

    /// Makes the session's entries add up to `elapsed`.
    ///
    /// The first entry's id is the session token; a stop retried after the
    /// entry landed appends `<session>#<n>` for the time since. Concurrent
    /// stoppers collide on the same id and reuse what the winner stored.
    async fn record_session(
        &self,
        session: &str,
        demand_id: &str,
        elapsed: u64,
        now: DateTime<Utc>,
    ) -> AppResult<SessionEntries> {
        for _ in 0..MAX_CLOSE_ATTEMPTS {
            let mut entries = self.session_entries(session).await?;
            let recorded: u64 = entries.iter().map(|entry| entry.duration_seconds).sum();
            if entries.is_empty() && elapsed == 0 && self.policy.suppress_zero_duration_entries {
                return Ok(SessionEntries::default());
            }
            if !entries.is_empty() && elapsed <= recorded {
                return Ok(SessionEntries { entries, inserted: None });
            }

            let entry_id = if entries.is_empty() {
                session.to_string()
            } else {
                format!("{}#{}", session, entries.len() + 1)
            };
            match self.insert_entry(&entry_id, demand_id, elapsed - recorded, now).await {
                Ok(entry) => {
                    entries.push(entry.clone());
                    return Ok(SessionEntries {
                        entries,
                        inserted: Some(entry),
                    });
                }
                Err(AppError::Conflict(_)) => continue,
                Err(error) => return Err(unrecorded(demand_id, elapsed - recorded, error)),
            }
        }
        Err(AppError::Conflict(format!("time entries for {} kept changing", demand_id)))
    }

    async fn session_entries(&self, session: &str) -> AppResult<Vec<TimeEntry>> {
        let segment_prefix = format!("{}#", session);
        Ok(self
            .store
            .fetch_all(Collection::TimeEntries)
            .await?
            .iter()
            .filter_map(|row| parse_row::<TimeEntry>(row).ok())
            .filter(|entry| entry.id == session || entry.id.starts_with(&segment_prefix))
            .collect())
    }

    /// Deletes our segment when the client that closed the session credited
    /// everything except it.
    async fn withdraw_uncredited(&self, closed_row: &Row, session: &str, ours: &TimeEntry) {
        if closed_row.get(LAST_SESSION).and_then(|value| value.as_str()) != Some(session) {
            return;
        }
        let Some(credited) = closed_row.get(LAST_SESSION_SECONDS).and_then(|value| value.as_u64()) else {
            return;
        };
        let total: u64 = match self.session_entries(session).await {
            Ok(entries) => entries.iter().map(|entry| entry.duration_seconds).sum(),
            Err(error) => {
                tracing::warn!(entry_id = %ours.id, error = %error, "could not check late time entry");
                return;
            }
        };
        if credited.saturating_add(ours.duration_seconds) != total {
            return;
        }
        match self.store.delete(Collection::TimeEntries, &ours.id).await {
            Ok(()) => tracing::info!(entry_id = %ours.id, "withdrew time entry the closing client never credited"),
            Err(error) => tracing::warn!(entry_id = %ours.id, error = %error, "late time entry left uncredited"),
        }
    }

    async fn insert_entry(
        &self,
        entry_id: &str,
        demand_id: &str,
        seconds: u64,
        now: DateTime<Utc>,
    ) -> AppResult<TimeEntry> {
        let entry = TimeEntry {
            id: entry_id.to_string(),
            demand_id: demand_id.to_string(),
            duration_seconds: seconds,
            date: now.date_naive(),
            revision: 0,
        };
        let mut row = row_from(&entry)?;
        row.remove("revision");
        let stored = self.store.insert(Collection::TimeEntries, row).await?;
        parse_row(&stored)
    }

    /// Fresh store read of one demand, parsed and raw.
    async fn load_row(&self, demand_id: &str) -> AppResult<(DemandRow, Row)> {
        self.store
            .fetch_all(Collection::Demands)
            .await?
            .into_iter()
            .find_map(|row| {
                let parsed = parse_row::<DemandRow>(&row).ok()?;
                (parsed.id == demand_id).then_some((parsed, row))
            })
            .ok_or_else(|| AppError::NotFound(format!("demand {}", demand_id)))
    }

    fn cached(&self, demand_id: &str) -> AppResult<DemandRecord> {
        self.cache
            .snapshot()
            .demand(demand_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("demand {}", demand_id)))
    }

    async fn emit(&self, event: AccountingEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("accounting channel closed; event dropped");
        }
    }
}

fn start_patch(session: &str, started_at: DateTime<Utc>, status: DemandStatus) -> Row {
    let mut patch = Row::new();
    patch.insert("timer_running".to_string(), true.into());
    patch.insert("timer_started_at".to_string(), json!(started_at));
    patch.insert("timer_session".to_string(), session.into());
    if status == DemandStatus::Open {
        patch.insert("status".to_string(), json!(DemandStatus::InProgress));
    }
    patch
}

fn cleared_timer_patch() -> Row {
    let mut patch = Row::new();
    patch.insert("timer_running".to_string(), false.into());
    patch.insert("timer_started_at".to_string(), serde_json::Value::Null);
    patch.insert("timer_session".to_string(), serde_json::Value::Null);
    patch
}

fn unrecorded(demand_id: &str, seconds: u64, error: AppError) -> AppError {
    tracing::warn!(demand_id = %demand_id, seconds, error = %error, "time entry insert failed");
    AppError::AccountingLoss {
        demand_id: demand_id.to_string(),
        elapsed_seconds: seconds,
        reason: error.to_string(),
    }
}

/// The entries are stored but the demand total was not updated.
fn uncredited(demand_id: &str, seconds: u64, error: &AppError) -> AppError {
    tracing::warn!(demand_id = %demand_id, seconds, error = %error, "session recorded but not credited");
    AppError::AccountingLoss {
        demand_id: demand_id.to_string(),
        elapsed_seconds: seconds,
        reason: format!("{}; stop again to settle", error),
    }
}

/// Rows started before session tokens existed are keyed by their start time.
fn legacy_session_key(demand_id: &str, started_at: DateTime<Utc>) -> String {
    format!("{}@{}", demand_id, started_at.timestamp())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayTick {
    pub demand_id: String,
    pub elapsed_seconds: u64,
}

/// Read-only clock for the running-session counters shown in the UI.
#[derive(Clone)]
pub struct DisplayTicker {
    store: Arc<dyn RemoteStore>,
    cache: LocalCache,
}

impl DisplayTicker {
    pub fn new(store: Arc<dyn RemoteStore>, cache: LocalCache) -> Self {
        Self { store, cache }
    }

    pub fn tick(&self) -> Vec<DisplayTick> {
        let now = self.store.now();
        self.cache
            .snapshot()
            .running()
            .map(|demand| DisplayTick {
                demand_id: demand.id.clone(),
                elapsed_seconds: demand.running_elapsed(now),
            })
            .collect()
    }

    pub fn spawn(self, period: Duration) -> (JoinHandle<()>, mpsc::Receiver<Vec<DisplayTick>>) {
        let (sender, receiver) = mpsc::channel(8);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if sender.send(self.tick()).await.is_err() {
                    break;
                }
            }
        });
        (handle, receiver)
    }
}
