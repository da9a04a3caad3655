//! One connected client: local cache, reconciliation loop, timers and the
//! write operations issued from the dashboard views.

use crate::cache::{CacheSnapshot, LocalCache};
use crate::errors::{AppError, AppResult};
use crate::models::{
    row_from, Collection, DemandDraft, DemandRecord, DemandStatus, RealtimeStatus, Row, SubActivity, SubActivityRow,
    TagCategory, REVISION_FIELD,
};
use crate::notify::{Notice, Notifier, SyncFault};
use crate::order::{next_order, plan_reorder, OrderUpdate};
use crate::presence::{PresenceHub, PresenceSession};
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crate::settings::SyncSettings;
use crate::store::{FieldMatch, RemoteStore};
use crate::timer::{AccountingEvent, DisplayTick, DisplayTicker, SessionClose, TimerManager, TimerPolicy, TimerSession};
use crate::view::{next_demand_id, TagOptions, ViewFilter};
use serde_json::json;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

const ACCOUNTING_CHANNEL_CAPACITY: usize = 256;
const CREATE_ATTEMPTS: usize = 3;

pub struct DemandClient {
    store: Arc<dyn RemoteStore>,
    reconciler: Reconciler,
    timers: TimerManager,
    notifier: Notifier,
    settings: SyncSettings,
    status: Arc<watch::Sender<RealtimeStatus>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl DemandClient {
    /// Subscribes to the change feed, loads the initial snapshot and starts
    /// the sync loop.
    pub async fn connect(store: Arc<dyn RemoteStore>, settings: SyncSettings) -> Arc<Self> {
        let cache = LocalCache::new();
        let notifier = Notifier::new(settings.notice_capacity);
        let reconciler = Reconciler::new(store.clone(), cache.clone(), notifier.clone(), settings.reconcile_strategy);
        let (events, accounting) = mpsc::channel(ACCOUNTING_CHANNEL_CAPACITY);
        let policy = TimerPolicy {
            guarded_stop: settings.guarded_stop,
            suppress_zero_duration_entries: settings.suppress_zero_duration_entries,
        };
        let timers = TimerManager::new(store.clone(), cache, policy, events);
        let (status, _) = watch::channel(RealtimeStatus::Connecting);

        let client = Arc::new(Self {
            store: store.clone(),
            reconciler,
            timers,
            notifier,
            settings,
            status: Arc::new(status),
            tasks: StdMutex::new(Vec::new()),
        });

        // Subscribe before the first pull so nothing written in between is missed.
        let subscription = store.subscribe_to_changes(&Collection::DEMAND_STATE);
        let loaded = client.reconciler.refresh().await;
        client.status.send_replace(if loaded == ReconcileOutcome::Failed {
            RealtimeStatus::Offline
        } else {
            RealtimeStatus::Online
        });

        let reconciler = client.reconciler.clone();
        let status = client.status.clone();
        let handle = tokio::spawn(sync_loop(reconciler, subscription, accounting, status));
        client.track_task(handle);
        client
    }

    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.reconciler.cache().snapshot()
    }

    pub fn cache(&self) -> &LocalCache {
        self.reconciler.cache()
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notifier.subscribe()
    }

    pub fn notice_history(&self) -> Vec<Notice> {
        self.notifier.history()
    }

    pub fn realtime_status(&self) -> RealtimeStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<RealtimeStatus> {
        self.status.subscribe()
    }

    pub fn visible(&self, filter: &ViewFilter) -> Vec<DemandRecord> {
        filter.apply(&self.snapshot().demands)
    }

    pub fn tag_options(&self) -> TagOptions {
        TagOptions::collect(&self.snapshot().demands)
    }

    pub fn next_demand_id(&self) -> AppResult<String> {
        next_demand_id(&self.snapshot().demands)
    }

    pub fn focused_demands(&self) -> Vec<DemandRecord> {
        self.timers.focused_demands(&self.snapshot())
    }

    /// Pulls everything now; failures surface as notices.
    pub async fn refresh(&self) -> ReconcileOutcome {
        self.reconciler.refresh().await
    }

    pub async fn create_demand(&self, draft: DemandDraft) -> AppResult<DemandRecord> {
        let result = self.insert_demand(&draft).await;
        let id = self.settle("create demand", result).await?;
        self.notifier.success(format!("{} created", id));
        self.cached(&id)
    }

    async fn insert_demand(&self, draft: &DemandDraft) -> AppResult<String> {
        let mut last_error = None;
        for _ in 0..CREATE_ATTEMPTS {
            let snapshot = self.snapshot();
            let id = next_demand_id(&snapshot.demands)?;
            let mut row = draft.to_patch()?;
            row.insert("id".to_string(), id.clone().into());
            row.insert("order".to_string(), next_order(snapshot.len()).into());
            row.insert(
                "accumulated_seconds".to_string(),
                draft.accumulated_seconds.unwrap_or(0).into(),
            );
            row.insert("timer_running".to_string(), false.into());
            row.insert("timer_started_at".to_string(), serde_json::Value::Null);
            row.insert("timer_session".to_string(), serde_json::Value::Null);

            match self.store.insert(Collection::Demands, row).await {
                Ok(_) => return Ok(id),
                Err(AppError::Conflict(message)) => {
                    // Another client took this id; reload and pick the next one.
                    tracing::info!(demand_id = %id, "demand id taken; retrying");
                    self.reconciler.pull_all().await?;
                    last_error = Some(AppError::Conflict(message));
                }
                Err(error) => return Err(error),
            }
        }
        Err(last_error.unwrap_or_else(|| AppError::Internal("demand insert gave up".to_string())))
    }

    /// Overwrites the editable fields. Concurrent edits are last-write-wins;
    /// overwriting a newer revision raises a stale-write notice.
    pub async fn update_demand(&self, id: &str, draft: DemandDraft) -> AppResult<DemandRecord> {
        let result = self.overwrite_demand(id, &draft).await;
        self.settle("update demand", result).await?;
        self.cached(id)
    }

    async fn overwrite_demand(&self, id: &str, draft: &DemandDraft) -> AppResult<()> {
        let base = self.cached(id)?;
        let patch = draft.to_patch()?;
        let mut expected = Row::new();
        expected.insert(REVISION_FIELD.to_string(), base.revision.into());
        let applied = self
            .store
            .update_where(Collection::Demands, id, expected, patch.clone())
            .await?;
        if applied.is_none() {
            tracing::warn!(demand_id = %id, base_revision = base.revision, "overwriting a newer revision");
            self.notifier.fault(
                SyncFault::StaleWriteLoss,
                format!("{} was changed by someone else; their edit was overwritten", id),
            );
            self.store.update(Collection::Demands, id, patch).await?;
        }
        Ok(())
    }

    /// Deletes the demand together with its sub-activities and time entries.
    pub async fn delete_demand(&self, id: &str) -> AppResult<()> {
        let result = async {
            self.store
                .delete_matching(Collection::SubActivities, FieldMatch::new("demand_id", id))
                .await?;
            self.store
                .delete_matching(Collection::TimeEntries, FieldMatch::new("demand_id", id))
                .await?;
            self.store.delete(Collection::Demands, id).await
        }
        .await;
        self.settle("delete demand", result).await?;
        self.timers.unfocus(id);
        self.notifier.info(format!("{} deleted", id));
        Ok(())
    }

    /// Marks a demand COMPLETED, closing its running session first.
    pub async fn complete_demand(&self, id: &str) -> AppResult<DemandRecord> {
        if self.cached(id)?.is_running() {
            self.stop_timer(id).await?;
        }
        let result = self.write_status(id, DemandStatus::Completed).await;
        self.settle("complete demand", result).await?;
        self.timers.unfocus(id);
        self.notifier.success(format!("{} completed", id));
        self.cached(id)
    }

    /// Replaces the checklist and moves the status along with it: all items
    /// done completes the demand, an open item reopens a completed one.
    pub async fn set_sub_activities(&self, id: &str, subs: Vec<SubActivity>) -> AppResult<DemandRecord> {
        let result = self.replace_sub_activities(id, &subs).await;
        self.settle("update checklist", result).await?;
        self.cached(id)
    }

    async fn replace_sub_activities(&self, id: &str, subs: &[SubActivity]) -> AppResult<()> {
        let record = self.cached(id)?;
        self.store
            .delete_matching(Collection::SubActivities, FieldMatch::new("demand_id", id))
            .await?;
        for (position, sub) in subs.iter().enumerate() {
            let row = row_from(&SubActivityRow {
                id: sub.id.clone(),
                demand_id: id.to_string(),
                title: sub.title.clone(),
                completed: sub.completed,
                position: i64::try_from(position).unwrap_or(i64::MAX),
            })?;
            self.store.insert(Collection::SubActivities, row).await?;
        }

        let all_done = !subs.is_empty() && subs.iter().all(|sub| sub.completed);
        let next_status = if all_done {
            DemandStatus::Completed
        } else if record.status == DemandStatus::Completed && subs.iter().any(|sub| !sub.completed) {
            DemandStatus::InProgress
        } else {
            record.status
        };
        if next_status != record.status {
            self.write_status(id, next_status).await?;
        }
        Ok(())
    }

    /// Renames a label on every demand that is not completed.
    pub async fn rename_tag(&self, category: TagCategory, from: &str, to: &str) -> AppResult<u64> {
        let mut patch = Row::new();
        patch.insert(category.field().to_string(), to.into());
        let result = self.retag(category, from, patch).await;
        self.settle("rename tag", result).await
    }

    /// Clears a label from every demand that is not completed.
    pub async fn delete_tag(&self, category: TagCategory, name: &str) -> AppResult<u64> {
        let mut patch = Row::new();
        patch.insert(category.field().to_string(), serde_json::Value::Null);
        let result = self.retag(category, name, patch).await;
        self.settle("delete tag", result).await
    }

    async fn retag(&self, category: TagCategory, name: &str, patch: Row) -> AppResult<u64> {
        let touched = self
            .store
            .update_matching(
                Collection::Demands,
                FieldMatch::new(category.field(), name),
                Some(FieldMatch::new("status", DemandStatus::Completed.as_str())),
                patch,
            )
            .await?;
        tracing::info!(field = category.field(), name = %name, touched, "tag updated");
        Ok(touched)
    }

    /// Drag within one view: `dragged` lands right before `target` and the
    /// visible subset is renumbered from zero.
    pub async fn reorder(&self, dragged: &str, target: &str, visible: &[DemandRecord]) -> AppResult<Vec<OrderUpdate>> {
        let Some(updates) = plan_reorder(visible, dragged, target) else {
            return Ok(Vec::new());
        };
        let result = self.write_orders(&updates, None).await;
        self.settle("reorder", result).await?;
        Ok(updates)
    }

    /// Drop onto a board column. Without a target only the status changes;
    /// with one, the column is renumbered as in `reorder`.
    pub async fn move_demand(
        &self,
        id: &str,
        status: DemandStatus,
        target: Option<&str>,
        visible: &[DemandRecord],
    ) -> AppResult<Vec<OrderUpdate>> {
        let record = self.cached(id)?;
        let Some(target) = target else {
            if record.status != status {
                let result = self.write_status(id, status).await;
                self.settle("move demand", result).await?;
            }
            return Ok(Vec::new());
        };

        let mut column = visible.iter().filter(|r| r.id != id).cloned().collect::<Vec<_>>();
        column.push(DemandRecord { status, ..record });
        let updates = plan_reorder(&column, id, target).unwrap_or_default();
        let result = self.write_orders(&updates, Some((id, status))).await;
        self.settle("move demand", result).await?;
        Ok(updates)
    }

    async fn write_orders(&self, updates: &[OrderUpdate], moved: Option<(&str, DemandStatus)>) -> AppResult<()> {
        let mut status_written = false;
        for update in updates {
            let mut patch = Row::new();
            patch.insert("order".to_string(), update.order.into());
            if let Some((id, status)) = moved.filter(|(id, _)| *id == update.id) {
                patch.insert("status".to_string(), json!(status));
                status_written = true;
                tracing::debug!(demand_id = %id, "status written with new position");
            }
            self.store.update(Collection::Demands, &update.id, patch).await?;
        }
        if let Some((id, status)) = moved.filter(|_| !status_written) {
            self.write_status(id, status).await?;
        }
        Ok(())
    }

    async fn write_status(&self, id: &str, status: DemandStatus) -> AppResult<()> {
        let mut patch = Row::new();
        patch.insert("status".to_string(), json!(status));
        self.store.update(Collection::Demands, id, patch).await?;
        Ok(())
    }

    pub async fn start_timer(&self, id: &str) -> AppResult<TimerSession> {
        let result = self.timers.start(id).await;
        self.settle("start timer", result).await
    }

    pub async fn stop_timer(&self, id: &str) -> AppResult<SessionClose> {
        let result = self.timers.stop(id).await;
        self.settle("stop timer", result).await
    }

    pub async fn toggle_timer(&self, id: &str) -> AppResult<Option<SessionClose>> {
        let result = self.timers.toggle(id).await;
        self.settle("toggle timer", result).await
    }

    pub async fn finish_session(&self, id: &str) -> AppResult<SessionClose> {
        let result = self.timers.finish(id).await;
        self.settle("finish session", result).await
    }

    pub async fn focus(&self, id: &str) -> AppResult<bool> {
        let result = self.timers.focus(id).await;
        self.settle("focus demand", result).await
    }

    pub fn unfocus(&self, id: &str) -> bool {
        self.timers.unfocus(id)
    }

    /// Joins the roster and keeps the membership alive in the background.
    /// Tracks `key` on `hub`, heartbeats it, and sweeps the hub for members
    /// that stopped heartbeating until this client shuts down.
    pub fn join_presence(&self, hub: &PresenceHub, key: &str) -> PresenceSession {
        let mut session = hub.track(key);
        session.spawn_heartbeat(self.settings.presence_heartbeat());
        self.track_task(hub.spawn_sweeper(self.settings.presence_heartbeat()));
        session
    }

    pub fn display_ticker(&self) -> DisplayTicker {
        DisplayTicker::new(self.store.clone(), self.cache().clone())
    }

    pub fn spawn_display_ticks(&self) -> mpsc::Receiver<Vec<DisplayTick>> {
        let (handle, ticks) = self.display_ticker().spawn(self.settings.display_tick());
        self.track_task(handle);
        ticks
    }

    /// Stops the background tasks; the cache keeps its last snapshot.
    pub fn shutdown(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.status.send_replace(RealtimeStatus::Offline);
    }

    /// Refreshes after a write attempt and turns a failure into a notice.
    async fn settle<T>(&self, action: &str, result: AppResult<T>) -> AppResult<T> {
        self.reconciler.refresh().await;
        if let Err(error) = &result {
            tracing::warn!(action, error = %error, "client operation failed");
            match error {
                AppError::AccountingLoss { .. } => {
                    self.notifier.fault(SyncFault::AccountingLossRisk, error.to_string());
                }
                error if error.is_transient() => {
                    self.notifier.fault(SyncFault::TransientNetwork, format!("{} failed: {}", action, error));
                }
                error => {
                    self.notifier.error(format!("{} failed: {}", action, error));
                }
            }
        }
        result
    }

    fn cached(&self, id: &str) -> AppResult<DemandRecord> {
        self.snapshot()
            .demand(id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("demand {}", id)))
    }

    fn track_task(&self, handle: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(_) => handle.abort(),
        }
    }
}

impl Drop for DemandClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn sync_loop(
    reconciler: Reconciler,
    mut subscription: crate::store::ChangeSubscription,
    mut accounting: mpsc::Receiver<AccountingEvent>,
    status: Arc<watch::Sender<RealtimeStatus>>,
) {
    loop {
        tokio::select! {
            change = subscription.recv() => {
                let Some(change) = change else {
                    tracing::warn!("change feed closed");
                    status.send_replace(RealtimeStatus::Offline);
                    break;
                };
                let outcome = reconciler.on_change_notification(change).await;
                let next = if outcome == ReconcileOutcome::Failed {
                    RealtimeStatus::Offline
                } else {
                    RealtimeStatus::Online
                };
                status.send_if_modified(|current| {
                    let changed = *current != next;
                    *current = next;
                    changed
                });
            }
            Some(event) = accounting.recv() => {
                if let AccountingEvent::Closed { close, .. } = &event {
                    tracing::info!(
                        demand_id = %close.demand_id,
                        elapsed = close.elapsed_seconds,
                        accumulated = close.accumulated_seconds,
                        "session accounted"
                    );
                }
                reconciler.refresh().await;
            }
        }
    }
}
