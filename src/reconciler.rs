//! Keeps the local cache in line with the remote store.
//!
//! Two entry points feed it: change notifications from the store and the
//! refresh issued after every local write. Both end in an atomic snapshot swap.

use crate::aggregator::{aggregate, daily_logs_by_demand};
use crate::cache::{CacheSnapshot, LocalCache};
use crate::errors::AppResult;
use crate::models::{
    parse_row, Collection, DemandRecord, DemandRow, Row, SubActivity, SubActivityRow, TimeEntry,
};
use crate::notify::{Notifier, SyncFault};
use crate::order::{detect_drift, sort_by_order, OrderTie};
use crate::settings::ReconcileStrategy;
use crate::store::{ChangeEvent, ChangeKind, RemoteStore};
use chrono::Utc;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The whole cache was rebuilt from a fresh pull.
    Reloaded,
    /// A single row was patched in place.
    Patched,
    /// The event was a duplicate or older than what the cache holds.
    Ignored,
    /// The pull failed; the previous snapshot is still in place.
    Failed,
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn RemoteStore>,
    cache: LocalCache,
    notifier: Notifier,
    strategy: ReconcileStrategy,
    swap_lock: Arc<Mutex<()>>,
    last_drift: Arc<StdMutex<Vec<OrderTie>>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        cache: LocalCache,
        notifier: Notifier,
        strategy: ReconcileStrategy,
    ) -> Self {
        Self {
            store,
            cache,
            notifier,
            strategy,
            swap_lock: Arc::new(Mutex::new(())),
            last_drift: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    /// Pulls every demand-bound collection and swaps the cache.
    pub async fn pull_all(&self) -> AppResult<Arc<CacheSnapshot>> {
        let _guard = self.swap_lock.lock().await;
        let demand_rows = self.store.fetch_all(Collection::Demands).await?;
        let sub_rows = self.store.fetch_all(Collection::SubActivities).await?;
        let entry_rows = self.store.fetch_all(Collection::TimeEntries).await?;

        let previous = self.cache.snapshot();
        let mut next = build_snapshot(&demand_rows, &sub_rows, &entry_rows);
        // Tombstones outlive full pulls so a late stale event cannot resurrect a row.
        next.tombstones = previous
            .tombstones
            .iter()
            .filter(|(id, _)| next.demand(id).is_none())
            .map(|(id, revision)| (id.clone(), *revision))
            .collect();
        let swapped = self.cache.replace(next);
        tracing::debug!(
            generation = swapped.generation,
            demands = swapped.demands.len(),
            entries = swapped.time_entries.len(),
            "local cache reloaded"
        );
        self.check_drift(&swapped);
        Ok(swapped)
    }

    /// Pull that reports failure as a transient notice instead of an error.
    pub async fn refresh(&self) -> ReconcileOutcome {
        match self.pull_all().await {
            Ok(_) => ReconcileOutcome::Reloaded,
            Err(error) => {
                tracing::warn!(error = %error, "reconciliation pull failed; keeping previous snapshot");
                self.notifier
                    .fault(SyncFault::TransientNetwork, format!("Sync failed: {}", error));
                ReconcileOutcome::Failed
            }
        }
    }

    pub async fn on_change_notification(&self, event: ChangeEvent) -> ReconcileOutcome {
        if self.strategy == ReconcileStrategy::Full {
            return self.refresh().await;
        }
        let outcome = {
            let _guard = self.swap_lock.lock().await;
            self.apply_incremental(&event)
        };
        match outcome {
            Some(outcome) => outcome,
            None => self.refresh().await,
        }
    }

    /// Patches one row. `None` means the event cannot be applied on its own.
    fn apply_incremental(&self, event: &ChangeEvent) -> Option<ReconcileOutcome> {
        let current = self.cache.snapshot();
        let mut next = (*current).clone();
        let changed = match (event.collection, event.kind) {
            (Collection::Demands, ChangeKind::Delete) => remove_demand(&mut next, event.id.as_deref()?, event.revision),
            (Collection::Demands, _) => upsert_demand(&mut next, event.row.as_ref()?)?,
            (Collection::TimeEntries, ChangeKind::Delete) => remove_entry(&mut next, event.id.as_deref()?),
            (Collection::TimeEntries, _) => upsert_entry(&mut next, event.row.as_ref()?)?,
            (Collection::SubActivities, _) => return None,
        };
        if !changed {
            return Some(ReconcileOutcome::Ignored);
        }
        next.refreshed_at = Some(Utc::now());
        let swapped = self.cache.replace(next);
        tracing::debug!(
            generation = swapped.generation,
            collection = event.collection.as_str(),
            id = ?event.id,
            "local cache patched"
        );
        self.check_drift(&swapped);
        Some(ReconcileOutcome::Patched)
    }

    fn check_drift(&self, snapshot: &CacheSnapshot) {
        let ties = detect_drift(&snapshot.demands);
        let Ok(mut last) = self.last_drift.lock() else {
            return;
        };
        if *last == ties {
            return;
        }
        if !ties.is_empty() {
            let ids = ties
                .iter()
                .map(|tie| format!("{}: {}", tie.order, tie.ids.join(", ")))
                .collect::<Vec<_>>()
                .join("; ");
            tracing::warn!(ties = %ids, "duplicate order values detected");
            self.notifier
                .fault(SyncFault::OrderingDrift, format!("Records share a position ({})", ids));
        }
        *last = ties;
    }
}

/// Builds a snapshot from raw collection rows. Malformed rows are skipped.
pub fn build_snapshot(demand_rows: &[Row], sub_rows: &[Row], entry_rows: &[Row]) -> CacheSnapshot {
    let time_entries = parse_rows::<TimeEntry>(entry_rows, Collection::TimeEntries);
    let mut logs = daily_logs_by_demand(&time_entries);

    let mut subs_by_demand: HashMap<String, Vec<SubActivityRow>> = HashMap::new();
    for sub in parse_rows::<SubActivityRow>(sub_rows, Collection::SubActivities) {
        subs_by_demand.entry(sub.demand_id.clone()).or_default().push(sub);
    }

    let mut demands = parse_rows::<DemandRow>(demand_rows, Collection::Demands)
        .into_iter()
        .map(|row| {
            let subs = subs_by_demand.remove(&row.id).unwrap_or_default();
            let daily_logs = logs.remove(&row.id).unwrap_or_default();
            row.into_record(to_sub_activities(subs), daily_logs)
        })
        .collect::<Vec<_>>();
    sort_by_order(&mut demands);

    CacheSnapshot {
        demands,
        time_entries,
        tombstones: BTreeMap::new(),
        generation: 0,
        refreshed_at: Some(Utc::now()),
    }
}

fn parse_rows<T: DeserializeOwned>(rows: &[Row], collection: Collection) -> Vec<T> {
    rows.iter()
        .filter_map(|row| match parse_row::<T>(row) {
            Ok(parsed) => Some(parsed),
            Err(error) => {
                tracing::warn!(collection = collection.as_str(), error = %error, "skipping malformed row");
                None
            }
        })
        .collect()
}

fn to_sub_activities(mut rows: Vec<SubActivityRow>) -> Vec<SubActivity> {
    rows.sort_by_key(|row| row.position);
    rows.into_iter()
        .map(|row| SubActivity {
            id: row.id,
            title: row.title,
            completed: row.completed,
        })
        .collect()
}

fn upsert_demand(snapshot: &mut CacheSnapshot, row: &Row) -> Option<bool> {
    let parsed = parse_row::<DemandRow>(row).ok()?;
    if is_buried(snapshot, &parsed.id, parsed.revision) {
        return Some(false);
    }
    let daily_logs = aggregate(snapshot.entries_for(&parsed.id));
    match snapshot.demands.iter().position(|demand| demand.id == parsed.id) {
        Some(index) => {
            if snapshot.demands[index].revision >= parsed.revision {
                return Some(false);
            }
            let subs = std::mem::take(&mut snapshot.demands[index].sub_activities);
            snapshot.demands[index] = parsed.into_record(subs, daily_logs);
        }
        None => {
            snapshot.tombstones.remove(&parsed.id);
            snapshot.demands.push(parsed.into_record(Vec::new(), daily_logs));
        }
    }
    sort_by_order(&mut snapshot.demands);
    Some(true)
}

fn remove_demand(snapshot: &mut CacheSnapshot, id: &str, revision: u64) -> bool {
    let buried_at = snapshot.tombstones.entry(id.to_string()).or_insert(0);
    let newer = revision > *buried_at;
    *buried_at = (*buried_at).max(revision);
    let before = snapshot.demands.len();
    snapshot.demands.retain(|demand| demand.id != id);
    before != snapshot.demands.len() || newer
}

fn is_buried(snapshot: &CacheSnapshot, id: &str, revision: u64) -> bool {
    snapshot
        .tombstones
        .get(id)
        .map(|buried_at| revision <= *buried_at)
        .unwrap_or(false)
}

fn upsert_entry(snapshot: &mut CacheSnapshot, row: &Row) -> Option<bool> {
    let entry = parse_row::<TimeEntry>(row).ok()?;
    match snapshot.time_entries.iter().position(|existing| existing.id == entry.id) {
        Some(index) if snapshot.time_entries[index].revision >= entry.revision => return Some(false),
        Some(index) => snapshot.time_entries[index] = entry.clone(),
        None => snapshot.time_entries.push(entry.clone()),
    }
    refresh_logs(snapshot, &entry.demand_id);
    Some(true)
}

fn remove_entry(snapshot: &mut CacheSnapshot, id: &str) -> bool {
    let Some(index) = snapshot.time_entries.iter().position(|entry| entry.id == id) else {
        return false;
    };
    let removed = snapshot.time_entries.remove(index);
    refresh_logs(snapshot, &removed.demand_id);
    true
}

fn refresh_logs(snapshot: &mut CacheSnapshot, demand_id: &str) {
    let logs = aggregate(snapshot.entries_for(demand_id));
    if let Some(demand) = snapshot.demands.iter_mut().find(|demand| demand.id == demand_id) {
        demand.daily_logs = logs;
    }
}

/// Record view used when comparing caches across clients.
pub fn canonical_records(snapshot: &CacheSnapshot) -> Vec<DemandRecord> {
    let mut records = snapshot.demands.clone();
    records.sort_by(|a, b| a.id.cmp(&b.id));
    records
}
