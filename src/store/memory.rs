use super::{matches_all, merge_patch, ChangeEvent, ChangeKind, ChangeSubscription, FieldMatch, RemoteStore};
use crate::clock::{Clock, SystemClock};
use crate::errors::{AppError, AppResult};
use crate::models::{row_id, Collection, Row, REVISION_FIELD};
use crate::settings::SyncSettings;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    Fetch,
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Default)]
struct Table {
    rows: HashMap<String, (u64, Row)>,
    next_seq: u64,
}

impl Table {
    fn ordered(&self) -> Vec<Row> {
        let mut rows = self.rows.values().collect::<Vec<_>>();
        rows.sort_by_key(|(seq, _)| *seq);
        rows.into_iter().map(|(_, row)| row.clone()).collect()
    }
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<Collection, Table>,
    revision: u64,
    faults: HashMap<(FaultOp, Option<Collection>), u32>,
    duplicate_delivery: bool,
}

impl State {
    fn take_fault(&mut self, op: FaultOp, collection: Collection) -> bool {
        for key in [(op, Some(collection)), (op, None)] {
            if let Some(remaining) = self.faults.get_mut(&key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return true;
                }
            }
        }
        false
    }

    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }
}

/// Shared in-process store. Every clone talks to the same tables and feed.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    feed: broadcast::Sender<ChangeEvent>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::from_settings(Arc::new(SystemClock), &SyncSettings::default())
    }
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>, feed_capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(feed_capacity);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            feed,
            clock,
        }
    }

    /// Change feed sized by `change_channel_capacity`.
    pub fn from_settings(clock: Arc<dyn Clock>, settings: &SyncSettings) -> Self {
        Self::new(clock, settings.change_channel_capacity)
    }

    /// Makes the next `times` operations of kind `op` fail with a transient error.
    pub fn fail_next(&self, op: FaultOp, collection: Option<Collection>, times: u32) {
        if let Ok(mut state) = self.state.lock() {
            *state.faults.entry((op, collection)).or_insert(0) += times;
        }
    }

    /// Publishes every change twice, as an at-least-once feed may.
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.duplicate_delivery = enabled;
        }
    }

    pub fn row_count(&self, collection: Collection) -> usize {
        self.state
            .lock()
            .map(|state| state.tables.get(&collection).map(|table| table.rows.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| AppError::Internal("memory store mutex poisoned".to_string()))
    }

    fn publish(&self, events: Vec<ChangeEvent>, duplicate: bool) {
        for event in events {
            if duplicate {
                let _ = self.feed.send(event.clone());
            }
            // No subscribers is not an error for a best-effort feed.
            let _ = self.feed.send(event);
        }
    }
}

fn transient(op: FaultOp, collection: Collection) -> AppError {
    AppError::Transient(format!("{:?} on {} failed", op, collection.as_str()))
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn fetch_all(&self, collection: Collection) -> AppResult<Vec<Row>> {
        let mut state = self.lock()?;
        if state.take_fault(FaultOp::Fetch, collection) {
            return Err(transient(FaultOp::Fetch, collection));
        }
        Ok(state.tables.get(&collection).map(Table::ordered).unwrap_or_default())
    }

    async fn insert(&self, collection: Collection, mut row: Row) -> AppResult<Row> {
        let (stored, duplicate) = {
            let mut state = self.lock()?;
            if state.take_fault(FaultOp::Insert, collection) {
                return Err(transient(FaultOp::Insert, collection));
            }
            let id = row_id(&row)
                .map(ToString::to_string)
                .ok_or_else(|| AppError::Internal("row without id".to_string()))?;
            if state
                .tables
                .get(&collection)
                .map(|table| table.rows.contains_key(&id))
                .unwrap_or(false)
            {
                return Err(AppError::Conflict(format!("{} '{}' already exists", collection.as_str(), id)));
            }
            let revision = state.next_revision();
            row.insert(REVISION_FIELD.to_string(), revision.into());
            let table = state.tables.entry(collection).or_default();
            let seq = table.next_seq;
            table.next_seq += 1;
            table.rows.insert(id, (seq, row.clone()));
            (row, state.duplicate_delivery)
        };
        self.publish(vec![row_event(collection, ChangeKind::Insert, &stored)], duplicate);
        Ok(stored)
    }

    async fn update(&self, collection: Collection, id: &str, patch: Row) -> AppResult<Row> {
        self.update_where(collection, id, Row::new(), patch)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("{} '{}'", collection.as_str(), id)))
    }

    async fn update_where(
        &self,
        collection: Collection,
        id: &str,
        expected: Row,
        patch: Row,
    ) -> AppResult<Option<Row>> {
        let (stored, duplicate) = {
            let mut state = self.lock()?;
            if state.take_fault(FaultOp::Update, collection) {
                return Err(transient(FaultOp::Update, collection));
            }
            let revision = state.revision + 1;
            let Some((_, row)) = state.tables.get_mut(&collection).and_then(|table| table.rows.get_mut(id)) else {
                return if expected.is_empty() {
                    Err(AppError::NotFound(format!("{} '{}'", collection.as_str(), id)))
                } else {
                    Ok(None)
                };
            };
            if !matches_all(row, &expected) {
                return Ok(None);
            }
            merge_patch(row, patch);
            row.insert(REVISION_FIELD.to_string(), revision.into());
            let stored = row.clone();
            state.revision = revision;
            (stored, state.duplicate_delivery)
        };
        self.publish(vec![row_event(collection, ChangeKind::Update, &stored)], duplicate);
        Ok(Some(stored))
    }

    async fn update_matching(
        &self,
        collection: Collection,
        filter: FieldMatch,
        exclude: Option<FieldMatch>,
        patch: Row,
    ) -> AppResult<u64> {
        let (events, duplicate) = {
            let mut state = self.lock()?;
            if state.take_fault(FaultOp::Update, collection) {
                return Err(transient(FaultOp::Update, collection));
            }
            let mut revision = state.revision;
            let mut events = Vec::new();
            if let Some(table) = state.tables.get_mut(&collection) {
                let mut rows = table.rows.values_mut().collect::<Vec<_>>();
                rows.sort_by_key(|(seq, _)| *seq);
                for (_, row) in rows {
                    let excluded = exclude.as_ref().map(|guard| guard.matches(row)).unwrap_or(false);
                    if !filter.matches(row) || excluded {
                        continue;
                    }
                    revision += 1;
                    merge_patch(row, patch.clone());
                    row.insert(REVISION_FIELD.to_string(), revision.into());
                    events.push(row_event(collection, ChangeKind::Update, row));
                }
            }
            state.revision = revision;
            (events, state.duplicate_delivery)
        };
        let count = events.len() as u64;
        self.publish(events, duplicate);
        Ok(count)
    }

    async fn delete(&self, collection: Collection, id: &str) -> AppResult<()> {
        let (event, duplicate) = {
            let mut state = self.lock()?;
            if state.take_fault(FaultOp::Delete, collection) {
                return Err(transient(FaultOp::Delete, collection));
            }
            let removed = state
                .tables
                .get_mut(&collection)
                .and_then(|table| table.rows.remove(id))
                .is_some();
            if !removed {
                return Ok(());
            }
            let revision = state.next_revision();
            (delete_event(collection, id, revision), state.duplicate_delivery)
        };
        self.publish(vec![event], duplicate);
        Ok(())
    }

    async fn delete_matching(&self, collection: Collection, filter: FieldMatch) -> AppResult<u64> {
        let (events, duplicate) = {
            let mut state = self.lock()?;
            if state.take_fault(FaultOp::Delete, collection) {
                return Err(transient(FaultOp::Delete, collection));
            }
            let doomed = state
                .tables
                .get(&collection)
                .map(|table| {
                    table
                        .rows
                        .iter()
                        .filter(|(_, (_, row))| filter.matches(row))
                        .map(|(id, _)| id.clone())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            let mut events = Vec::new();
            for id in doomed {
                if let Some(table) = state.tables.get_mut(&collection) {
                    table.rows.remove(&id);
                }
                let revision = state.next_revision();
                events.push(delete_event(collection, &id, revision));
            }
            (events, state.duplicate_delivery)
        };
        let count = events.len() as u64;
        self.publish(events, duplicate);
        Ok(count)
    }

    fn subscribe_to_changes(&self, collections: &[Collection]) -> ChangeSubscription {
        ChangeSubscription::new(self.feed.subscribe(), collections)
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

fn row_event(collection: Collection, kind: ChangeKind, row: &Row) -> ChangeEvent {
    ChangeEvent {
        collection,
        kind,
        id: row_id(row).map(ToString::to_string),
        row: Some(row.clone()),
        revision: crate::models::row_revision(row),
    }
}

fn delete_event(collection: Collection, id: &str, revision: u64) -> ChangeEvent {
    ChangeEvent {
        collection,
        kind: ChangeKind::Delete,
        id: Some(id.to_string()),
        row: None,
        revision,
    }
}

#[cfg(test)]
mod tests {
    use super::{FaultOp, MemoryStore};
    use crate::clock::SystemClock;
    use crate::models::{Collection, Row};
    use crate::settings::SyncSettings;
    use crate::store::{ChangeKind, FieldMatch, RemoteStore};
    use std::sync::Arc;

    fn row(value: serde_json::Value) -> Row {
        serde_json::from_value(value).expect("row")
    }

    #[tokio::test]
    async fn overflowing_the_configured_feed_yields_a_coarse_event() {
        let settings = SyncSettings {
            change_channel_capacity: 2,
            ..SyncSettings::default()
        };
        let store = MemoryStore::from_settings(Arc::new(SystemClock), &settings);
        let mut changes = store.subscribe_to_changes(&[Collection::Demands]);
        for n in 1..=4 {
            store
                .insert(Collection::Demands, row(serde_json::json!({ "id": format!("DEM-00{}", n) })))
                .await
                .expect("insert");
        }

        let first = changes.try_recv().expect("lagged notification");
        assert_eq!(first.collection, Collection::Demands);
        assert!(first.id.is_none() && first.row.is_none());
        let rest = std::iter::from_fn(|| changes.try_recv()).collect::<Vec<_>>();
        assert_eq!(rest.len(), 2);
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_ids_and_stamps_revisions() {
        let store = MemoryStore::default();
        let first = store
            .insert(Collection::TimeEntries, row(serde_json::json!({ "id": "s-1", "duration": 5 })))
            .await
            .expect("insert");
        assert_eq!(first["revision"], 1);

        let err = store
            .insert(Collection::TimeEntries, row(serde_json::json!({ "id": "s-1", "duration": 9 })))
            .await
            .expect_err("duplicate");
        assert!(err.to_string().starts_with("CONFLICT"));
        assert_eq!(store.row_count(Collection::TimeEntries), 1);
    }

    #[tokio::test]
    async fn update_where_only_applies_when_guard_matches() {
        let store = MemoryStore::default();
        store
            .insert(Collection::Demands, row(serde_json::json!({ "id": "DEM-001", "timer_session": "a" })))
            .await
            .expect("insert");

        let missed = store
            .update_where(
                Collection::Demands,
                "DEM-001",
                row(serde_json::json!({ "timer_session": "b" })),
                row(serde_json::json!({ "timer_running": false })),
            )
            .await
            .expect("update");
        assert!(missed.is_none());

        let applied = store
            .update_where(
                Collection::Demands,
                "DEM-001",
                row(serde_json::json!({ "timer_session": "a" })),
                row(serde_json::json!({ "timer_session": null })),
            )
            .await
            .expect("update")
            .expect("guard matched");
        assert!(applied["timer_session"].is_null());
    }

    #[tokio::test]
    async fn faults_and_feed_are_observable() {
        let store = MemoryStore::default();
        let mut changes = store.subscribe_to_changes(&[Collection::Demands]);
        store.fail_next(FaultOp::Fetch, Some(Collection::Demands), 1);
        assert!(store.fetch_all(Collection::Demands).await.is_err());
        assert!(store.fetch_all(Collection::Demands).await.is_ok());

        store
            .insert(Collection::Demands, row(serde_json::json!({ "id": "DEM-001", "status": "OPEN" })))
            .await
            .expect("insert");
        store
            .insert(Collection::TimeEntries, row(serde_json::json!({ "id": "t-1" })))
            .await
            .expect("insert");
        let updated = store
            .update_matching(
                Collection::Demands,
                FieldMatch::new("status", "OPEN"),
                None,
                row(serde_json::json!({ "status": "BLOCKED" })),
            )
            .await
            .expect("bulk");
        assert_eq!(updated, 1);

        let first = changes.try_recv().expect("insert event");
        assert_eq!(first.kind, ChangeKind::Insert);
        let second = changes.try_recv().expect("update event");
        assert_eq!(second.kind, ChangeKind::Update);
        assert!(changes.try_recv().is_none());
    }
}
