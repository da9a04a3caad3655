//! Remote record store contract.
//!
//! The store is shared by every client. Writes are visible to all of them and
//! each committed write is announced on a best-effort change feed: delivery is
//! at-least-once, unordered across collections, and may drop events under
//! back-pressure (a lagging subscriber sees a payload-less event instead).

pub mod memory;
pub mod sqlite;

use crate::errors::AppResult;
use crate::models::{Collection, Row};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::broadcast;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub collection: Collection,
    pub kind: ChangeKind,
    pub id: Option<String>,
    /// Row as committed; absent for deletes and for coarse notifications.
    pub row: Option<Row>,
    pub revision: u64,
}

impl ChangeEvent {
    /// A notification that only names the collection.
    pub fn coarse(collection: Collection) -> Self {
        Self {
            collection,
            kind: ChangeKind::Update,
            id: None,
            row: None,
            revision: 0,
        }
    }
}

/// Equality guard used by bulk updates: `field == value`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMatch {
    pub field: String,
    pub value: serde_json::Value,
}

impl FieldMatch {
    pub fn new(field: &str, value: impl Into<serde_json::Value>) -> Self {
        Self {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        row.get(&self.field).unwrap_or(&serde_json::Value::Null) == &self.value
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch_all(&self, collection: Collection) -> AppResult<Vec<Row>>;

    /// Inserts a new row. Fails with `Conflict` when the id already exists.
    async fn insert(&self, collection: Collection, row: Row) -> AppResult<Row>;

    /// Merges `patch` into the row and returns the stored result.
    async fn update(&self, collection: Collection, id: &str, patch: Row) -> AppResult<Row>;

    /// Applies `patch` only if every field of `expected` still holds.
    /// Returns `None` when the guard no longer matches.
    async fn update_where(
        &self,
        collection: Collection,
        id: &str,
        expected: Row,
        patch: Row,
    ) -> AppResult<Option<Row>>;

    /// Patches every row matching `filter` and not matching `exclude`.
    async fn update_matching(
        &self,
        collection: Collection,
        filter: FieldMatch,
        exclude: Option<FieldMatch>,
        patch: Row,
    ) -> AppResult<u64>;

    async fn delete(&self, collection: Collection, id: &str) -> AppResult<()>;

    async fn delete_matching(&self, collection: Collection, filter: FieldMatch) -> AppResult<u64>;

    fn subscribe_to_changes(&self, collections: &[Collection]) -> ChangeSubscription;

    /// Store-side clock used to stamp timer starts and stops.
    fn now(&self) -> DateTime<Utc>;
}

/// Receiving half of the change feed, filtered to a set of collections.
pub struct ChangeSubscription {
    receiver: broadcast::Receiver<ChangeEvent>,
    collections: BTreeSet<Collection>,
}

impl ChangeSubscription {
    pub(crate) fn new(receiver: broadcast::Receiver<ChangeEvent>, collections: &[Collection]) -> Self {
        Self {
            receiver,
            collections: collections.iter().copied().collect(),
        }
    }

    /// Waits for the next relevant change. `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.collections.contains(&event.collection) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "change feed lagged; requesting full reload");
                    let collection = self.collections.iter().next().copied()?;
                    return Some(ChangeEvent::coarse(collection));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant used to drain pending notifications.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.collections.contains(&event.collection) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    let collection = self.collections.iter().next().copied()?;
                    return Some(ChangeEvent::coarse(collection));
                }
                Err(_) => return None,
            }
        }
    }
}

pub(crate) fn matches_all(row: &Row, expected: &Row) -> bool {
    expected
        .iter()
        .all(|(field, value)| row.get(field).unwrap_or(&serde_json::Value::Null) == value)
}

pub(crate) fn merge_patch(row: &mut Row, patch: Row) {
    for (field, value) in patch {
        if field == "id" {
            continue;
        }
        row.insert(field, value);
    }
}
