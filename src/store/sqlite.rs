use super::{matches_all, merge_patch, ChangeEvent, ChangeKind, ChangeSubscription, FieldMatch, RemoteStore};
use crate::clock::{Clock, SystemClock};
use crate::errors::{AppError, AppResult};
use crate::models::{row_id, Collection, Row, REVISION_FIELD};
use crate::settings::SyncSettings;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// SQLite-backed store. The change feed reaches every client holding a clone
/// of the same handle.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
    feed: broadcast::Sender<ChangeEvent>,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> AppResult<Self> {
        Self::open_from_settings(path, Arc::new(SystemClock), &SyncSettings::default())
    }

    /// Change feed sized by `change_channel_capacity`.
    pub fn open_from_settings(path: &Path, clock: Arc<dyn Clock>, settings: &SyncSettings) -> AppResult<Self> {
        Self::open_with(path, clock, settings.change_channel_capacity)
    }

    pub fn open_with(path: &Path, clock: Arc<dyn Clock>, feed_capacity: usize) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;
        let (feed, _) = broadcast::channel(feed_capacity);

        tracing::info!(path = %path.display(), "opened demand store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_path_buf(),
            feed,
            clock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    fn publish(&self, events: Vec<ChangeEvent>) {
        for event in events {
            let _ = self.feed.send(event);
        }
    }
}

#[async_trait]
impl RemoteStore for SqliteStore {
    async fn fetch_all(&self, collection: Collection) -> AppResult<Vec<Row>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT body_json FROM records WHERE collection = ?1 ORDER BY seq")?;
        let raw_rows = stmt
            .query_map([collection.as_str()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        raw_rows.iter().map(|raw| parse_body(raw)).collect()
    }

    async fn insert(&self, collection: Collection, mut row: Row) -> AppResult<Row> {
        let id = row_id(&row)
            .map(ToString::to_string)
            .ok_or_else(|| AppError::Internal("row without id".to_string()))?;
        {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let exists = tx
                .query_row(
                    "SELECT 1 FROM records WHERE collection = ?1 AND id = ?2",
                    params![collection.as_str(), id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                return Err(AppError::Conflict(format!("{} '{}' already exists", collection.as_str(), id)));
            }
            let revision = next_revision(&tx)?;
            row.insert(REVISION_FIELD.to_string(), revision.into());
            tx.execute(
                "INSERT INTO records (collection, id, body_json, revision, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    collection.as_str(),
                    id,
                    serde_json::to_string(&row)?,
                    revision as i64,
                    Utc::now().to_rfc3339()
                ],
            )?;
            tx.commit()?;
        }
        self.publish(vec![row_event(collection, ChangeKind::Insert, &row)]);
        Ok(row)
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
        let stored = {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let Some(mut row) = load_row(&tx, collection, id)? else {
                return if expected.is_empty() {
                    Err(AppError::NotFound(format!("{} '{}'", collection.as_str(), id)))
                } else {
                    Ok(None)
                };
            };
            if !matches_all(&row, &expected) {
                return Ok(None);
            }
            merge_patch(&mut row, patch);
            write_row(&tx, collection, id, &mut row)?;
            tx.commit()?;
            row
        };
        self.publish(vec![row_event(collection, ChangeKind::Update, &stored)]);
        Ok(Some(stored))
    }

    async fn update_matching(
        &self,
        collection: Collection,
        filter: FieldMatch,
        exclude: Option<FieldMatch>,
        patch: Row,
    ) -> AppResult<u64> {
        let events = {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let mut events = Vec::new();
            for mut row in load_collection(&tx, collection)? {
                let excluded = exclude.as_ref().map(|guard| guard.matches(&row)).unwrap_or(false);
                if !filter.matches(&row) || excluded {
                    continue;
                }
                let Some(id) = row_id(&row).map(ToString::to_string) else {
                    continue;
                };
                merge_patch(&mut row, patch.clone());
                write_row(&tx, collection, &id, &mut row)?;
                events.push(row_event(collection, ChangeKind::Update, &row));
            }
            tx.commit()?;
            events
        };
        let count = events.len() as u64;
        self.publish(events);
        Ok(count)
    }

    async fn delete(&self, collection: Collection, id: &str) -> AppResult<()> {
        let event = {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM records WHERE collection = ?1 AND id = ?2",
                params![collection.as_str(), id],
            )?;
            if removed == 0 {
                return Ok(());
            }
            let revision = next_revision(&tx)?;
            tx.commit()?;
            delete_event(collection, id, revision)
        };
        self.publish(vec![event]);
        Ok(())
    }

    async fn delete_matching(&self, collection: Collection, filter: FieldMatch) -> AppResult<u64> {
        let events = {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let mut events = Vec::new();
            for row in load_collection(&tx, collection)? {
                if !filter.matches(&row) {
                    continue;
                }
                let Some(id) = row_id(&row).map(ToString::to_string) else {
                    continue;
                };
                tx.execute(
                    "DELETE FROM records WHERE collection = ?1 AND id = ?2",
                    params![collection.as_str(), id],
                )?;
                let revision = next_revision(&tx)?;
                events.push(delete_event(collection, &id, revision));
            }
            tx.commit()?;
            events
        };
        let count = events.len() as u64;
        self.publish(events);
        Ok(count)
    }

    fn subscribe_to_changes(&self, collections: &[Collection]) -> ChangeSubscription {
        ChangeSubscription::new(self.feed.subscribe(), collections)
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

fn next_revision(tx: &Transaction<'_>) -> AppResult<u64> {
    tx.execute("UPDATE store_meta SET value = value + 1 WHERE key = 'revision'", [])?;
    let value: i64 = tx.query_row("SELECT value FROM store_meta WHERE key = 'revision'", [], |row| row.get(0))?;
    Ok(value as u64)
}

fn load_row(tx: &Transaction<'_>, collection: Collection, id: &str) -> AppResult<Option<Row>> {
    let raw = tx
        .query_row(
            "SELECT body_json FROM records WHERE collection = ?1 AND id = ?2",
            params![collection.as_str(), id],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    raw.as_deref().map(parse_body).transpose()
}

fn load_collection(tx: &Transaction<'_>, collection: Collection) -> AppResult<Vec<Row>> {
    let mut stmt = tx.prepare("SELECT body_json FROM records WHERE collection = ?1 ORDER BY seq")?;
    let raw_rows = stmt
        .query_map([collection.as_str()], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    raw_rows.iter().map(|raw| parse_body(raw)).collect()
}

fn write_row(tx: &Transaction<'_>, collection: Collection, id: &str, row: &mut Row) -> AppResult<()> {
    let revision = next_revision(tx)?;
    row.insert(REVISION_FIELD.to_string(), revision.into());
    tx.execute(
        "UPDATE records SET body_json = ?1, revision = ?2, updated_at = ?3 WHERE collection = ?4 AND id = ?5",
        params![
            serde_json::to_string(row)?,
            revision as i64,
            Utc::now().to_rfc3339(),
            collection.as_str(),
            id
        ],
    )?;
    Ok(())
}

fn parse_body(raw: &str) -> AppResult<Row> {
    match serde_json::from_str::<serde_json::Value>(raw)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(AppError::Internal(format!("stored row is not an object: {}", other))),
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
    use super::SqliteStore;
    use crate::models::{Collection, Row};
    use crate::store::{FieldMatch, RemoteStore};

    fn row(value: serde_json::Value) -> Row {
        serde_json::from_value(value).expect("row")
    }

    #[tokio::test]
    async fn rows_survive_reopen_in_insertion_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("demands.db");
        {
            let store = SqliteStore::open(&db_path).expect("open");
            for id in ["DEM-002", "DEM-001"] {
                store
                    .insert(Collection::Demands, row(serde_json::json!({ "id": id, "title": id })))
                    .await
                    .expect("insert");
            }
            store
                .update(Collection::Demands, "DEM-002", row(serde_json::json!({ "order": 4 })))
                .await
                .expect("update");
        }

        let store = SqliteStore::open(&db_path).expect("reopen");
        let rows = store.fetch_all(Collection::Demands).await.expect("fetch");
        let ids = rows
            .iter()
            .map(|row| row["id"].as_str().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["DEM-002", "DEM-001"]);
        assert_eq!(rows[0]["order"], 4);
        assert_eq!(rows[0]["revision"], 3);
    }

    #[tokio::test]
    async fn guarded_and_bulk_writes_follow_their_filters() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open(&dir.path().join("demands.db")).expect("open");
        for (id, status) in [("DEM-001", "OPEN"), ("DEM-002", "COMPLETED")] {
            store
                .insert(
                    Collection::Demands,
                    row(serde_json::json!({ "id": id, "status": status, "contract": "ACME" })),
                )
                .await
                .expect("insert");
        }

        let renamed = store
            .update_matching(
                Collection::Demands,
                FieldMatch::new("contract", "ACME"),
                Some(FieldMatch::new("status", "COMPLETED")),
                row(serde_json::json!({ "contract": "ACME Corp" })),
            )
            .await
            .expect("bulk");
        assert_eq!(renamed, 1);

        let guarded = store
            .update_where(
                Collection::Demands,
                "DEM-002",
                row(serde_json::json!({ "status": "OPEN" })),
                row(serde_json::json!({ "status": "BLOCKED" })),
            )
            .await
            .expect("guarded");
        assert!(guarded.is_none());

        let removed = store
            .delete_matching(Collection::Demands, FieldMatch::new("contract", "ACME"))
            .await
            .expect("delete");
        assert_eq!(removed, 1);
        assert!(store.insert(Collection::Demands, row(serde_json::json!({ "id": "DEM-001" }))).await.is_err());
    }
}
