//! In-process remote store
//!
//! Used by tests and local mode. Behaves like the hosted store: generated
//! columns are filled on insert, single-row reads report "no rows" as
//! not-found, and every write is published as a [`RowChange`].

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use super::traits::{EntityKind, RemoteStore, Select, StoreOp};
use crate::error::{Error, Result};
use crate::models::RowChange;

/// Capacity of the change broadcast; slow listeners miss older changes
const CHANGE_BUFFER: usize = 256;

#[derive(Default)]
struct Tables {
    rows: HashMap<EntityKind, Vec<Value>>,
    /// One-shot failures consumed by the next matching operation
    failures: Vec<(EntityKind, StoreOp)>,
}

impl Tables {
    fn take_failure(&mut self, kind: EntityKind, op: StoreOp) -> Result<()> {
        match self.failures.iter().position(|f| *f == (kind, op)) {
            Some(index) => {
                self.failures.remove(index);
                warn!(table = %kind, op = ?op, "Injected store failure");
                Err(Error::remote(format!("injected {:?} failure on {}", op, kind)))
            }
            None => Ok(()),
        }
    }

    fn table(&mut self, kind: EntityKind) -> &mut Vec<Value> {
        self.rows.entry(kind).or_default()
    }
}

/// Remote store held entirely in memory
pub struct MemoryStore {
    tables: Mutex<Tables>,
    changes: broadcast::Sender<RowChange>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            tables: Mutex::new(Tables::default()),
            changes,
        }
    }

    /// Stream of every successful write, in commit order
    pub fn subscribe_changes(&self) -> broadcast::Receiver<RowChange> {
        self.changes.subscribe()
    }

    /// Make the next `op` against `kind` fail
    pub fn fail_next(&self, kind: EntityKind, op: StoreOp) {
        self.tables().failures.push((kind, op));
    }

    /// Insert a record directly, bypassing defaults and change publication
    pub fn seed<T: Serialize>(&self, kind: EntityKind, record: &T) {
        match serde_json::to_value(record) {
            Ok(row) => self.tables().table(kind).push(row),
            Err(e) => warn!(table = %kind, error = %e, "Could not seed row"),
        }
    }

    /// Number of rows currently held for `kind`
    pub fn count(&self, kind: EntityKind) -> usize {
        self.tables().rows.get(&kind).map_or(0, Vec::len)
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, change: RowChange) {
        // No receivers is fine: nobody is mirroring this store
        let _ = self.changes.send(change);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteStore for MemoryStore {
    async fn select(&self, query: Select) -> Result<Vec<Value>> {
        let mut tables = self.tables();
        tables.take_failure(query.kind, StoreOp::Select)?;

        let mut rows = tables.table(query.kind).clone();
        if let Some(column) = query.order_by {
            rows.sort_by(|a, b| compare_values(a.get(column), b.get(column)));
            if query.descending {
                rows.reverse();
            }
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn select_single(&self, kind: EntityKind) -> Result<Value> {
        let mut tables = self.tables();
        tables.take_failure(kind, StoreOp::Select)?;

        let rows = tables.table(kind);
        match rows.len() {
            0 => Err(Error::NotFound(format!("no rows in {}", kind))),
            1 => Ok(rows[0].clone()),
            n => Err(Error::remote(format!("{} rows in {}, expected one", n, kind))),
        }
    }

    async fn insert(&self, kind: EntityKind, row: Value) -> Result<()> {
        let Value::Object(mut row) = row else {
            return Err(Error::InvalidOperation(format!(
                "insert into {} expects an object",
                kind
            )));
        };
        fill_defaults(kind, &mut row);
        let row = Value::Object(row);

        {
            let mut tables = self.tables();
            tables.take_failure(kind, StoreOp::Insert)?;

            let key = row_key(&row);
            let table = tables.table(kind);
            if key.is_some() && table.iter().any(|r| row_key(r) == key) {
                return Err(Error::Remote {
                    code: Some("23505".to_string()),
                    message: format!("duplicate key in {}", kind),
                });
            }
            table.push(row.clone());
        }

        debug!(table = %kind, "Row inserted");
        self.publish(RowChange::insert(kind.table(), row));
        Ok(())
    }

    async fn update(&self, kind: EntityKind, key: &str, patch: Value) -> Result<()> {
        let Value::Object(patch) = patch else {
            return Err(Error::InvalidOperation(format!(
                "update of {} expects an object",
                kind
            )));
        };

        let change = {
            let mut tables = self.tables();
            tables.take_failure(kind, StoreOp::Update)?;

            let Some(row) = tables
                .table(kind)
                .iter_mut()
                .find(|r| row_key(r).as_deref() == Some(key))
            else {
                debug!(table = %kind, key = %key, "Update matched no rows");
                return Ok(());
            };

            let old = row.clone();
            if let Value::Object(fields) = row {
                for (column, value) in patch {
                    fields.insert(column, value);
                }
                if kind == EntityKind::GameStatus {
                    fields.insert("updated_at".to_string(), now());
                }
            }
            RowChange::update(kind.table(), old, row.clone())
        };

        self.publish(change);
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, key: &str) -> Result<()> {
        let removed = {
            let mut tables = self.tables();
            tables.take_failure(kind, StoreOp::Delete)?;

            let table = tables.table(kind);
            table
                .iter()
                .position(|r| row_key(r).as_deref() == Some(key))
                .map(|index| table.remove(index))
        };

        match removed {
            Some(old) => self.publish(RowChange::delete(kind.table(), old)),
            None => debug!(table = %kind, key = %key, "Delete matched no rows"),
        }
        Ok(())
    }
}

fn now() -> Value {
    Value::String(Utc::now().to_rfc3339())
}

fn fill_defaults(kind: EntityKind, row: &mut Map<String, Value>) {
    let mut default = |column: &str, value: Value| {
        if !row.contains_key(column) {
            row.insert(column.to_string(), value);
        }
    };

    match kind {
        EntityKind::Participant => {
            default("id", Value::String(Uuid::new_v4().to_string()));
            default("joined_at", now());
            default("affiliation", Value::Null);
            default("character", Value::Null);
            default("is_alive", Value::Bool(true));
        }
        EntityKind::GameStatus => {
            default("id", Value::from(1));
            default("day_number", Value::from(0));
            default("created_at", now());
            default("updated_at", now());
        }
        EntityKind::Message => {
            default("id", Value::String(Uuid::new_v4().to_string()));
            default("timestamp", now());
            default("is_system", Value::Bool(false));
        }
    }
}

/// The `id` column rendered as text, whatever its JSON type
fn row_key(row: &Value) -> Option<String> {
    match row.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Order column values: timestamps chronologically, numbers numerically, else as text
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::String(a)), Some(Value::String(b))) => {
            match (a.parse::<DateTime<Utc>>(), b.parse::<DateTime<Utc>>()) {
                (Ok(a), Ok(b)) => a.cmp(&b),
                _ => a.cmp(b),
            }
        }
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChangeKind;

    #[tokio::test]
    async fn test_select_single_reports_no_rows_as_not_found() {
        let store = MemoryStore::new();
        let err = store.select_single(EntityKind::GameStatus).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_insert_fills_generated_columns_and_publishes() {
        let store = MemoryStore::new();
        let mut changes = store.subscribe_changes();

        store
            .insert(
                EntityKind::Message,
                serde_json::json!({
                    "player_id": Uuid::new_v4(),
                    "player_name": "alice",
                    "content": "hi",
                    "phase": "Lobby",
                    "is_system": false
                }),
            )
            .await
            .unwrap();

        let change = changes.recv().await.unwrap();
        assert_eq!(change.table, "game_messages");
        assert_eq!(change.event_type, ChangeKind::Insert);
        let row = change.new.unwrap();
        assert!(row.get("id").is_some());
        assert!(row.get("timestamp").is_some());
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = MemoryStore::new();
        let row = serde_json::json!({ "id": "a", "name": "alice" });
        store.insert(EntityKind::Participant, row.clone()).await.unwrap();
        let err = store.insert(EntityKind::Participant, row).await.unwrap_err();
        assert!(matches!(err, Error::Remote { code: Some(ref c), .. } if c == "23505"));
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let store = MemoryStore::new();
        store.fail_next(EntityKind::Participant, StoreOp::Delete);

        assert!(store.delete(EntityKind::Participant, "x").await.is_err());
        assert!(store.delete(EntityKind::Participant, "x").await.is_ok());
    }

    #[tokio::test]
    async fn test_update_and_delete_publish_old_rows() {
        let store = MemoryStore::new();
        store.seed(EntityKind::Participant, &serde_json::json!({ "id": "a", "is_alive": true }));
        let mut changes = store.subscribe_changes();

        store
            .update(EntityKind::Participant, "a", serde_json::json!({ "is_alive": false }))
            .await
            .unwrap();
        let update = changes.recv().await.unwrap();
        assert_eq!(update.old.unwrap()["is_alive"], true);
        assert_eq!(update.new.unwrap()["is_alive"], false);

        store.delete(EntityKind::Participant, "a").await.unwrap();
        let delete = changes.recv().await.unwrap();
        assert_eq!(delete.event_type, ChangeKind::Delete);
        assert_eq!(store.count(EntityKind::Participant), 0);
    }

    #[test]
    fn test_compare_timestamps_chronologically() {
        let a = Value::String("2024-05-01T12:00:00.5Z".to_string());
        let b = Value::String("2024-05-01T12:00:00Z".to_string());
        assert_eq!(compare_values(Some(&a), Some(&b)), Ordering::Greater);
    }
}
