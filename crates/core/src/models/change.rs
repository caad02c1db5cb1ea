//! Raw row-change records as published by the remote store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One change to one row. `new` and `old` are untyped until normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    pub commit_timestamp: DateTime<Utc>,
    #[serde(rename = "eventType")]
    pub event_type: ChangeKind,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
}

fn default_schema() -> String {
    "public".to_string()
}

impl RowChange {
    fn with(table: &str, event_type: ChangeKind, new: Option<Value>, old: Option<Value>) -> Self {
        Self {
            schema: default_schema(),
            table: table.to_string(),
            commit_timestamp: Utc::now(),
            event_type,
            new,
            old,
        }
    }

    pub fn insert(table: &str, row: Value) -> Self {
        Self::with(table, ChangeKind::Insert, Some(row), None)
    }

    pub fn update(table: &str, old: Value, new: Value) -> Self {
        Self::with(table, ChangeKind::Update, Some(new), Some(old))
    }

    pub fn delete(table: &str, old: Value) -> Self {
        Self::with(table, ChangeKind::Delete, None, Some(old))
    }
}

/// `null` and `{}` both mean "no record" on the wire
pub fn is_empty_record(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}
