use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Column name -> value for one row image.
pub type Row = Map<String, Value>;

/// Position in a source's change log.
///
/// Positions are totally ordered and never reused. `LogPosition::ORIGIN`
/// sits before every log entry; a snapshot of an empty log reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogPosition(pub u64);

impl LogPosition {
    pub const ORIGIN: LogPosition = LogPosition(0);

    pub fn next(self) -> LogPosition {
        LogPosition(self.0 + 1)
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical rendering of a row's key column values.
///
/// Single-column keys render as the bare value (`1`, `abc`), composite keys
/// as a JSON array. The same rendering is used for foreign keys so that
/// `orders.customer_id = 1` and `customers.id = 1` produce equal keys, and it
/// doubles as the document id at the sink.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(String);

impl RowKey {
    pub fn new(rendered: impl Into<String>) -> Self {
        Self(rendered.into())
    }

    /// Build a key from the given columns of a row image.
    ///
    /// Returns `None` if any column is missing or null.
    pub fn from_columns(row: &Row, columns: &[String]) -> Option<Self> {
        let mut values = Vec::with_capacity(columns.len());
        for column in columns {
            match row.get(column) {
                None | Some(Value::Null) => return None,
                Some(value) => values.push(value),
            }
        }

        match values.as_slice() {
            [single] => Some(Self(render_scalar(single))),
            _ => Some(Self(Value::Array(values.into_iter().cloned().collect()).to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(Operation::Insert),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row-level change read from a source table's commit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub source_table: String,
    pub operation: Operation,
    pub key: RowKey,
    pub before: Option<Row>,
    pub after: Option<Row>,
    pub log_position: LogPosition,
    pub committed_at: Option<DateTime<Utc>>,
}

impl ChangeRecord {
    /// The row image that describes the row after this change, if it still exists.
    pub fn current_image(&self) -> Option<&Row> {
        match self.operation {
            Operation::Delete => None,
            Operation::Insert | Operation::Update => self.after.as_ref(),
        }
    }
}

/// The in-flight unit produced by a change log reader.
///
/// `position` is the resume token that becomes valid once every record in
/// the batch has been made durable downstream.
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    pub source_id: String,
    pub records: Vec<ChangeRecord>,
    pub position: LogPosition,
    pub snapshot: bool,
}

impl ChangeBatch {
    pub fn is_heartbeat(&self) -> bool {
        self.records.is_empty() && !self.snapshot
    }
}
