//! Change records: the unit of replication.
//!
//! ```text
//! ┌─────────┬──────┬──────────────┬──────────────┬─────────┬─────────┬─────┬─────────┐
//! │ table   │ pk   │ column       │ change       │ site_id │ version │ seq │ counter │
//! │ String  │ Str  │ Named | Row  │ Set | Delete │ 16 B    │ u64     │ u32 │ u64     │
//! └─────────┴──────┴──────────────┴──────────────┴─────────┴─────────┴─────┴─────────┘
//! ```
//!
//! Records for the same cell are merged last-writer-wins over
//! `(counter, version, site_id)`. For named columns `counter` is the cell's
//! write count; for the `Row` marker it is the row's causal length (odd =
//! alive, even = deleted).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::site::SiteId;

/// A scalar cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Real(f)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Blob(b)
    }
}

/// Which part of a row a record addresses.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Column {
    /// The whole row: create/resurrect or delete.
    Row,
    Named(String),
}

impl Column {
    pub fn named(name: impl Into<String>) -> Self {
        Column::Named(name.into())
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Column::Row => write!(f, "*"),
            Column::Named(name) => write!(f, "{name}"),
        }
    }
}

/// New value, or a tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    Set(Value),
    Delete,
}

/// Address of one mergeable cell.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellKey {
    pub table: String,
    pub pk: String,
    pub column: Column,
}

impl CellKey {
    pub fn new(table: impl Into<String>, pk: impl Into<String>, column: Column) -> Self {
        Self {
            table: table.into(),
            pk: pk.into(),
            column,
        }
    }

    pub fn row(table: impl Into<String>, pk: impl Into<String>) -> Self {
        Self::new(table, pk, Column::Row)
    }
}

/// One immutable row/column-level mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub table: String,
    pub pk: String,
    pub column: Column,
    pub change: Change,
    /// Origin site
    pub site_id: SiteId,
    /// Monotonic per origin site
    pub version: u64,
    /// Position within one version (one local commit)
    pub seq: u32,
    /// Cell write count, or row causal length for `Column::Row`
    pub counter: u64,
}

impl ChangeRecord {
    pub fn cell_key(&self) -> CellKey {
        CellKey::new(self.table.clone(), self.pk.clone(), self.column.clone())
    }

    /// Identity of this write across the whole system.
    pub fn id(&self) -> (SiteId, u64, u32) {
        (self.site_id, self.version, self.seq)
    }

    /// Total merge order for records of the same cell.
    pub fn merge_key(&self) -> (u64, u64, SiteId) {
        (self.counter, self.version, self.site_id)
    }

    /// Compare two writes to the same cell. `Greater` means `self` wins.
    pub fn merge_cmp(&self, other: &ChangeRecord) -> Ordering {
        self.merge_key().cmp(&other.merge_key())
    }

    /// Whether `self` replaces `current` as the visible value of its cell.
    pub fn supersedes(&self, current: &ChangeRecord) -> bool {
        self.merge_cmp(current) == Ordering::Greater
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.change, Change::Delete)
    }

    pub fn value(&self) -> Option<&Value> {
        match &self.change {
            Change::Set(v) => Some(v),
            Change::Delete => None,
        }
    }
}

/// Whether a row causal length means the row exists.
pub fn is_alive(causal_length: u64) -> bool {
    causal_length % 2 == 1
}

/// Next odd causal length (create or resurrect).
pub fn next_alive(causal_length: u64) -> u64 {
    if is_alive(causal_length) {
        causal_length
    } else {
        causal_length + 1
    }
}

/// Next even causal length (delete).
pub fn next_deleted(causal_length: u64) -> u64 {
    if is_alive(causal_length) {
        causal_length + 1
    } else {
        causal_length
    }
}
