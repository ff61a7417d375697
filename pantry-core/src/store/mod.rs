//! Change store contracts and the two bundled stores.
//!
//! The replication layer treats the store as an opaque versioned row store:
//!
//! - [`ChangesetSource`] reads ordered deltas above a version boundary
//! - [`ChangesetSink`] applies a received batch atomically and idempotently
//! - [`ChangeStore`] adds the cursor slot, local writes and reads
//!
//! [`MemoryStore`] keeps everything in memory. [`RocksStore`] persists cells,
//! the change log and the version cursor in RocksDB column families and
//! commits every transaction as one write batch.

pub mod memory;
pub mod merge;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use std::collections::BTreeMap;
use tokio::sync::watch;

use crate::change::{ChangeRecord, Value};
use crate::clock::{RegressionError, VersionClock};
use crate::schema::ConflictResolutionError;
use crate::site::SiteId;

/// A visible row: column name → value.
pub type Row = BTreeMap<String, Value>;

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    /// Cursor would move backwards
    Regression(RegressionError),
    /// Record references an unknown table or column
    Conflict(ConflictResolutionError),
    /// More records in one local version than `seq` can number
    CommitTooLarge(usize),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::Regression(e) => write!(f, "{e}"),
            StoreError::Conflict(e) => write!(f, "{e}"),
            StoreError::CommitTooLarge(n) => {
                write!(f, "Commit too large: {n} records in one version")
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<RegressionError> for StoreError {
    fn from(e: RegressionError) -> Self {
        StoreError::Regression(e)
    }
}

impl From<ConflictResolutionError> for StoreError {
    fn from(e: ConflictResolutionError) -> Self {
        StoreError::Conflict(e)
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Outcome of applying one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Records that became the visible value of their cell
    pub applied: usize,
    /// New records that lost the merge (still logged)
    pub superseded: usize,
    /// Records at or below the cursor, dropped silently
    pub duplicates: usize,
    /// Cursor entries moved forward by this batch
    pub advanced: Vec<(SiteId, u64)>,
}

impl ApplyReport {
    /// Nothing new was learned.
    pub fn is_noop(&self) -> bool {
        self.advanced.is_empty()
    }

    pub fn new_records(&self) -> usize {
        self.applied + self.superseded
    }
}

/// Reads ordered deltas from the local store.
pub trait ChangesetSource {
    /// Records originated by `site` with version strictly above `since`,
    /// ascending by (version, seq).
    ///
    /// `limit` is a soft page size: a page never ends in the middle of a
    /// version. An empty result means the caller is caught up.
    fn changes_since(
        &self,
        site: SiteId,
        since: u64,
        limit: Option<usize>,
    ) -> Result<Vec<ChangeRecord>, StoreError>;
}

/// Applies received batches to the local store.
pub trait ChangesetSink {
    /// Apply `batch` atomically. Records at or below the cursor of their
    /// origin site are dropped. Conflicts resolve by merge order, never by
    /// arrival order. The cursor advances in the same atomic unit.
    fn apply(&self, batch: &[ChangeRecord]) -> Result<ApplyReport, StoreError>;
}

/// Everything the replication layer needs from a store.
pub trait ChangeStore: ChangesetSource + ChangesetSink + Send + Sync {
    fn site_id(&self) -> SiteId;

    /// Highest local write version.
    fn local_version(&self) -> u64;

    /// Cursor entry for `site` (0 if never seen).
    fn cursor(&self, site: &SiteId) -> u64;

    /// Snapshot of the full version cursor.
    fn clock(&self) -> VersionClock;

    /// Commit local writes as one new local version.
    ///
    /// Returns the new local version, or the unchanged one when `writes`
    /// produced no records.
    fn commit(&self, writes: LocalWrites) -> Result<u64, StoreError>;

    /// Visible row, `None` if absent or deleted.
    fn row(&self, table: &str, pk: &str) -> Result<Option<Row>, StoreError>;

    /// All visible rows of `table`, ordered by primary key.
    fn rows(&self, table: &str) -> Result<Vec<(String, Row)>, StoreError>;

    /// Notified with the new local version after every local commit.
    fn watch_local_version(&self) -> watch::Receiver<u64>;

    /// Digest over visible cells and the cursor, for equality checks.
    fn checksum(&self) -> Result<u64, StoreError>;
}

/// A local write operation.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalOp {
    Set {
        table: String,
        pk: String,
        column: String,
        value: Value,
    },
    Delete {
        table: String,
        pk: String,
    },
}

/// Local writes committed together under one version.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalWrites {
    ops: Vec<LocalOp>,
}

impl LocalWrites {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(
        &mut self,
        table: impl Into<String>,
        pk: impl Into<String>,
        column: impl Into<String>,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.ops.push(LocalOp::Set {
            table: table.into(),
            pk: pk.into(),
            column: column.into(),
            value: value.into(),
        });
        self
    }

    /// Set several columns of one row.
    pub fn upsert<I, C, V>(&mut self, table: &str, pk: &str, columns: I) -> &mut Self
    where
        I: IntoIterator<Item = (C, V)>,
        C: Into<String>,
        V: Into<Value>,
    {
        for (column, value) in columns {
            self.set(table, pk, column, value);
        }
        self
    }

    pub fn delete(&mut self, table: impl Into<String>, pk: impl Into<String>) -> &mut Self {
        self.ops.push(LocalOp::Delete {
            table: table.into(),
            pk: pk.into(),
        });
        self
    }

    pub fn ops(&self) -> &[LocalOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Digest of visible cells (in cell-key order) and the cursor.
pub(crate) fn digest<'a, I>(cells: I, clock: &VersionClock) -> Result<u64, StoreError>
where
    I: IntoIterator<Item = &'a ChangeRecord>,
{
    let mut hasher = blake3::Hasher::new();
    for rec in cells {
        let bytes = bincode::serde::encode_to_vec(rec, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        hasher.update(&bytes);
    }
    for (site, version) in clock.sites() {
        hasher.update(site.as_bytes());
        hasher.update(&version.to_be_bytes());
    }
    // First 8 bytes of the BLAKE3 hash
    let hash = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash.as_bytes()[..8]);
    Ok(u64::from_be_bytes(head))
}
