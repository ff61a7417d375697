//! # pantry-core — Versioned row store for peer-to-peer replication
//!
//! Every local write becomes a set of change records stamped with the local
//! site id and a monotonically increasing version. Peers exchange those
//! records and merge them deterministically, so every replica that has seen
//! the same set of records holds the same rows.
//!
//! ## Architecture
//!
//! ```text
//!   LocalWrites ──commit──►┌──────────────┐──changes_since──► remote peer
//!                          │ ChangeStore  │
//!   remote batch ──apply──►│ cells + log  │
//!                          │ + cursor     │
//!                          └──────┬───────┘
//!                                 │ merge::plan_*
//!                          ┌──────┴───────┐
//!                          │ LWW merge    │
//!                          │ (counter,    │
//!                          │  version,    │
//!                          │  site_id)    │
//!                          └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`site`] — Site identity
//! - [`change`] — Change records and merge order
//! - [`clock`] — Per-site version cursor
//! - [`schema`] — Local table/column catalogue
//! - [`store`] — Store traits, [`MemoryStore`] and [`RocksStore`]

pub mod change;
pub mod clock;
pub mod schema;
pub mod site;
pub mod store;

pub use change::{CellKey, Change, ChangeRecord, Column, Value};
pub use clock::{RegressionError, VersionClock};
pub use schema::{ConflictResolutionError, Schema};
pub use site::SiteId;
pub use store::{
    ApplyReport, ChangeStore, ChangesetSink, ChangesetSource, LocalOp, LocalWrites, MemoryStore,
    RocksStore, Row, StoreConfig, StoreError,
};
