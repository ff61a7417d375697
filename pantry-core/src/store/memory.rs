//! In-memory change store.
//!
//! One mutex guards cells, change log and cursor together, so every commit
//! and every applied batch is a single critical section.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

use crate::change::{CellKey, ChangeRecord};
use crate::clock::VersionClock;
use crate::schema::Schema;
use crate::site::SiteId;
use crate::store::merge::{assemble_row, plan_apply, plan_local, take_page, Plan};
use crate::store::{
    digest, ApplyReport, ChangeStore, ChangesetSink, ChangesetSource, LocalWrites, Row,
    StoreError,
};

struct State {
    clock: VersionClock,
    cells: BTreeMap<CellKey, ChangeRecord>,
    /// (origin, version, seq) → record
    log: BTreeMap<(SiteId, u64, u32), ChangeRecord>,
}

impl State {
    fn commit(&mut self, plan: Plan) {
        for rec in plan.records {
            self.log.insert(rec.id(), rec);
        }
        for rec in plan.winners {
            self.cells.insert(rec.cell_key(), rec);
        }
        self.clock = plan.clock;
    }

    fn row_records(&self, table: &str, pk: &str) -> impl Iterator<Item = &ChangeRecord> {
        let start = CellKey::row(table, pk);
        let (table, pk) = (table.to_string(), pk.to_string());
        self.cells
            .range(start..)
            .take_while(move |(k, _)| k.table == table && k.pk == pk)
            .map(|(_, rec)| rec)
    }
}

pub struct MemoryStore {
    schema: Schema,
    state: Mutex<State>,
    local_version_tx: watch::Sender<u64>,
}

impl MemoryStore {
    /// Create an empty store with a freshly minted site id.
    pub fn new(schema: Schema) -> Self {
        Self::with_site(SiteId::new(), schema)
    }

    pub fn with_site(site_id: SiteId, schema: Schema) -> Self {
        let (local_version_tx, _) = watch::channel(0);
        Self {
            schema,
            state: Mutex::new(State {
                clock: VersionClock::new(site_id),
                cells: BTreeMap::new(),
                log: BTreeMap::new(),
            }),
            local_version_tx,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Number of change-log entries from every origin.
    pub fn log_len(&self) -> usize {
        self.lock().log.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a panic elsewhere; the state itself is
        // always committed whole.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ChangesetSource for MemoryStore {
    fn changes_since(
        &self,
        site: SiteId,
        since: u64,
        limit: Option<usize>,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        let state = self.lock();
        let start = Bound::Excluded((site, since, u32::MAX));
        let end = Bound::Included((site, u64::MAX, u32::MAX));
        let records = state.log.range((start, end)).map(|(_, rec)| rec.clone());
        Ok(take_page(records, limit))
    }
}

impl ChangesetSink for MemoryStore {
    fn apply(&self, batch: &[ChangeRecord]) -> Result<ApplyReport, StoreError> {
        let mut state = self.lock();
        let plan = {
            let cells = &state.cells;
            plan_apply(batch, &state.clock, &self.schema, |key| {
                Ok(cells.get(key).cloned())
            })?
        };
        let report = plan.report.clone();
        if !plan.is_empty() {
            state.commit(plan);
        }
        log::trace!(
            "Applied batch of {}: {} won, {} lost, {} duplicate",
            batch.len(),
            report.applied,
            report.superseded,
            report.duplicates
        );
        Ok(report)
    }
}

impl ChangeStore for MemoryStore {
    fn site_id(&self) -> SiteId {
        self.lock().clock.local_site()
    }

    fn local_version(&self) -> u64 {
        self.lock().clock.local_version()
    }

    fn cursor(&self, site: &SiteId) -> u64 {
        self.lock().clock.get(site)
    }

    fn clock(&self) -> VersionClock {
        self.lock().clock.clone()
    }

    fn commit(&self, writes: LocalWrites) -> Result<u64, StoreError> {
        let version = {
            let mut state = self.lock();
            let plan = {
                let cells = &state.cells;
                plan_local(&writes, &state.clock, &self.schema, |key| {
                    Ok(cells.get(key).cloned())
                })?
            };
            if plan.is_empty() {
                return Ok(state.clock.local_version());
            }
            state.commit(plan);
            state.clock.local_version()
        };
        self.local_version_tx.send_replace(version);
        Ok(version)
    }

    fn row(&self, table: &str, pk: &str) -> Result<Option<Row>, StoreError> {
        let state = self.lock();
        Ok(assemble_row(state.row_records(table, pk)))
    }

    fn rows(&self, table: &str) -> Result<Vec<(String, Row)>, StoreError> {
        let state = self.lock();
        let mut grouped: BTreeMap<&str, Vec<&ChangeRecord>> = BTreeMap::new();
        for (key, rec) in state.cells.iter().filter(|(k, _)| k.table == table) {
            grouped.entry(key.pk.as_str()).or_default().push(rec);
        }
        Ok(grouped
            .into_iter()
            .filter_map(|(pk, recs)| assemble_row(recs).map(|row| (pk.to_string(), row)))
            .collect())
    }

    fn watch_local_version(&self) -> watch::Receiver<u64> {
        self.local_version_tx.subscribe()
    }

    fn checksum(&self) -> Result<u64, StoreError> {
        let state = self.lock();
        digest(state.cells.values(), &state.clock)
    }
}
