//! Transaction planning shared by both stores.
//!
//! A plan is computed against a read-only view of the store (cursor + cell
//! lookup) and then committed by the store in one atomic step. Planning never
//! mutates anything, so a failed plan leaves the store untouched.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::change::{
    is_alive, next_alive, next_deleted, CellKey, Change, ChangeRecord, Column, Value,
};
use crate::clock::VersionClock;
use crate::schema::Schema;
use crate::site::SiteId;
use crate::store::{ApplyReport, LocalOp, LocalWrites, Row, StoreError};

/// Writes to commit together.
#[derive(Debug, Clone)]
pub struct Plan {
    /// New change-log entries
    pub records: Vec<ChangeRecord>,
    /// New winning record per touched cell
    pub winners: Vec<ChangeRecord>,
    /// Cursor after commit
    pub clock: VersionClock,
    pub report: ApplyReport,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Cell state seen by the planner: earlier writes in the same plan shadow the
/// store.
struct Overlay<F> {
    lookup: F,
    cells: HashMap<CellKey, ChangeRecord>,
}

impl<F> Overlay<F>
where
    F: FnMut(&CellKey) -> Result<Option<ChangeRecord>, StoreError>,
{
    fn new(lookup: F) -> Self {
        Self {
            lookup,
            cells: HashMap::new(),
        }
    }

    fn current(&mut self, key: &CellKey) -> Result<Option<ChangeRecord>, StoreError> {
        match self.cells.get(key) {
            Some(rec) => Ok(Some(rec.clone())),
            None => (self.lookup)(key),
        }
    }

    fn counter(&mut self, key: &CellKey) -> Result<u64, StoreError> {
        Ok(self.current(key)?.map_or(0, |r| r.counter))
    }

    fn put(&mut self, rec: ChangeRecord) {
        self.cells.insert(rec.cell_key(), rec);
    }

    fn into_winners(self) -> Vec<ChangeRecord> {
        let mut winners: Vec<ChangeRecord> = self.cells.into_values().collect();
        winners.sort_by(|a, b| a.cell_key().cmp(&b.cell_key()));
        winners
    }
}

/// Plan the application of a remote batch.
pub fn plan_apply<F>(
    batch: &[ChangeRecord],
    clock: &VersionClock,
    schema: &Schema,
    lookup: F,
) -> Result<Plan, StoreError>
where
    F: FnMut(&CellKey) -> Result<Option<ChangeRecord>, StoreError>,
{
    // Schema mismatch rejects the whole batch before anything is planned.
    for rec in batch {
        schema.validate(rec)?;
    }

    let local = clock.local_site();
    let mut next_clock = clock.clone();
    let mut overlay = Overlay::new(lookup);
    let mut seen: HashSet<(SiteId, u64, u32)> = HashSet::new();
    let mut highest: BTreeMap<SiteId, u64> = BTreeMap::new();
    let mut records = Vec::new();
    let mut report = ApplyReport::default();

    for rec in batch {
        let known = rec.site_id == local || rec.version <= clock.get(&rec.site_id);
        if known || !seen.insert(rec.id()) {
            report.duplicates += 1;
            continue;
        }

        let key = rec.cell_key();
        match overlay.current(&key)? {
            Some(current) if !rec.supersedes(&current) => report.superseded += 1,
            _ => {
                overlay.put(rec.clone());
                report.applied += 1;
            }
        }

        records.push(rec.clone());
        let top = highest.entry(rec.site_id).or_insert(0);
        *top = (*top).max(rec.version);
    }

    for (site, version) in highest {
        next_clock.advance(site, version)?;
        report.advanced.push((site, version));
    }

    Ok(Plan {
        records,
        winners: overlay.into_winners(),
        clock: next_clock,
        report,
    })
}

/// Plan a local commit under the next local version.
pub fn plan_local<F>(
    writes: &LocalWrites,
    clock: &VersionClock,
    schema: &Schema,
    lookup: F,
) -> Result<Plan, StoreError>
where
    F: FnMut(&CellKey) -> Result<Option<ChangeRecord>, StoreError>,
{
    let site = clock.local_site();
    let version = clock.next_local_version();
    let mut overlay = Overlay::new(lookup);
    let mut records: Vec<ChangeRecord> = Vec::new();

    let mut emit = |overlay: &mut Overlay<F>,
                    records: &mut Vec<ChangeRecord>,
                    table: &str,
                    pk: &str,
                    column: Column,
                    change: Change,
                    counter: u64|
     -> Result<(), StoreError> {
        let rec = ChangeRecord {
            table: table.to_string(),
            pk: pk.to_string(),
            column,
            change,
            site_id: site,
            version,
            seq: next_seq(records.len())?,
            counter,
        };
        overlay.put(rec.clone());
        records.push(rec);
        Ok(())
    };

    for op in writes.ops() {
        match op {
            LocalOp::Set {
                table,
                pk,
                column,
                value,
            } => {
                let column = Column::named(column.clone());
                schema.check(table, &column)?;

                let row_key = CellKey::row(table.clone(), pk.clone());
                let cl = overlay.counter(&row_key)?;
                if !is_alive(cl) {
                    emit(
                        &mut overlay,
                        &mut records,
                        table,
                        pk,
                        Column::Row,
                        Change::Set(Value::Null),
                        next_alive(cl),
                    )?;
                }

                let cell_key = CellKey::new(table.clone(), pk.clone(), column.clone());
                let counter = overlay.counter(&cell_key)? + 1;
                emit(
                    &mut overlay,
                    &mut records,
                    table,
                    pk,
                    column,
                    Change::Set(value.clone()),
                    counter,
                )?;
            }
            LocalOp::Delete { table, pk } => {
                schema.check(table, &Column::Row)?;
                let row_key = CellKey::row(table.clone(), pk.clone());
                let cl = overlay.counter(&row_key)?;
                if is_alive(cl) {
                    emit(
                        &mut overlay,
                        &mut records,
                        table,
                        pk,
                        Column::Row,
                        Change::Delete,
                        next_deleted(cl),
                    )?;
                }
            }
        }
    }

    let mut next_clock = clock.clone();
    let mut report = ApplyReport::default();
    if !records.is_empty() {
        next_clock.advance(site, version)?;
        report.applied = records.len();
        report.advanced.push((site, version));
    }

    Ok(Plan {
        records,
        winners: overlay.into_winners(),
        clock: next_clock,
        report,
    })
}

/// `seq` of the next record in a local version.
fn next_seq(len: usize) -> Result<u32, StoreError> {
    u32::try_from(len).map_err(|_| StoreError::CommitTooLarge(len))
}

/// Cut an ascending record stream into one page without splitting a version.
pub fn take_page<I>(records: I, limit: Option<usize>) -> Vec<ChangeRecord>
where
    I: IntoIterator<Item = ChangeRecord>,
{
    let mut page: Vec<ChangeRecord> = Vec::new();
    for rec in records {
        if let (Some(limit), Some(last)) = (limit, page.last()) {
            if page.len() >= limit && last.version != rec.version {
                break;
            }
        }
        page.push(rec);
    }
    page
}

/// Build a visible row from its winning records.
///
/// Returns `None` when the row marker is missing or deleted.
pub fn assemble_row<'a, I>(winners: I) -> Option<Row>
where
    I: IntoIterator<Item = &'a ChangeRecord>,
{
    let mut alive = false;
    let mut row = Row::new();
    for rec in winners {
        match (&rec.column, &rec.change) {
            (Column::Row, _) => alive = is_alive(rec.counter),
            (Column::Named(name), Change::Set(value)) => {
                row.insert(name.clone(), value.clone());
            }
            (Column::Named(_), Change::Delete) => {}
        }
    }
    alive.then_some(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new().table("recipes", ["name", "servings"])
    }

    fn none(_: &CellKey) -> Result<Option<ChangeRecord>, StoreError> {
        Ok(None)
    }

    fn cell(site: SiteId, version: u64, seq: u32, counter: u64, value: &str) -> ChangeRecord {
        ChangeRecord {
            table: "recipes".into(),
            pk: "r1".into(),
            column: Column::named("name"),
            change: Change::Set(Value::from(value)),
            site_id: site,
            version,
            seq,
            counter,
        }
    }

    #[test]
    fn test_seq_numbering_bounded() {
        assert_eq!(next_seq(0).unwrap(), 0);
        assert_eq!(next_seq(u32::MAX as usize).unwrap(), u32::MAX);
        #[cfg(target_pointer_width = "64")]
        assert!(matches!(
            next_seq(u32::MAX as usize + 1),
            Err(StoreError::CommitTooLarge(_))
        ));
    }

    #[test]
    fn test_local_insert_emits_row_marker() {
        let clock = VersionClock::new(SiteId::new());
        let mut writes = LocalWrites::new();
        writes.set("recipes", "r1", "name", "Soup");

        let plan = plan_local(&writes, &clock, &schema(), none).unwrap();
        assert_eq!(plan.records.len(), 2);
        assert_eq!(plan.records[0].column, Column::Row);
        assert_eq!(plan.records[0].counter, 1);
        assert_eq!(plan.records[1].counter, 1);
        assert_eq!(plan.records[1].seq, 1);
        assert_eq!(plan.clock.local_version(), 1);
    }

    #[test]
    fn test_local_delete_of_unknown_row_is_empty() {
        let clock = VersionClock::new(SiteId::new());
        let mut writes = LocalWrites::new();
        writes.delete("recipes", "missing");

        let plan = plan_local(&writes, &clock, &schema(), none).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.clock.local_version(), 0);
    }

    #[test]
    fn test_local_delete_then_set_resurrects() {
        let clock = VersionClock::new(SiteId::new());
        let mut writes = LocalWrites::new();
        writes
            .set("recipes", "r1", "name", "Soup")
            .delete("recipes", "r1")
            .set("recipes", "r1", "name", "Stew");

        let plan = plan_local(&writes, &clock, &schema(), none).unwrap();
        let row_counters: Vec<u64> = plan
            .records
            .iter()
            .filter(|r| r.column == Column::Row)
            .map(|r| r.counter)
            .collect();
        assert_eq!(row_counters, vec![1, 2, 3]);
        assert!(assemble_row(plan.winners.iter()).is_some());
    }

    #[test]
    fn test_local_unknown_column_rejected() {
        let clock = VersionClock::new(SiteId::new());
        let mut writes = LocalWrites::new();
        writes.set("recipes", "r1", "colour", "red");
        let err = plan_local(&writes, &clock, &schema(), none).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn test_apply_drops_known_versions() {
        let remote = SiteId::new();
        let mut clock = VersionClock::new(SiteId::new());
        clock.advance(remote, 2).unwrap();

        let batch = vec![cell(remote, 1, 0, 1, "a"), cell(remote, 3, 0, 2, "b")];
        let plan = plan_apply(&batch, &clock, &schema(), none).unwrap();
        assert_eq!(plan.report.duplicates, 1);
        assert_eq!(plan.report.applied, 1);
        assert_eq!(plan.report.advanced, vec![(remote, 3)]);
    }

    #[test]
    fn test_apply_drops_repeats_within_batch() {
        let remote = SiteId::new();
        let clock = VersionClock::new(SiteId::new());
        let rec = cell(remote, 1, 0, 1, "a");
        let plan = plan_apply(&[rec.clone(), rec], &clock, &schema(), none).unwrap();
        assert_eq!(plan.records.len(), 1);
        assert_eq!(plan.report.duplicates, 1);
    }

    #[test]
    fn test_apply_own_site_is_duplicate() {
        let local = SiteId::new();
        let clock = VersionClock::new(local);
        let plan = plan_apply(&[cell(local, 9, 0, 1, "a")], &clock, &schema(), none).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.report.duplicates, 1);
    }

    #[test]
    fn test_apply_loser_is_logged_not_visible() {
        let a = SiteId::from_bytes([0x0A; 16]);
        let b = SiteId::from_bytes([0x0B; 16]);
        let clock = VersionClock::new(SiteId::new());
        let existing = cell(a, 5, 0, 2, "kept");
        let lookup = |_: &CellKey| Ok(Some(existing.clone()));

        let plan = plan_apply(&[cell(b, 7, 0, 1, "lost")], &clock, &schema(), lookup).unwrap();
        assert_eq!(plan.report.superseded, 1);
        assert_eq!(plan.records.len(), 1);
        assert!(plan.winners.is_empty());
    }

    #[test]
    fn test_apply_schema_mismatch_rejects_batch() {
        let remote = SiteId::new();
        let clock = VersionClock::new(SiteId::new());
        let mut bad = cell(remote, 2, 0, 1, "x");
        bad.table = "persons".into();
        let err = plan_apply(&[cell(remote, 1, 0, 1, "a"), bad], &clock, &schema(), none)
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn test_apply_order_independent_winner() {
        let a = SiteId::from_bytes([0x01; 16]);
        let b = SiteId::from_bytes([0x02; 16]);
        let clock = VersionClock::new(SiteId::new());
        let x = cell(a, 5, 0, 1, "x");
        let y = cell(b, 3, 0, 1, "y");

        let forward = plan_apply(&[x.clone(), y.clone()], &clock, &schema(), none).unwrap();
        let backward = plan_apply(&[y, x], &clock, &schema(), none).unwrap();
        assert_eq!(forward.winners, backward.winners);
        assert_eq!(forward.winners[0].value(), Some(&Value::from("x")));
    }

    #[test]
    fn test_take_page_keeps_version_whole() {
        let site = SiteId::new();
        let records = vec![
            cell(site, 1, 0, 1, "a"),
            cell(site, 2, 0, 1, "b"),
            cell(site, 2, 1, 1, "c"),
            cell(site, 3, 0, 1, "d"),
        ];
        let page = take_page(records.clone(), Some(2));
        assert_eq!(page.len(), 3);
        assert_eq!(page.last().unwrap().version, 2);

        assert_eq!(take_page(records.clone(), None).len(), 4);
        assert_eq!(take_page(records, Some(1)).len(), 1);
    }

    #[test]
    fn test_assemble_row_hidden_when_deleted() {
        let site = SiteId::new();
        let mut marker = cell(site, 1, 0, 2, "");
        marker.column = Column::Row;
        marker.change = Change::Delete;
        let name = cell(site, 1, 1, 1, "Soup");
        assert!(assemble_row([&marker, &name]).is_none());
        assert!(assemble_row([&name]).is_none());
    }
}
