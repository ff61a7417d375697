//! RocksDB-backed change store.
//!
//! Column families:
//! - `cells`   — winning record per cell (LZ4 compressed, keyed by table/pk/column)
//! - `changes` — full change log (LZ4 compressed, keyed by site:version:seq)
//! - `clock`   — version cursor (site → u64 big-endian)
//! - `meta`    — local site id
//!
//! Every local commit and every applied batch is one `WriteBatch`: cells,
//! log entries and cursor move together or not at all.
//!
//! ```text
//! changes key  ┌──────────────┬──────────────┬──────────┐
//!              │ site_id 16 B │ version 8 BE │ seq 4 BE │
//!              └──────────────┴──────────────┴──────────┘
//! cells key    ┌─────────┬───────┬─────────┬────┬──────────────────────┐
//!              │ len 4BE │ table │ len 4BE │ pk │ 0x00 | 0x01 + column │
//!              └─────────┴───────┴─────────┴────┴──────────────────────┘
//! ```

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

use crate::change::{CellKey, ChangeRecord, Column};
use crate::clock::VersionClock;
use crate::schema::Schema;
use crate::site::SiteId;
use crate::store::merge::{assemble_row, plan_apply, plan_local, take_page, Plan};
use crate::store::{
    digest, ApplyReport, ChangeStore, ChangesetSink, ChangesetSource, LocalWrites, Row,
    StoreError,
};

const CF_CELLS: &str = "cells";
const CF_CHANGES: &str = "changes";
const CF_CLOCK: &str = "clock";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_CELLS, CF_CHANGES, CF_CLOCK, CF_META];

const META_SITE_ID: &[u8] = b"site_id";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Shared block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Fsync every commit (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pantry_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Persistent change store.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    schema: Schema,
    /// Cached cursor. Held for the whole of every transaction.
    clock: Mutex<VersionClock>,
    local_version_tx: watch::Sender<u64>,
}

impl RocksStore {
    /// Open the store, creating it and minting a site id on first use.
    pub fn open(config: StoreConfig, schema: Schema) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let site_id = Self::load_or_mint_site(&db, config.sync_writes)?;
        let clock = Self::load_clock(&db, site_id)?;
        let (local_version_tx, _) = watch::channel(clock.local_version());

        log::info!(
            "Opened store at {} (site {}, {} known sites, local version {})",
            config.path.display(),
            site_id.short(),
            clock.len(),
            clock.local_version()
        );

        Ok(Self {
            db,
            config,
            schema,
            clock: Mutex::new(clock),
            local_version_tx,
        })
    }

    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_CELLS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(3);
            }
            CF_CHANGES => {
                // Values are already LZ4 frames
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            _ => {
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
        }

        opts
    }

    fn load_or_mint_site(
        db: &DBWithThreadMode<SingleThreaded>,
        sync: bool,
    ) -> Result<SiteId, StoreError> {
        let cf = db
            .cf_handle(CF_META)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{CF_META}' not found")))?;

        if let Some(bytes) = db.get_cf(&cf, META_SITE_ID)? {
            let raw: [u8; 16] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| StoreError::DeserializationError("Invalid site id".into()))?;
            return Ok(SiteId::from_bytes(raw));
        }

        let site_id = SiteId::new();
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(sync);
        db.put_cf_opt(&cf, META_SITE_ID, site_id.as_bytes(), &write_opts)?;
        log::info!("Minted site id {site_id}");
        Ok(site_id)
    }

    fn load_clock(
        db: &DBWithThreadMode<SingleThreaded>,
        local: SiteId,
    ) -> Result<VersionClock, StoreError> {
        let cf = db
            .cf_handle(CF_CLOCK)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{CF_CLOCK}' not found")))?;

        let mut clock = VersionClock::new(local);
        for item in db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            let raw: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::DeserializationError("Invalid clock key".into()))?;
            let version = decode_u64(&value)?;
            clock.advance(SiteId::from_bytes(raw), version)?;
        }
        Ok(clock)
    }

    // ─── Transactions ─────────────────────────────────────────────────

    fn lock_clock(&self) -> MutexGuard<'_, VersionClock> {
        self.clock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Persist a plan in one write batch, then publish its cursor.
    fn commit_plan(&self, clock: &mut VersionClock, plan: Plan) -> Result<(), StoreError> {
        let cf_cells = self.cf(CF_CELLS)?;
        let cf_changes = self.cf(CF_CHANGES)?;
        let cf_clock = self.cf(CF_CLOCK)?;

        let mut batch = WriteBatch::default();
        for rec in &plan.records {
            let key = change_key(rec.site_id, rec.version, rec.seq);
            batch.put_cf(&cf_changes, key, encode_record(rec)?);
        }
        for rec in &plan.winners {
            batch.put_cf(&cf_cells, cell_key(&rec.cell_key()), encode_record(rec)?);
        }
        for (site, version) in plan.clock.sites() {
            if clock.get(&site) != version {
                batch.put_cf(&cf_clock, site.as_bytes(), version.to_be_bytes());
            }
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        *clock = plan.clock;
        Ok(())
    }

    fn load_cell(&self, key: &CellKey) -> Result<Option<ChangeRecord>, StoreError> {
        let cf = self.cf(CF_CELLS)?;
        match self.db.get_cf(&cf, cell_key(key))? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Winning records whose cell key starts with `prefix`, in key order.
    fn scan_cells(&self, prefix: &[u8]) -> Result<Vec<ChangeRecord>, StoreError> {
        let cf = self.cf(CF_CELLS)?;
        let mut records = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            records.push(decode_record(&value)?);
        }
        Ok(records)
    }

    // ─── Maintenance ──────────────────────────────────────────────────

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl ChangesetSource for RocksStore {
    fn changes_since(
        &self,
        site: SiteId,
        since: u64,
        limit: Option<usize>,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        if since == u64::MAX {
            return Ok(Vec::new());
        }
        let cf = self.cf(CF_CHANGES)?;
        let start = change_key(site, since + 1, 0);
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward));

        let mut failure = None;
        let records = iter.map_while(|item| {
            let decoded = item
                .map_err(StoreError::from)
                .and_then(|(key, value)| {
                    if key.starts_with(site.as_bytes()) {
                        decode_record(&value).map(Some)
                    } else {
                        Ok(None)
                    }
                });
            match decoded {
                Ok(rec) => rec,
                Err(e) => {
                    failure = Some(e);
                    None
                }
            }
        });
        let page = take_page(records, limit);

        match failure {
            Some(e) => Err(e),
            None => Ok(page),
        }
    }
}

impl ChangesetSink for RocksStore {
    fn apply(&self, batch: &[ChangeRecord]) -> Result<ApplyReport, StoreError> {
        let mut clock = self.lock_clock();
        let plan = plan_apply(batch, &clock, &self.schema, |key| self.load_cell(key))?;
        let report = plan.report.clone();
        if !plan.is_empty() {
            self.commit_plan(&mut clock, plan)?;
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

impl ChangeStore for RocksStore {
    fn site_id(&self) -> SiteId {
        self.lock_clock().local_site()
    }

    fn local_version(&self) -> u64 {
        self.lock_clock().local_version()
    }

    fn cursor(&self, site: &SiteId) -> u64 {
        self.lock_clock().get(site)
    }

    fn clock(&self) -> VersionClock {
        self.lock_clock().clone()
    }

    fn commit(&self, writes: LocalWrites) -> Result<u64, StoreError> {
        let version = {
            let mut clock = self.lock_clock();
            let plan = plan_local(&writes, &clock, &self.schema, |key| self.load_cell(key))?;
            if plan.is_empty() {
                return Ok(clock.local_version());
            }
            self.commit_plan(&mut clock, plan)?;
            clock.local_version()
        };
        self.local_version_tx.send_replace(version);
        Ok(version)
    }

    fn row(&self, table: &str, pk: &str) -> Result<Option<Row>, StoreError> {
        let records = self.scan_cells(&row_prefix(table, pk))?;
        Ok(assemble_row(&records))
    }

    fn rows(&self, table: &str) -> Result<Vec<(String, Row)>, StoreError> {
        let mut grouped: BTreeMap<String, Vec<ChangeRecord>> = BTreeMap::new();
        for rec in self.scan_cells(&table_prefix(table))? {
            grouped.entry(rec.pk.clone()).or_default().push(rec);
        }
        Ok(grouped
            .into_iter()
            .filter_map(|(pk, recs)| assemble_row(&recs).map(|row| (pk, row)))
            .collect())
    }

    fn watch_local_version(&self) -> watch::Receiver<u64> {
        self.local_version_tx.subscribe()
    }

    fn checksum(&self) -> Result<u64, StoreError> {
        let clock = self.lock_clock();
        let mut cells = BTreeMap::new();
        for rec in self.scan_cells(&[])? {
            cells.insert(rec.cell_key(), rec);
        }
        digest(cells.values(), &clock)
    }
}

// ─── Key and value codecs ─────────────────────────────────────────────

fn change_key(site: SiteId, version: u64, seq: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(28);
    key.extend_from_slice(site.as_bytes());
    key.extend_from_slice(&version.to_be_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn push_str(key: &mut Vec<u8>, s: &str) {
    key.extend_from_slice(&(s.len() as u32).to_be_bytes());
    key.extend_from_slice(s.as_bytes());
}

fn table_prefix(table: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + table.len());
    push_str(&mut key, table);
    key
}

fn row_prefix(table: &str, pk: &str) -> Vec<u8> {
    let mut key = table_prefix(table);
    push_str(&mut key, pk);
    key
}

fn cell_key(cell: &CellKey) -> Vec<u8> {
    let mut key = row_prefix(&cell.table, &cell.pk);
    match &cell.column {
        Column::Row => key.push(0x00),
        Column::Named(name) => {
            key.push(0x01);
            key.extend_from_slice(name.as_bytes());
        }
    }
    key
}

fn encode_record(rec: &ChangeRecord) -> Result<Vec<u8>, StoreError> {
    let bytes = bincode::serde::encode_to_vec(rec, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&bytes))
}

fn decode_record(bytes: &[u8]) -> Result<ChangeRecord, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    let (rec, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(rec)
}

fn decode_u64(bytes: &[u8]) -> Result<u64, StoreError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::DeserializationError("Invalid u64 value".into()))?;
    Ok(u64::from_be_bytes(raw))
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
