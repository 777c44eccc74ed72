//! The storage engine facade.
//!
//! `HorizonDb` wires the catalog, the commit log, the partition manager
//! and the background scheduler together and exposes the operations the
//! RPC layer dispatches: schema creation, inserts, bulk writes and range
//! selects. Payloads arrive already decoded; nothing here parses a wire
//! format.
//!
//! ## Write path
//!
//! ```text
//! insert -> validate -> sort by (timestamp, type) -> split by partition
//!        -> commit log append (group commit) -> partition write -> ack
//! ```
//!
//! ## Startup
//!
//! Open replays every retained commit log segment into the partitions
//! before accepting writes. Partitions ignore replayed records their data
//! files already contain (the replay position check), so replay after any
//! crash, clean shutdown or repeated restart converges to the same state.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use crate::catalog::{Catalog, DatabaseDefinition, TimeSeriesDefinition};
use crate::commitlog::{replay, CommitLog, ReplayPosition};
use crate::config::Config;
use crate::errdata;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::model::range::RangeSet;
use crate::model::record::Record;
use crate::model::varint::{read_uvarint, write_uvarint};
use crate::scheduler::Scheduler;
use crate::series::manager::PartitionManager;
use crate::series::meta::PartitionId;
use crate::series::partition::{ReadFilter, WriteOrigin};

const LOCK_FILE: &str = "horizondb.lock";

pub struct HorizonDb {
    config: Arc<Config>,
    catalog: Catalog,
    manager: Arc<PartitionManager>,
    commit_log: Arc<CommitLog>,
    scheduler: Scheduler,
    _lock: FileLock,
}

impl HorizonDb {
    /// Opens the engine: lock the directory, load the catalog, replay the
    /// commit log into the partitions, then start the writer thread and
    /// the background tasks. Must be called on a tokio runtime.
    pub fn open(config: Config) -> Result<HorizonDb> {
        let config = Arc::new(config);
        std::fs::create_dir_all(&config.data_dir)?;
        let lock = FileLock::lock(config.data_dir.join(LOCK_FILE))?;

        let catalog = Catalog::open(&config.data_dir)?;
        let manager = PartitionManager::open(config.clone())?;

        let definitions: HashMap<(String, String), Arc<TimeSeriesDefinition>> = catalog
            .all_series()?
            .into_iter()
            .map(|(database, definition)| {
                ((database, definition.name.clone()), Arc::new(definition))
            })
            .collect();

        let replayed = replay::replay(
            &config.commitlog_dir(),
            0,
            config.truncate_corrupt_tail,
            |position, payload| apply_replayed(&manager, &definitions, position, payload),
        )?;
        if replayed > 0 {
            tracing::info!(frames = replayed, "commit log replay complete");
        }

        let commit_log = Arc::new(CommitLog::open(&config)?);
        let scheduler = Scheduler::new();
        manager.start(&scheduler, commit_log.clone());

        tracing::info!(dir = %config.data_dir.display(), "horizondb open");
        Ok(HorizonDb {
            config,
            catalog,
            manager,
            commit_log,
            scheduler,
            _lock: lock,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn create_database(&self, definition: DatabaseDefinition) -> Result<()> {
        self.catalog.create_database(definition)
    }

    pub fn create_time_series(
        &self,
        database: &str,
        definition: TimeSeriesDefinition,
    ) -> Result<()> {
        self.catalog.create_time_series(database, definition)
    }

    /// Inserts a single record.
    pub fn insert(&self, database: &str, series: &str, record: Record) -> Result<()> {
        self.write_records(database, series, vec![record])
    }

    /// Writes a batch of records, which may span multiple partitions.
    pub fn bulk_write(&self, database: &str, series: &str, records: Vec<Record>) -> Result<()> {
        self.write_records(database, series, records)
    }

    /// Range select over one series: every record whose timestamp falls
    /// into `range_set` and passes the filter, in non decreasing
    /// timestamp order.
    pub fn select(
        &self,
        database: &str,
        series: &str,
        range_set: RangeSet,
        filter: ReadFilter,
    ) -> Result<Box<dyn Iterator<Item = Result<Record>> + Send>> {
        let definition = Arc::new(self.catalog.series(database, series)?);
        self.manager
            .read(database, series, &definition, &range_set, &filter)
    }

    /// Force flushes every live partition to disk.
    pub fn flush(&self) -> Result<()> {
        self.manager.flush_all_blocking()
    }

    /// Stops the background tasks and the commit log writer. Unflushed
    /// mem series data stays in the commit log and is replayed on the
    /// next open.
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.shutdown().await?;
        self.commit_log.shutdown()?;
        Ok(())
    }

    fn write_records(&self, database: &str, series: &str, mut records: Vec<Record>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let definition = Arc::new(self.catalog.series(database, series)?);

        // The block codec stores records ordered by (timestamp, type);
        // establish that order once, up front.
        records.sort_by_key(|record| (record.timestamp(), record.record_type()));

        // Validate the whole batch before anything reaches the commit
        // log, so a rejected record never leaves a frame behind that
        // replay would have to reject again.
        let field_types = definition.field_types();
        for record in &records {
            let record_type = record.record_type();
            let types = field_types.get(record_type).ok_or_else(|| {
                Error::InvalidRecord(format!(
                    "record type {record_type} not defined for series {series}"
                ))
            })?;
            record.validate(types)?;
        }

        // One frame per partition per chunk. Chunks are bounded well below
        // the slab size so a frame always fits a fresh mem series, on the
        // live path and on replay alike.
        let chunk_limit = (self.config.mem_series_size / 8).max(4096);
        let mut scratch = Vec::new();

        let mut start = 0;
        while start < records.len() {
            let range = definition.partition_range(records[start].timestamp());
            let mut end = start;
            let mut bytes = 0;
            while end < records.len() && range.contains(records[end].timestamp()) {
                scratch.clear();
                records[end].write_to(&mut scratch)?;
                bytes += scratch.len();
                end += 1;
                if bytes >= chunk_limit {
                    break;
                }
            }
            let batch = &records[start..end];

            let payload = encode_wal_payload(database, series, batch)?;
            let future = self.commit_log.append(payload)?;

            let id = PartitionId::new(database, series, range);
            self.manager
                .write(id, &definition, batch, WriteOrigin::Live(future))?;
            start = end;
        }
        Ok(())
    }
}

/// Routes one replayed commit log frame into its partition. Records the
/// partitions reject as invalid were refused before ever being applied
/// live, so they are skipped rather than failing the startup.
fn apply_replayed(
    manager: &Arc<PartitionManager>,
    definitions: &HashMap<(String, String), Arc<TimeSeriesDefinition>>,
    position: ReplayPosition,
    payload: &[u8],
) -> Result<()> {
    let (database, series, records) = decode_wal_payload(payload, definitions)?;
    let definition = definitions
        .get(&(database.clone(), series.clone()))
        .ok_or_else(|| Error::UnknownTimeSeries(series.clone()))?;

    let mut start = 0;
    while start < records.len() {
        let range = definition.partition_range(records[start].timestamp());
        let end = records[start..]
            .iter()
            .position(|record| !range.contains(record.timestamp()))
            .map_or(records.len(), |offset| start + offset);

        let id = PartitionId::new(&database, &series, range);
        match manager.write(
            id,
            definition,
            &records[start..end],
            WriteOrigin::Replay(position),
        ) {
            Ok(()) => {}
            Err(Error::InvalidRecord(msg)) => {
                tracing::warn!(%position, "skipping invalid replayed records: {msg}");
            }
            Err(Error::ChecksumMismatch(msg)) => {
                // Frame CRCs were already verified by the segment reader,
                // so this is a corrupt data file. Isolate the damage to
                // its partition; reads against it surface the error.
                tracing::error!(%position, "partition unavailable during replay: {msg}");
            }
            Err(e) => return Err(e),
        }
        start = end;
    }
    Ok(())
}

/// Commit log payload: the routing key plus the records with absolute
/// field values.
///
/// ```text
/// dbLen:varint | db | seriesLen:varint | series | count:varint | record*
/// ```
fn encode_wal_payload(database: &str, series: &str, records: &[Record]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64 + records.len() * 16);
    write_uvarint(&mut buf, database.len() as u64)?;
    buf.extend_from_slice(database.as_bytes());
    write_uvarint(&mut buf, series.len() as u64)?;
    buf.extend_from_slice(series.as_bytes());
    write_uvarint(&mut buf, records.len() as u64)?;
    for record in records {
        record.write_to(&mut buf)?;
    }
    Ok(buf)
}

fn decode_wal_payload(
    payload: &[u8],
    definitions: &HashMap<(String, String), Arc<TimeSeriesDefinition>>,
) -> Result<(String, String, Vec<Record>)> {
    let mut reader = payload;

    let database = read_wal_string(&mut reader)?;
    let series = read_wal_string(&mut reader)?;
    let definition = definitions
        .get(&(database.clone(), series.clone()))
        .ok_or_else(|| Error::UnknownTimeSeries(series.clone()))?
        .clone();

    let count = read_uvarint(&mut reader)? as usize;
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        records.push(Record::read_from(&mut reader, |record_type| {
            definition
                .record_type(record_type)
                .map(|rt| rt.field_types())
        })?);
    }
    Ok((database, series, records))
}

fn read_wal_string(reader: &mut &[u8]) -> Result<String> {
    let len = read_uvarint(reader)? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| errdata!("invalid utf-8 in commit log payload: {e}"))
}
