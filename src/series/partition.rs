//! A partition of one time series.
//!
//! The partition is the only component that serialises writers: a write
//! encodes into the latest mem series under the partition mutex, waits for
//! the commit log acknowledgement, then publishes the new state into a
//! single swappable cell. Readers load the cell once and iterate the
//! immutable snapshot they got, never blocking on writers.
//!
//! State transitions always flow through [`TimeSeriesElements`], an
//! immutable `(file, mem series list)` pair:
//!
//! ```text
//!   write  : (file, [m0, m1])        -> (file, [m0, m1'])
//!   rotate : (file, [m0, full])      -> (file, [m0, full, fresh'])
//!   flush  : (file, [full, open])    -> (file + full, [open])
//!   force  : (file, [full, open])    -> (file + full + open, [])
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc::UnboundedSender;

use crate::catalog::TimeSeriesDefinition;
use crate::commitlog::{ReplayFuture, ReplayPosition};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::field::FieldType;
use crate::model::range::RangeSet;
use crate::model::record::Record;
use crate::series::file::TimeSeriesFile;
use crate::series::mem::MemTimeSeries;
use crate::series::meta::{PartitionId, PartitionMetaData};
use crate::series::slab::SlabAllocator;

/// Where the partition metadata gets saved after a flush. Implemented by
/// the partition manager; the indirection keeps the partition free of a
/// back-pointer to its owner.
pub trait MetadataStore: Send + Sync {
    fn save(&self, id: &PartitionId, metadata: &PartitionMetaData) -> Result<()>;
}

/// A flush request emitted towards the manager's worker pool.
#[derive(Clone, Debug)]
pub struct FlushRequest {
    pub id: PartitionId,
    pub force: bool,
}

/// The event queues a partition reports into. The manager owns the
/// receiving ends; a partition never calls back into the manager.
#[derive(Clone)]
pub struct PartitionChannels {
    /// Mem usage deltas, in bytes.
    pub memory: UnboundedSender<i64>,
    /// New first-segment-containing-non-persisted-data values.
    pub segments: UnboundedSender<(PartitionId, Option<u64>)>,
    /// Flush requests.
    pub flush: UnboundedSender<FlushRequest>,
}

/// Origin of a write: a live client write waiting on its commit log
/// acknowledgement, or a replayed commit log record carrying the position
/// it was originally assigned.
pub enum WriteOrigin {
    Live(ReplayFuture),
    Replay(ReplayPosition),
}

/// Record filters applied by the read path after delta decoding.
#[derive(Clone, Default)]
pub struct ReadFilter {
    record_types: Option<Vec<usize>>,
    predicate: Option<Arc<dyn Fn(&Record) -> bool + Send + Sync>>,
}

impl ReadFilter {
    pub fn all() -> ReadFilter {
        ReadFilter::default()
    }

    /// Restricts the result to the given record types.
    pub fn with_record_types(mut self, record_types: Vec<usize>) -> ReadFilter {
        self.record_types = Some(record_types);
        self
    }

    /// Adds a predicate evaluated against each decoded record.
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&Record) -> bool + Send + Sync + 'static,
    ) -> ReadFilter {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    fn matches(&self, record: &Record) -> bool {
        if let Some(types) = &self.record_types {
            if !types.contains(&record.record_type()) {
                return false;
            }
        }
        match &self.predicate {
            Some(predicate) => predicate(record),
            None => true,
        }
    }
}

/// The immutable state of a partition: its data file plus the mem series
/// snapshots not yet folded into it, oldest first. Timestamps in the file
/// precede those in `mems[0]`, which precede those in `mems[1]`, and so
/// on; only the last mem series accepts writes.
pub struct TimeSeriesElements {
    file: Arc<TimeSeriesFile>,
    mems: Vec<Arc<MemTimeSeries>>,
}

impl TimeSeriesElements {
    fn new(file: TimeSeriesFile) -> TimeSeriesElements {
        TimeSeriesElements {
            file: Arc::new(file),
            mems: Vec::new(),
        }
    }

    fn write(
        &self,
        allocator: &mut SlabAllocator,
        records: &[Record],
        position: ReplayPosition,
        field_types: &[Vec<FieldType>],
        config: &Config,
    ) -> Result<TimeSeriesElements> {
        let mut mems = self.mems.clone();

        let fresh = || {
            MemTimeSeries::new(
                field_types.to_vec(),
                config.block_size,
                config.max_blocks_per_mem_series,
            )
        };

        let new_last = match mems.last().cloned() {
            Some(last) if !last.is_full() => {
                match last.write(allocator, records, position) {
                    Ok(next) => {
                        mems.pop();
                        next
                    }
                    Err(Error::OutOfSpace) => {
                        // The slab refused the batch: seal the mem series in
                        // place and restart on a fresh slab.
                        mems.pop();
                        mems.push(Arc::new(last.seal()));
                        allocator.release();
                        fresh().write(allocator, records, position)?
                    }
                    Err(e) => return Err(e),
                }
            }
            _ => {
                allocator.release();
                fresh().write(allocator, records, position)?
            }
        };
        mems.push(Arc::new(new_last));

        Ok(TimeSeriesElements {
            file: self.file.clone(),
            mems,
        })
    }

    /// Folds the full mem series into the file. `None` when there was
    /// nothing to flush.
    fn flush(&self) -> Result<Option<TimeSeriesElements>> {
        let flushable: Vec<Arc<MemTimeSeries>> =
            self.mems.iter().filter(|m| m.is_full()).cloned().collect();
        if flushable.is_empty() {
            return Ok(None);
        }
        let file = self.file.append(&flushable)?;
        let mems = self
            .mems
            .iter()
            .filter(|m| !m.is_full())
            .cloned()
            .collect();
        Ok(Some(TimeSeriesElements {
            file: Arc::new(file),
            mems,
        }))
    }

    /// Folds every mem series into the file, the open one included.
    fn force_flush(&self) -> Result<Option<TimeSeriesElements>> {
        let flushable: Vec<Arc<MemTimeSeries>> = self
            .mems
            .iter()
            .filter(|m| !m.is_empty())
            .cloned()
            .collect();
        if flushable.is_empty() {
            return Ok(None);
        }
        let file = self.file.append(&flushable)?;
        Ok(Some(TimeSeriesElements {
            file: Arc::new(file),
            mems: Vec::new(),
        }))
    }

    fn memory_usage(&self) -> usize {
        self.mems.iter().map(|m| m.memory_usage()).sum()
    }

    fn first_segment(&self) -> Option<u64> {
        self.mems.iter().filter_map(|m| m.first_segment()).min()
    }

    /// The newest position applied to this partition, durable or pending
    /// flush. Replay uses it to skip records it already holds.
    fn last_replay_position(&self) -> Option<ReplayPosition> {
        self.mems
            .last()
            .and_then(|m| m.replay_position())
            .or_else(|| self.file.replay_position())
    }

    fn metadata(&self, id: &PartitionId) -> PartitionMetaData {
        PartitionMetaData {
            range: id.range,
            file_size: self.file.size(),
            block_positions: self.file.block_positions().clone(),
            replay_position: self.file.replay_position(),
        }
    }
}

struct WriteState {
    allocator: SlabAllocator,
    last_timestamp: Option<i64>,
}

/// One partition of one time series. See the module docs for the
/// concurrency contract.
pub struct TimeSeriesPartition {
    id: PartitionId,
    definition: Arc<TimeSeriesDefinition>,
    field_types: Vec<Vec<FieldType>>,
    config: Arc<Config>,
    channels: PartitionChannels,
    write_state: Mutex<WriteState>,
    elements: RwLock<Arc<TimeSeriesElements>>,
    flush_pending: AtomicBool,
    last_access: AtomicU64,
}

impl TimeSeriesPartition {
    pub fn open(
        config: Arc<Config>,
        id: PartitionId,
        definition: Arc<TimeSeriesDefinition>,
        metadata: &PartitionMetaData,
        channels: PartitionChannels,
    ) -> Result<TimeSeriesPartition> {
        let file = TimeSeriesFile::open(
            &config,
            &id.database,
            &id.series,
            definition.compression,
            definition.timestamp_unit,
            metadata,
        )?;

        // Newest timestamp already on disk, for write order validation.
        let last_timestamp = metadata.block_positions.keys().map(|r| r.upper).max();

        Ok(TimeSeriesPartition {
            field_types: definition.field_types(),
            write_state: Mutex::new(WriteState {
                allocator: SlabAllocator::new(config.mem_series_size),
                last_timestamp,
            }),
            elements: RwLock::new(Arc::new(TimeSeriesElements::new(file))),
            flush_pending: AtomicBool::new(false),
            last_access: AtomicU64::new(0),
            id,
            definition,
            config,
            channels,
        })
    }

    pub fn id(&self) -> &PartitionId {
        &self.id
    }

    pub fn definition(&self) -> &Arc<TimeSeriesDefinition> {
        &self.definition
    }

    fn snapshot(&self) -> Result<Arc<TimeSeriesElements>> {
        Ok(self.elements.read()?.clone())
    }

    /// Writes a validated batch of records. Live writes block until the
    /// commit log made the batch durable; only then does the new snapshot
    /// become visible, so a published record is always recoverable.
    pub fn write(&self, records: &[Record], origin: WriteOrigin) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.validate(records)?;

        let mut state = self.write_state.lock()?;
        let old = self.snapshot()?;

        // A replayed frame the partition already holds is dropped before
        // any further checks; its timestamps are naturally older than the
        // watermark and must not trip the ordering validation below.
        if let WriteOrigin::Replay(position) = &origin {
            if old
                .last_replay_position()
                .is_some_and(|applied| *position <= applied)
            {
                tracing::debug!(
                    partition = %self.id,
                    %position,
                    "skipping replayed records already applied"
                );
                return Ok(());
            }
        }

        // Time must move forwards: the file format appends blocks in
        // timestamp order and cannot interleave.
        let mut previous = state.last_timestamp;
        for record in records {
            let timestamp = record.timestamp();
            if previous.is_some_and(|p| timestamp < p) {
                return Err(Error::InvalidRecord(format!(
                    "timestamp {timestamp} is older than the newest record in partition {}",
                    self.id
                )));
            }
            previous = Some(timestamp);
        }

        let position = match origin {
            WriteOrigin::Live(future) => future.wait()?,
            WriteOrigin::Replay(position) => position,
        };

        let new = Arc::new(old.write(
            &mut state.allocator,
            records,
            position,
            &self.field_types,
            &self.config,
        )?);

        *self.elements.write()? = new.clone();
        state.last_timestamp = previous;

        self.notify(&old, &new);

        if new.mems.iter().any(|m| m.is_full()) {
            tracing::debug!(partition = %self.id, "mem series full, requesting flush");
            self.request_flush(false);
        }
        Ok(())
    }

    /// Lock-free snapshot read over the file and every mem series, in
    /// timestamp order, with the filters applied after delta decoding.
    pub fn read(
        &self,
        range_set: &RangeSet,
        filter: &ReadFilter,
    ) -> Result<Box<dyn Iterator<Item = Result<Record>> + Send>> {
        if range_set.is_empty() {
            return Ok(Box::new(std::iter::empty()));
        }
        let snapshot = self.snapshot()?;

        let mut sources: Vec<Box<dyn Iterator<Item = Result<Record>> + Send>> = Vec::new();
        sources.push(Box::new(
            snapshot.file.iter(range_set, self.field_types.clone())?,
        ));
        for mem in &snapshot.mems {
            sources.push(Box::new(mem.iter(range_set)));
        }

        let range_set = range_set.clone();
        let filter = filter.clone();
        Ok(Box::new(sources.into_iter().flatten().filter(
            move |item| match item {
                Ok(record) => {
                    range_set.contains(record.timestamp()) && filter.matches(record)
                }
                Err(_) => true,
            },
        )))
    }

    /// Folds flushable mem series into the data file and persists the new
    /// partition metadata. On failure the published state is untouched and
    /// the commit log segments stay referenced.
    pub fn flush(&self, force: bool, store: &dyn MetadataStore) -> Result<()> {
        let result = self.flush_inner(force, store);
        self.flush_pending.store(false, Ordering::SeqCst);
        result
    }

    fn flush_inner(&self, force: bool, store: &dyn MetadataStore) -> Result<()> {
        let mut state = self.write_state.lock()?;
        let old = self.snapshot()?;

        let flushed = if force { old.force_flush()? } else { old.flush()? };
        let Some(new) = flushed else {
            tracing::debug!(partition = %self.id, "nothing to flush");
            return Ok(());
        };
        let new = Arc::new(new);

        store.save(&self.id, &new.metadata(&self.id))?;

        *self.elements.write()? = new.clone();
        if force {
            state.allocator.release();
        }
        drop(state);

        tracing::debug!(
            partition = %self.id,
            force,
            file_size = new.file.size(),
            "flushed partition"
        );
        self.notify(&old, &new);
        Ok(())
    }

    /// Emits memory and segment deltas towards the manager. Send failures
    /// mean the manager is gone, which only happens at shutdown.
    fn notify(&self, old: &TimeSeriesElements, new: &TimeSeriesElements) {
        let old_usage = old.memory_usage() as i64;
        let new_usage = new.memory_usage() as i64;
        if old_usage != new_usage {
            let _ = self.channels.memory.send(new_usage - old_usage);
        }
        let old_segment = old.first_segment();
        let new_segment = new.first_segment();
        if old_segment != new_segment {
            let _ = self
                .channels
                .segments
                .send((self.id.clone(), new_segment));
        }
    }

    /// Requests an asynchronous flush; duplicate requests collapse until
    /// the pending one completes.
    pub fn request_flush(&self, force: bool) {
        if force || !self.flush_pending.swap(true, Ordering::SeqCst) {
            let _ = self.channels.flush.send(FlushRequest {
                id: self.id.clone(),
                force,
            });
        }
    }

    /// The oldest commit log segment holding data not yet in the file, or
    /// `None` when everything is persisted.
    pub fn first_segment_containing_non_persisted_data(&self) -> Option<u64> {
        self.elements
            .read()
            .ok()
            .and_then(|elements| elements.first_segment())
    }

    pub fn memory_usage(&self) -> usize {
        self.elements
            .read()
            .map(|elements| elements.memory_usage())
            .unwrap_or(0)
    }

    pub fn touch(&self, tick: u64) {
        self.last_access.store(tick, Ordering::Relaxed);
    }

    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    fn validate(&self, records: &[Record]) -> Result<()> {
        for record in records {
            let record_type = record.record_type();
            if record_type >= self.field_types.len() {
                return Err(Error::InvalidRecord(format!(
                    "record type {record_type} not defined for series {}",
                    self.id.series
                )));
            }
            record.validate(&self.field_types[record_type])?;
            let timestamp = record.timestamp();
            if !self.id.range.contains(timestamp) {
                return Err(Error::InvalidRecord(format!(
                    "timestamp {timestamp} outside partition range {}",
                    self.id.range
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FieldDefinition, RecordTypeDefinition, TimeSeriesDefinition};
    use crate::model::field::{Field, TimeUnit};
    use std::collections::HashMap;

    struct MemoryStore {
        saved: Mutex<HashMap<PartitionId, PartitionMetaData>>,
    }

    impl MemoryStore {
        fn new() -> MemoryStore {
            MemoryStore {
                saved: Mutex::new(HashMap::new()),
            }
        }
    }

    impl MetadataStore for MemoryStore {
        fn save(&self, id: &PartitionId, metadata: &PartitionMetaData) -> Result<()> {
            self.saved
                .lock()
                .unwrap()
                .insert(id.clone(), metadata.clone());
            Ok(())
        }
    }

    fn definition() -> Arc<TimeSeriesDefinition> {
        Arc::new(TimeSeriesDefinition::new(
            "DAX",
            TimeUnit::Milliseconds,
            vec![RecordTypeDefinition::new(
                "trade",
                vec![FieldDefinition::new("volume", FieldType::Int)],
            )],
        ))
    }

    fn channels() -> (
        PartitionChannels,
        tokio::sync::mpsc::UnboundedReceiver<i64>,
        tokio::sync::mpsc::UnboundedReceiver<(PartitionId, Option<u64>)>,
        tokio::sync::mpsc::UnboundedReceiver<FlushRequest>,
    ) {
        let (memory_tx, memory_rx) = tokio::sync::mpsc::unbounded_channel();
        let (segment_tx, segment_rx) = tokio::sync::mpsc::unbounded_channel();
        let (flush_tx, flush_rx) = tokio::sync::mpsc::unbounded_channel();
        (
            PartitionChannels {
                memory: memory_tx,
                segments: segment_tx,
                flush: flush_tx,
            },
            memory_rx,
            segment_rx,
            flush_rx,
        )
    }

    fn open_partition(dir: &std::path::Path) -> (TimeSeriesPartition, PartitionChannels) {
        let config = Arc::new(Config::new(dir).mem_series_size(64 * 1024).block_size(512));
        let definition = definition();
        let range = definition.partition_range(0);
        let id = PartitionId::new("db", "DAX", range);
        let metadata = PartitionMetaData::new(range);
        let (channels, memory_rx, segment_rx, flush_rx) = channels();
        // Keep the receivers alive for the duration of the test.
        std::mem::forget((memory_rx, segment_rx, flush_rx));
        let partition =
            TimeSeriesPartition::open(config, id, definition, &metadata, channels.clone())
                .unwrap();
        (partition, channels)
    }

    fn trade(ts: i64, volume: i64) -> Record {
        Record::new(0, vec![Field::Timestamp(ts), Field::Int(volume)])
    }

    fn replayed(offset: u64) -> WriteOrigin {
        WriteOrigin::Replay(ReplayPosition::new(1, offset))
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (partition, _channels) = open_partition(dir.path());

        let records: Vec<_> = (0..100).map(|i| trade(i, i * 10)).collect();
        partition.write(&records, replayed(0)).unwrap();

        let read: Vec<_> = partition
            .read(&RangeSet::all(), &ReadFilter::all())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(read, records);
    }

    #[test]
    fn test_reader_snapshot_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let (partition, _channels) = open_partition(dir.path());

        partition.write(&[trade(1, 1)], replayed(0)).unwrap();
        let before = partition
            .read(&RangeSet::all(), &ReadFilter::all())
            .unwrap();

        partition.write(&[trade(2, 2)], replayed(100)).unwrap();
        let after: Vec<_> = partition
            .read(&RangeSet::all(), &ReadFilter::all())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        let before: Vec<_> = before.collect::<Result<_>>().unwrap();
        assert_eq!(before, vec![trade(1, 1)]);
        assert_eq!(after, vec![trade(1, 1), trade(2, 2)]);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (partition, _channels) = open_partition(dir.path());

        partition.write(&[trade(100, 1)], replayed(50)).unwrap();
        // Replaying the same or an older position is a no-op, even when
        // the resent frame's timestamps are older than the partition's
        // newest record; idempotence wins over ordering validation.
        partition.write(&[trade(100, 1)], replayed(50)).unwrap();
        partition.write(&[trade(50, 1)], replayed(10)).unwrap();

        let read: Vec<_> = partition
            .read(&RangeSet::all(), &ReadFilter::all())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(read, vec![trade(100, 1)]);
    }

    #[test]
    fn test_rejects_out_of_range_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let (partition, _channels) = open_partition(dir.path());

        let outside = 2 * 24 * 60 * 60 * 1000;
        assert!(matches!(
            partition.write(&[trade(outside, 1)], replayed(0)),
            Err(Error::InvalidRecord(_))
        ));
    }

    #[test]
    fn test_rejects_time_regression() {
        let dir = tempfile::tempdir().unwrap();
        let (partition, _channels) = open_partition(dir.path());

        partition.write(&[trade(100, 1)], replayed(0)).unwrap();
        assert!(matches!(
            partition.write(&[trade(50, 1)], replayed(10)),
            Err(Error::InvalidRecord(_))
        ));
        // Equal timestamps are allowed.
        partition.write(&[trade(100, 2)], replayed(20)).unwrap();
    }

    #[test]
    fn test_flush_persists_and_keeps_readable() {
        let dir = tempfile::tempdir().unwrap();
        let (partition, _channels) = open_partition(dir.path());
        let store = MemoryStore::new();

        let records: Vec<_> = (0..100).map(|i| trade(i, i)).collect();
        partition.write(&records, replayed(0)).unwrap();

        partition.flush(true, &store).unwrap();

        let saved = store.saved.lock().unwrap();
        let metadata = saved.get(partition.id()).expect("metadata saved");
        assert!(metadata.file_size > 0);
        assert!(!metadata.block_positions.is_empty());
        assert_eq!(
            metadata.replay_position,
            Some(ReplayPosition::new(1, 0))
        );
        drop(saved);

        assert_eq!(partition.first_segment_containing_non_persisted_data(), None);
        assert_eq!(partition.memory_usage(), 0);

        let read: Vec<_> = partition
            .read(&RangeSet::all(), &ReadFilter::all())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(read, records);
    }

    #[test]
    fn test_record_type_filter_and_predicate() {
        let dir = tempfile::tempdir().unwrap();
        let (partition, _channels) = open_partition(dir.path());

        let records: Vec<_> = (0..10).map(|i| trade(i, i)).collect();
        partition.write(&records, replayed(0)).unwrap();

        let filter = ReadFilter::all().with_predicate(|record| {
            matches!(record.field(1), Some(Field::Int(v)) if v % 2 == 0)
        });
        let read: Vec<_> = partition
            .read(&RangeSet::all(), &filter)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(read.len(), 5);

        let none = ReadFilter::all().with_record_types(vec![7]);
        let read: Vec<_> = partition
            .read(&RangeSet::all(), &none)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert!(read.is_empty());
    }

    #[test]
    fn test_inverted_range_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (partition, _channels) = open_partition(dir.path());
        partition.write(&[trade(1, 1)], replayed(0)).unwrap();

        let read: Vec<_> = partition
            .read(&RangeSet::between(100, 50), &ReadFilter::all())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert!(read.is_empty());
    }
}
