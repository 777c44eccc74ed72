//! The partition manager.
//!
//! Owns the partition catalogue (the B+tree), the cache of live
//! [`TimeSeriesPartition`] objects, the flush worker pool and the memory
//! accounting. Partitions never call back into the manager; they emit
//! events into the channels the manager drains (see
//! [`PartitionChannels`]), which keeps the ownership graph a tree.
//!
//! ## Responsibilities
//!
//! - Resolve or create partitions on writes, load them from the catalogue
//!   on reads, and evict idle fully flushed ones past the cache cap.
//! - Drain flush requests through a bounded tokio worker pool; duplicate
//!   requests for one partition collapse onto the pending one.
//! - Track total mem series usage: above the soft cap the largest
//!   partition gets flushed, above the hard cap writers block until usage
//!   falls back under the soft cap.
//! - Drive commit log retention: segments are deleted once no live
//!   partition holds unflushed data from them, and too many retained
//!   segments force flush the partitions pinning the oldest one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crossbeam_skiplist::SkipMap;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::Mutex as AsyncMutex;

use crate::btree::BTree;
use crate::catalog::TimeSeriesDefinition;
use crate::commitlog::CommitLog;
use crate::config::Config;
use crate::error::Result;
use crate::model::range::RangeSet;
use crate::model::record::Record;
use crate::scheduler::{BackgroundTask, Scheduler};
use crate::series::meta::{PartitionId, PartitionMetaData};
use crate::series::partition::{
    FlushRequest, MetadataStore, PartitionChannels, ReadFilter, TimeSeriesPartition, WriteOrigin,
};

pub struct PartitionManager {
    config: Arc<Config>,
    btree: BTree<PartitionId, PartitionMetaData>,
    partitions: SkipMap<PartitionId, Arc<TimeSeriesPartition>>,
    channels: PartitionChannels,
    flush_rx: AsyncMutex<UnboundedReceiver<FlushRequest>>,
    memory_rx: AsyncMutex<UnboundedReceiver<i64>>,
    segment_rx: AsyncMutex<UnboundedReceiver<(PartitionId, Option<u64>)>>,
    /// Partitions reported as holding non persisted data, with the first
    /// segment that data lives in. Fed by the segment change channel.
    dirty: Mutex<HashMap<PartitionId, u64>>,
    memory_usage: AtomicI64,
    memory_gate: Condvar,
    memory_gate_lock: Mutex<()>,
    access_clock: AtomicU64,
}

impl PartitionManager {
    pub fn open(config: Arc<Config>) -> Result<Arc<PartitionManager>> {
        std::fs::create_dir_all(&config.data_dir)?;
        let btree = BTree::open(&config.data_dir)?;

        let (memory_tx, memory_rx) = mpsc::unbounded_channel();
        let (segment_tx, segment_rx) = mpsc::unbounded_channel();
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();

        Ok(Arc::new(PartitionManager {
            config,
            btree,
            partitions: SkipMap::new(),
            channels: PartitionChannels {
                memory: memory_tx,
                segments: segment_tx,
                flush: flush_tx,
            },
            flush_rx: AsyncMutex::new(flush_rx),
            memory_rx: AsyncMutex::new(memory_rx),
            segment_rx: AsyncMutex::new(segment_rx),
            dirty: Mutex::new(HashMap::new()),
            memory_usage: AtomicI64::new(0),
            memory_gate: Condvar::new(),
            memory_gate_lock: Mutex::new(()),
            access_clock: AtomicU64::new(0),
        }))
    }

    /// Starts the flush workers, the event drains and the periodic
    /// maintenance tasks.
    pub fn start(self: &Arc<Self>, scheduler: &Scheduler, commit_log: Arc<CommitLog>) {
        for _ in 0..self.config.flush_workers.max(1) {
            let manager = self.clone();
            let mut shutdown = scheduler.subscribe();
            scheduler.spawn("flush-worker", async move {
                loop {
                    let request = {
                        let mut rx = manager.flush_rx.lock().await;
                        tokio::select! {
                            _ = shutdown.recv() => return Ok(()),
                            request = rx.recv() => request,
                        }
                    };
                    let Some(request) = request else {
                        return Ok(());
                    };
                    manager.run_flush(request).await;
                }
            });
        }

        let manager = self.clone();
        let mut shutdown = scheduler.subscribe();
        scheduler.spawn("memory-monitor", async move {
            loop {
                let delta = {
                    let mut rx = manager.memory_rx.lock().await;
                    tokio::select! {
                        _ = shutdown.recv() => return Ok(()),
                        delta = rx.recv() => delta,
                    }
                };
                let Some(delta) = delta else {
                    return Ok(());
                };
                manager.apply_memory_delta(delta);
            }
        });

        let manager = self.clone();
        let mut shutdown = scheduler.subscribe();
        scheduler.spawn("segment-tracker", async move {
            loop {
                let event = {
                    let mut rx = manager.segment_rx.lock().await;
                    tokio::select! {
                        _ = shutdown.recv() => return Ok(()),
                        event = rx.recv() => event,
                    }
                };
                let Some((id, segment)) = event else {
                    return Ok(());
                };
                let mut dirty = manager.dirty.lock()?;
                match segment {
                    Some(segment) => {
                        dirty.insert(id, segment);
                    }
                    None => {
                        dirty.remove(&id);
                    }
                }
            }
        });

        scheduler.register(Arc::new(SegmentRetentionTask {
            manager: self.clone(),
            commit_log,
        }));
        scheduler.register(Arc::new(EvictionTask {
            manager: self.clone(),
        }));
    }

    /// Writes a batch into its partition, creating the partition (and its
    /// catalogue entry) on first use. Live writes respect the memory hard
    /// cap; replay does not, since nothing can flush concurrently during
    /// startup anyway.
    pub fn write(
        &self,
        id: PartitionId,
        definition: &Arc<TimeSeriesDefinition>,
        records: &[Record],
        origin: WriteOrigin,
    ) -> Result<()> {
        if matches!(origin, WriteOrigin::Live(_)) {
            self.wait_for_memory()?;
        }
        let partition = self.partition_for_write(id, definition)?;
        partition.write(records, origin)
    }

    /// Merged range read across every partition of the series overlapping
    /// the range set, in catalogue (time) order.
    pub fn read(
        &self,
        database: &str,
        series: &str,
        definition: &Arc<TimeSeriesDefinition>,
        range_set: &RangeSet,
        filter: &ReadFilter,
    ) -> Result<Box<dyn Iterator<Item = Result<Record>> + Send>> {
        if range_set.is_empty() {
            return Ok(Box::new(std::iter::empty()));
        }

        let from = PartitionId::series_start(database, series);
        let to = PartitionId::series_end(database, series);

        let mut partitions = Vec::new();
        for entry in self.btree.range(&from, &to)? {
            let (id, metadata) = entry?;
            if !range_set.overlaps(&metadata.range) {
                continue;
            }
            partitions.push(self.partition_for_read(id, &metadata, definition)?);
        }

        let range_set = range_set.clone();
        let filter = filter.clone();
        Ok(Box::new(partitions.into_iter().flat_map(move |partition| {
            match partition.read(&range_set, &filter) {
                Ok(iter) => iter,
                Err(e) => Box::new(std::iter::once(Err(e)))
                    as Box<dyn Iterator<Item = Result<Record>> + Send>,
            }
        })))
    }

    fn partition_for_write(
        &self,
        id: PartitionId,
        definition: &Arc<TimeSeriesDefinition>,
    ) -> Result<Arc<TimeSeriesPartition>> {
        if let Some(entry) = self.partitions.get(&id) {
            let partition = entry.value().clone();
            partition.touch(self.tick());
            return Ok(partition);
        }
        let metadata = match self.btree.get(&id)? {
            Some(metadata) => metadata,
            None => {
                // First write into this time range: the catalogue entry is
                // the partition's birth certificate.
                let metadata = PartitionMetaData::new(id.range);
                self.btree.insert(id.clone(), metadata.clone())?;
                tracing::info!(partition = %id, "created partition");
                metadata
            }
        };
        self.partition_for_read(id, &metadata, definition)
    }

    fn partition_for_read(
        &self,
        id: PartitionId,
        metadata: &PartitionMetaData,
        definition: &Arc<TimeSeriesDefinition>,
    ) -> Result<Arc<TimeSeriesPartition>> {
        if let Some(entry) = self.partitions.get(&id) {
            let partition = entry.value().clone();
            partition.touch(self.tick());
            return Ok(partition);
        }
        let partition = Arc::new(TimeSeriesPartition::open(
            self.config.clone(),
            id.clone(),
            definition.clone(),
            metadata,
            self.channels.clone(),
        )?);
        partition.touch(self.tick());
        // A concurrent open of the same partition may have won the race;
        // whoever is in the map is the one everybody uses.
        Ok(self
            .partitions
            .get_or_insert(id, partition)
            .value()
            .clone())
    }

    fn tick(&self) -> u64 {
        self.access_clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn run_flush(&self, request: FlushRequest) {
        let Some(entry) = self.partitions.get(&request.id) else {
            return;
        };
        let partition = entry.value().clone();

        let mut delay = Duration::from_millis(50);
        for attempt in 1..=3 {
            match partition.flush(request.force, self) {
                Ok(()) => return,
                Err(e) if attempt < 3 => {
                    tracing::warn!(
                        partition = %request.id,
                        attempt,
                        error = %e,
                        "flush failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    tracing::error!(partition = %request.id, error = %e, "flush failed");
                }
            }
        }
    }

    fn apply_memory_delta(&self, delta: i64) {
        let total = self.memory_usage.fetch_add(delta, Ordering::SeqCst) + delta;
        let total = total.max(0) as usize;

        if total > self.config.memory_soft_limit {
            if let Some(partition) = self.largest_partition() {
                tracing::info!(
                    total,
                    partition = %partition.id(),
                    "memory above soft limit, flushing largest partition"
                );
                partition.request_flush(true);
            }
        } else {
            self.memory_gate.notify_all();
        }
    }

    fn largest_partition(&self) -> Option<Arc<TimeSeriesPartition>> {
        self.partitions
            .iter()
            .map(|entry| entry.value().clone())
            .max_by_key(|partition| partition.memory_usage())
            .filter(|partition| partition.memory_usage() > 0)
    }

    /// Blocks the calling writer while usage is over the hard cap, until
    /// flushes bring it back under the soft cap. Backpressure, not error.
    fn wait_for_memory(&self) -> Result<()> {
        let usage = self.memory_usage.load(Ordering::SeqCst).max(0) as usize;
        if usage <= self.config.memory_hard_limit {
            return Ok(());
        }
        tracing::warn!(usage, "memory above hard limit, blocking writer");
        let mut guard = self.memory_gate_lock.lock()?;
        loop {
            let usage = self.memory_usage.load(Ordering::SeqCst).max(0) as usize;
            if usage <= self.config.memory_soft_limit {
                return Ok(());
            }
            let (g, _) = self
                .memory_gate
                .wait_timeout(guard, Duration::from_millis(20))?;
            guard = g;
        }
    }

    /// The oldest commit log segment any live partition still needs for
    /// recovery, straight from the partitions themselves.
    pub fn first_referenced_segment(&self) -> Option<u64> {
        self.partitions
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .first_segment_containing_non_persisted_data()
            })
            .min()
    }

    /// Force flushes every partition still holding data from `segment` or
    /// older, so the segments become deletable.
    pub fn force_flush_segment(&self, segment: u64) -> Result<()> {
        let targets: Vec<PartitionId> = {
            let dirty = self.dirty.lock()?;
            dirty
                .iter()
                .filter(|(_, first)| **first <= segment)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in targets {
            if let Some(entry) = self.partitions.get(&id) {
                entry.value().request_flush(true);
            }
        }
        Ok(())
    }

    /// Synchronously force flushes every live partition. Used on clean
    /// shutdown and by tests that need files on disk right now.
    pub fn flush_all_blocking(&self) -> Result<()> {
        for entry in self.partitions.iter() {
            entry.value().flush(true, self)?;
        }
        Ok(())
    }

    pub fn memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::SeqCst).max(0) as usize
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    fn evict_idle_partitions(&self) {
        let cap = self.config.partition_cache_size;
        if self.partitions.len() <= cap {
            return;
        }
        let mut candidates: Vec<(u64, PartitionId)> = self
            .partitions
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .first_segment_containing_non_persisted_data()
                    .is_none()
            })
            .map(|entry| (entry.value().last_access(), entry.key().clone()))
            .collect();
        candidates.sort();

        let excess = self.partitions.len() - cap;
        for (_, id) in candidates.into_iter().take(excess) {
            tracing::debug!(partition = %id, "evicting idle partition");
            self.partitions.remove(&id);
        }
    }
}

impl MetadataStore for PartitionManager {
    fn save(&self, id: &PartitionId, metadata: &PartitionMetaData) -> Result<()> {
        self.btree.insert(id.clone(), metadata.clone())
    }
}

/// Deletes commit log segments no live partition references, and relieves
/// segment pressure by force flushing the partitions pinning the oldest
/// one.
struct SegmentRetentionTask {
    manager: Arc<PartitionManager>,
    commit_log: Arc<CommitLog>,
}

#[async_trait::async_trait]
impl BackgroundTask for SegmentRetentionTask {
    fn name(&self) -> &'static str {
        "segment-retention"
    }

    fn interval(&self) -> Duration {
        self.manager.config.scheduler.segment_cleanup_interval
    }

    async fn run(&self) -> Result<()> {
        let floor = self
            .manager
            .first_referenced_segment()
            .unwrap_or_else(|| self.commit_log.current_segment());
        let deleted = self.commit_log.delete_segments_below(floor)?;
        if deleted > 0 {
            tracing::debug!(deleted, floor, "reclaimed commit log segments");
        }

        let retained = self.commit_log.segments()?.len();
        if retained > self.manager.config.max_segments {
            if let Some(oldest) = self.manager.first_referenced_segment() {
                tracing::info!(retained, oldest, "too many segments, forcing flush");
                self.manager.force_flush_segment(oldest)?;
            }
        }
        Ok(())
    }
}

/// Evicts least recently used fully flushed partitions once the cache
/// exceeds its cap. Readers holding snapshots are unaffected.
struct EvictionTask {
    manager: Arc<PartitionManager>,
}

#[async_trait::async_trait]
impl BackgroundTask for EvictionTask {
    fn name(&self) -> &'static str {
        "partition-eviction"
    }

    fn interval(&self) -> Duration {
        self.manager.config.scheduler.eviction_interval
    }

    async fn run(&self) -> Result<()> {
        self.manager.evict_idle_partitions();
        Ok(())
    }
}
