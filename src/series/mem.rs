//! In-memory time series buffer.
//!
//! A `MemTimeSeries` holds the records written to a partition since its
//! last flush. It is an immutable snapshot: a write produces a new value
//! sharing the sealed block chunks of the old one, and the partition swaps
//! the new snapshot into place only after the commit log acknowledged the
//! batch. Readers that grabbed the old snapshot keep iterating it
//! untouched.
//!
//! Record bytes live in the partition's slab (see
//! [`SlabAllocator`](crate::series::slab::SlabAllocator)); a snapshot only
//! carries cheap [`Bytes`] handles plus the running last-record-per-type
//! vector the delta codec needs to keep appending to the open block.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::commitlog::ReplayPosition;
use crate::errdata;
use crate::error::{Error, Result};
use crate::model::field::FieldType;
use crate::model::range::{RangeSet, TimeRange};
use crate::model::record::Record;
use crate::series::block::{encode_record, RecordIter};
use crate::series::slab::SlabAllocator;

/// One block of an in-memory series: its chunk list plus the header
/// fields that will be stamped onto it at flush time.
#[derive(Clone, Debug, Default)]
pub struct MemBlock {
    range: Option<TimeRange>,
    record_count: u64,
    size: usize,
    chunks: Vec<Bytes>,
}

impl MemBlock {
    fn add(&mut self, chunk: Bytes, timestamp: i64) {
        self.size += chunk.len();
        self.chunks.push(chunk);
        self.record_count += 1;
        self.range = Some(match self.range {
            Some(range) => range.extend(timestamp),
            None => TimeRange::new(timestamp, timestamp),
        });
    }

    pub fn range(&self) -> Option<TimeRange> {
        self.range
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.size);
        for chunk in &self.chunks {
            payload.extend_from_slice(chunk);
        }
        payload
    }
}

/// An immutable snapshot of a partition's unflushed records.
#[derive(Clone, Debug)]
pub struct MemTimeSeries {
    blocks: Vec<MemBlock>,
    /// Delta bases for the open block, one per record type.
    last_records: Vec<Record>,
    field_types: Vec<Vec<FieldType>>,
    replay_position: Option<ReplayPosition>,
    first_segment: Option<u64>,
    block_size: usize,
    max_blocks: usize,
    full: bool,
}

impl MemTimeSeries {
    pub fn new(field_types: Vec<Vec<FieldType>>, block_size: usize, max_blocks: usize) -> Self {
        let last_records = zero_records(&field_types);
        MemTimeSeries {
            blocks: Vec::new(),
            last_records,
            field_types,
            replay_position: None,
            first_segment: None,
            block_size,
            max_blocks,
            full: false,
        }
    }

    /// Appends a batch, returning the successor snapshot. The records must
    /// already be validated and time ordered. Fails with
    /// [`Error::OutOfSpace`] when the slab cannot hold the batch, in which
    /// case `self` is untouched and the caller rotates to a fresh mem
    /// series.
    pub fn write(
        &self,
        allocator: &mut SlabAllocator,
        records: &[Record],
        position: ReplayPosition,
    ) -> Result<MemTimeSeries> {
        if self.full {
            return Err(Error::OutOfSpace);
        }
        let mut next = self.clone();
        let mut scratch = Vec::new();

        for record in records {
            let record_type = record.record_type();
            if record_type >= next.last_records.len() {
                return Err(errdata!("record type {record_type} out of range"));
            }

            if next.blocks.last().is_none_or(|b| b.size >= next.block_size) {
                // Seal the open block and restart the delta chains so every
                // block decodes on its own.
                next.blocks.push(MemBlock::default());
                next.last_records = zero_records(&next.field_types);
            }

            scratch.clear();
            encode_record(record, &next.last_records[record_type], &mut scratch)?;
            let chunk = allocator.allocate(&scratch)?;

            let index = next.blocks.len() - 1;
            next.blocks[index].add(chunk, record.timestamp());
            next.last_records[record_type] = record.clone();
        }

        next.replay_position = Some(position);
        next.first_segment = next.first_segment.or(Some(position.segment));
        if next.blocks.len() >= next.max_blocks
            && next.blocks[next.blocks.len() - 1].size >= next.block_size
        {
            next.full = true;
        }
        Ok(next)
    }

    /// Marks the snapshot full so a force flush picks it up.
    pub fn seal(&self) -> MemTimeSeries {
        let mut sealed = self.clone();
        sealed.full = true;
        sealed
    }

    /// True when the block count cap is reached or the slab refused the
    /// last allocation attempt.
    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn record_count(&self) -> u64 {
        self.blocks.iter().map(|b| b.record_count).sum()
    }

    /// Bytes of record data buffered in this snapshot.
    pub fn memory_usage(&self) -> usize {
        self.blocks.iter().map(|b| b.size).sum()
    }

    /// Position of the most recent durable write in this snapshot.
    pub fn replay_position(&self) -> Option<ReplayPosition> {
        self.replay_position
    }

    /// First commit log segment holding data not yet flushed to the file.
    pub fn first_segment(&self) -> Option<u64> {
        self.first_segment
    }

    pub fn blocks(&self) -> &[MemBlock] {
        &self.blocks
    }

    /// Streams the records of every block overlapping `range_set`, in
    /// write order.
    pub fn iter(&self, range_set: &RangeSet) -> MemRecordIter {
        let blocks = self
            .blocks
            .iter()
            .filter(|b| b.range.is_some_and(|r| range_set.overlaps(&r)))
            .map(|b| (b.payload(), b.record_count))
            .collect();
        MemRecordIter {
            blocks,
            current: None,
            field_types: self.field_types.clone(),
        }
    }
}

fn zero_records(field_types: &[Vec<FieldType>]) -> Vec<Record> {
    field_types
        .iter()
        .enumerate()
        .map(|(index, types)| Record::zero(index, types))
        .collect()
}

/// Lazy record iterator over a mem series snapshot. Blocks decode one at a
/// time; in-memory payloads skip the CRC pass, which only guards the disk
/// path.
pub struct MemRecordIter {
    blocks: VecDeque<(Vec<u8>, u64)>,
    current: Option<RecordIter>,
    field_types: Vec<Vec<FieldType>>,
}

impl Iterator for MemRecordIter {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(iter) = &mut self.current {
                if let Some(record) = iter.next() {
                    return Some(record);
                }
            }
            let (payload, count) = self.blocks.pop_front()?;
            self.current = Some(RecordIter::new(payload, count, &self.field_types));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::field::Field;

    fn field_types() -> Vec<Vec<FieldType>> {
        vec![vec![FieldType::Timestamp, FieldType::Int]]
    }

    fn point(ts: i64, value: i64) -> Record {
        Record::new(0, vec![Field::Timestamp(ts), Field::Int(value)])
    }

    fn position(offset: u64) -> ReplayPosition {
        ReplayPosition::new(1, offset)
    }

    #[test]
    fn test_write_and_iterate() {
        let mut allocator = SlabAllocator::new(64 * 1024);
        let mem = MemTimeSeries::new(field_types(), 4096, 4);

        let records: Vec<_> = (0..100).map(|i| point(1000 + i, i)).collect();
        let mem = mem.write(&mut allocator, &records, position(0)).unwrap();

        let read: Vec<_> = mem
            .iter(&RangeSet::all())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(read, records);
        assert_eq!(mem.record_count(), 100);
        assert_eq!(mem.replay_position(), Some(position(0)));
        assert_eq!(mem.first_segment(), Some(1));
    }

    #[test]
    fn test_snapshot_isolation() {
        let mut allocator = SlabAllocator::new(64 * 1024);
        let empty = MemTimeSeries::new(field_types(), 4096, 4);

        let first = empty
            .write(&mut allocator, &[point(1, 10)], position(0))
            .unwrap();
        let second = first
            .write(&mut allocator, &[point(2, 20)], position(10))
            .unwrap();

        // The older snapshot never sees the later write.
        assert_eq!(first.record_count(), 1);
        assert_eq!(second.record_count(), 2);
        let old: Vec<_> = first.iter(&RangeSet::all()).collect::<Result<_>>().unwrap();
        assert_eq!(old, vec![point(1, 10)]);
    }

    #[test]
    fn test_blocks_seal_at_target_size() {
        let mut allocator = SlabAllocator::new(64 * 1024);
        let mut mem = MemTimeSeries::new(field_types(), 32, 1024);

        for i in 0..64 {
            mem = mem
                .write(&mut allocator, &[point(i, i)], position(i as u64))
                .unwrap();
        }
        assert!(mem.blocks().len() > 1, "expected multiple sealed blocks");
        for block in &mem.blocks()[..mem.blocks().len() - 1] {
            assert!(block.size() >= 32);
        }

        // Order survives the block boundaries.
        let read: Vec<_> = mem.iter(&RangeSet::all()).collect::<Result<_>>().unwrap();
        let timestamps: Vec<_> = read.iter().map(|r| r.timestamp()).collect();
        let mut sorted = timestamps.clone();
        sorted.sort();
        assert_eq!(timestamps, sorted);
    }

    #[test]
    fn test_out_of_space_leaves_snapshot_intact() {
        let mut allocator = SlabAllocator::new(32);
        let mem = MemTimeSeries::new(field_types(), 16, 4);

        let mem = mem
            .write(&mut allocator, &[point(1, 1)], position(0))
            .unwrap();
        let count_before = mem.record_count();

        let big_batch: Vec<_> = (2..200).map(|i| point(i, i)).collect();
        let result = mem.write(&mut allocator, &big_batch, position(1));
        assert_eq!(result.unwrap_err(), Error::OutOfSpace);
        assert_eq!(mem.record_count(), count_before);
    }

    #[test]
    fn test_full_flag() {
        let mut allocator = SlabAllocator::new(64 * 1024);
        let mut mem = MemTimeSeries::new(field_types(), 8, 2);

        let mut i = 0;
        while !mem.is_full() {
            mem = mem
                .write(&mut allocator, &[point(i, i)], position(i as u64))
                .unwrap();
            i += 1;
        }
        assert!(mem.blocks().len() >= 2);
        assert!(mem.write(&mut allocator, &[point(i, i)], position(i as u64)).is_err());
    }

    #[test]
    fn test_range_filtered_iteration_skips_blocks() {
        let mut allocator = SlabAllocator::new(64 * 1024);
        let mut mem = MemTimeSeries::new(field_types(), 16, 1024);
        for i in 0..50 {
            mem = mem
                .write(&mut allocator, &[point(i * 10, i)], position(i as u64))
                .unwrap();
        }
        let filtered: Vec<_> = mem
            .iter(&RangeSet::between(0, 40))
            .collect::<Result<_>>()
            .unwrap();
        // Only blocks overlapping the range are decoded; the records
        // themselves are range filtered by the partition read path.
        assert!(!filtered.is_empty());
        assert!(filtered.len() < 50);
    }

    #[test]
    fn test_seal() {
        let mem = MemTimeSeries::new(field_types(), 4096, 4);
        assert!(!mem.is_full());
        assert!(mem.seal().is_full());
    }
}
