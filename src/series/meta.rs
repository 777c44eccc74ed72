//! Partition identity and metadata.
//!
//! `PartitionId` is the B+tree key ordering the partition catalogue;
//! `PartitionMetaData` is the value, describing the committed state of the
//! partition's data file. Both use the same hand written big-endian wire
//! format as the rest of the on-disk structures.

use std::collections::BTreeMap;
use std::io::Read;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::btree;
use crate::commitlog::ReplayPosition;
use crate::errdata;
use crate::error::Result;
use crate::model::range::TimeRange;
use crate::model::varint::{read_uvarint, write_uvarint};

/// Identifies one partition of one time series: `(database, series, time
/// range)`, ordered by database, series, then range lower bound. The
/// ordering is what lets a select scan a series' partitions in time order
/// with a single B+tree range iteration.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionId {
    pub database: String,
    pub series: String,
    pub range: TimeRange,
}

impl PartitionId {
    pub fn new(database: impl Into<String>, series: impl Into<String>, range: TimeRange) -> Self {
        PartitionId {
            database: database.into(),
            series: series.into(),
            range,
        }
    }

    /// Smallest id for the series, used as a range scan lower bound.
    pub fn series_start(database: &str, series: &str) -> PartitionId {
        PartitionId::new(database, series, TimeRange::new(i64::MIN, i64::MIN))
    }

    /// Largest id for the series, used as a range scan upper bound.
    pub fn series_end(database: &str, series: &str) -> PartitionId {
        PartitionId::new(database, series, TimeRange::new(i64::MAX, i64::MAX))
    }
}

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}{}", self.database, self.series, self.range)
    }
}

fn write_string(buf: &mut Vec<u8>, value: &str) -> Result<()> {
    write_uvarint(buf, value.len() as u64)?;
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

fn read_string<R: Read>(reader: &mut R) -> Result<String> {
    let len = read_uvarint(reader)? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| errdata!("invalid utf-8 in stored name: {e}"))
}

impl btree::Key for PartitionId {
    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        write_string(buf, &self.database)?;
        write_string(buf, &self.series)?;
        buf.write_i64::<BigEndian>(self.range.lower)?;
        buf.write_i64::<BigEndian>(self.range.upper)?;
        Ok(())
    }

    fn decode_from<R: Read>(reader: &mut R) -> Result<PartitionId> {
        let database = read_string(reader)?;
        let series = read_string(reader)?;
        let lower = reader.read_i64::<BigEndian>()?;
        let upper = reader.read_i64::<BigEndian>()?;
        Ok(PartitionId {
            database,
            series,
            range: TimeRange::new(lower, upper),
        })
    }
}

/// Offset and length of one block inside a data file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockPosition {
    pub offset: u64,
    pub length: u64,
}

impl BlockPosition {
    pub fn new(offset: u64, length: u64) -> BlockPosition {
        BlockPosition { offset, length }
    }
}

/// The committed state of a partition, stored in the B+tree.
///
/// `file_size` is the number of bytes of the data file covered by
/// `block_positions`; anything beyond it is a torn append and is truncated
/// on open. `replay_position` is the commit log coordinate of the last
/// record durably in the file, which makes commit log replay idempotent.
#[derive(Clone, Debug, PartialEq)]
pub struct PartitionMetaData {
    pub range: TimeRange,
    pub file_size: u64,
    pub block_positions: BTreeMap<TimeRange, BlockPosition>,
    pub replay_position: Option<ReplayPosition>,
}

impl PartitionMetaData {
    /// Metadata for a freshly created partition with no on-disk data.
    pub fn new(range: TimeRange) -> PartitionMetaData {
        PartitionMetaData {
            range,
            file_size: 0,
            block_positions: BTreeMap::new(),
            replay_position: None,
        }
    }
}

impl btree::Value for PartitionMetaData {
    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_i64::<BigEndian>(self.range.lower)?;
        buf.write_i64::<BigEndian>(self.range.upper)?;
        write_uvarint(buf, self.file_size)?;
        write_uvarint(buf, self.block_positions.len() as u64)?;
        for (range, position) in &self.block_positions {
            buf.write_i64::<BigEndian>(range.lower)?;
            buf.write_i64::<BigEndian>(range.upper)?;
            write_uvarint(buf, position.offset)?;
            write_uvarint(buf, position.length)?;
        }
        match &self.replay_position {
            Some(position) => {
                buf.push(1);
                buf.write_u64::<BigEndian>(position.segment)?;
                buf.write_u64::<BigEndian>(position.offset)?;
            }
            None => buf.push(0),
        }
        Ok(())
    }

    fn decode_from<R: Read>(reader: &mut R) -> Result<PartitionMetaData> {
        let lower = reader.read_i64::<BigEndian>()?;
        let upper = reader.read_i64::<BigEndian>()?;
        let file_size = read_uvarint(reader)?;
        let count = read_uvarint(reader)?;
        let mut block_positions = BTreeMap::new();
        for _ in 0..count {
            let block_lower = reader.read_i64::<BigEndian>()?;
            let block_upper = reader.read_i64::<BigEndian>()?;
            let offset = read_uvarint(reader)?;
            let length = read_uvarint(reader)?;
            block_positions.insert(
                TimeRange::new(block_lower, block_upper),
                BlockPosition::new(offset, length),
            );
        }
        let replay_position = match reader.read_u8()? {
            0 => None,
            1 => {
                let segment = reader.read_u64::<BigEndian>()?;
                let offset = reader.read_u64::<BigEndian>()?;
                Some(ReplayPosition::new(segment, offset))
            }
            other => return Err(errdata!("invalid replay position tag {other}")),
        };
        Ok(PartitionMetaData {
            range: TimeRange::new(lower, upper),
            file_size,
            block_positions,
            replay_position,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{Key, Value};

    #[test]
    fn test_partition_id_ordering() {
        let a = PartitionId::new("db", "dax", TimeRange::new(0, 99));
        let b = PartitionId::new("db", "dax", TimeRange::new(100, 199));
        let c = PartitionId::new("db", "ftse", TimeRange::new(0, 99));
        let d = PartitionId::new("eu", "dax", TimeRange::new(0, 99));
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
        assert!(PartitionId::series_start("db", "dax") < a);
        assert!(a < PartitionId::series_end("db", "dax"));
    }

    #[test]
    fn test_partition_id_roundtrip() {
        let id = PartitionId::new("db", "dax", TimeRange::new(-100, 100));
        let mut buf = Vec::new();
        id.encode_into(&mut buf).unwrap();
        let decoded = PartitionId::decode_from(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, id);
    }

    #[test]
    fn test_metadata_roundtrip() {
        let mut meta = PartitionMetaData::new(TimeRange::new(0, 86_399_999));
        meta.file_size = 4096;
        meta.block_positions
            .insert(TimeRange::new(0, 500), BlockPosition::new(64, 2000));
        meta.block_positions
            .insert(TimeRange::new(501, 900), BlockPosition::new(2064, 2032));
        meta.replay_position = Some(ReplayPosition::new(3, 128));

        let mut buf = Vec::new();
        meta.encode_into(&mut buf).unwrap();
        let decoded = PartitionMetaData::decode_from(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn test_empty_metadata_roundtrip() {
        let meta = PartitionMetaData::new(TimeRange::new(0, 999));
        let mut buf = Vec::new();
        meta.encode_into(&mut buf).unwrap();
        let decoded = PartitionMetaData::decode_from(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, meta);
        assert_eq!(decoded.replay_position, None);
    }
}
