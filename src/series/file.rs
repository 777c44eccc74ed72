//! The on-disk time series file.
//!
//! One partition owns one append-only data file holding its flushed
//! blocks. The file starts with a CRC protected `FileMetaData` header and
//! is followed by concatenated blocks; which byte ranges hold which time
//! ranges is tracked in the partition metadata, not in the file itself.
//!
//! ```text
//! +--------------+---------+---------+-----+---------+
//! | FileMetaData | Block 0 | Block 1 | ... | Block N |
//! +--------------+---------+---------+-----+---------+
//! ```
//!
//! ## Header layout (big-endian)
//!
//! ```text
//! magic:4 | version:2 | dbLen:varint | db | seriesLen:varint | series
//! | range.lower:8 | range.upper:8 | crc32:4
//! ```
//!
//! A `TimeSeriesFile` value is immutable: `append` writes the new blocks
//! and returns a successor value with the grown size and position map,
//! which only becomes visible once the partition publishes it. Crash
//! recovery relies on that ordering: bytes past the committed `file_size`
//! are a torn append and get truncated away on open.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::commitlog::ReplayPosition;
use crate::config::Config;
use crate::errcrc;
use crate::error::Result;
use crate::model::field::{FieldType, TimeUnit};
use crate::model::range::{RangeSet, TimeRange};
use crate::model::record::Record;
use crate::model::varint::{read_uvarint, write_uvarint};
use crate::series::block::{self, CompressionType, RecordIter, CRC32};
use crate::series::mem::MemTimeSeries;
use crate::series::meta::{BlockPosition, PartitionMetaData};

const MAGIC: &[u8; 4] = b"HZTS";
const VERSION: u16 = 1;

/// Identity header at the start of every data file.
#[derive(Clone, Debug, PartialEq)]
pub struct FileMetaData {
    pub database: String,
    pub series: String,
    pub range: TimeRange,
}

impl FileMetaData {
    pub fn new(database: impl Into<String>, series: impl Into<String>, range: TimeRange) -> Self {
        FileMetaData {
            database: database.into(),
            series: series.into(),
            range,
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.write_u16::<BigEndian>(VERSION)?;
        write_uvarint(&mut buf, self.database.len() as u64)?;
        buf.extend_from_slice(self.database.as_bytes());
        write_uvarint(&mut buf, self.series.len() as u64)?;
        buf.extend_from_slice(self.series.as_bytes());
        buf.write_i64::<BigEndian>(self.range.lower)?;
        buf.write_i64::<BigEndian>(self.range.upper)?;
        let crc = CRC32.checksum(&buf);
        buf.write_u32::<BigEndian>(crc)?;
        writer.write_all(&buf)?;
        Ok(())
    }

    /// Parses the header, failing with a checksum mismatch when any byte
    /// of it was tampered with.
    pub fn parse_from<R: Read>(reader: &mut R) -> Result<FileMetaData> {
        let mut covered = CrcReader::new(reader);

        let mut magic = [0u8; 4];
        covered.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(errcrc!("bad magic in data file header"));
        }
        let version = covered.read_u16::<BigEndian>()?;
        if version != VERSION {
            return Err(errcrc!("unsupported data file version {version}"));
        }
        let database = read_name(&mut covered)?;
        let series = read_name(&mut covered)?;
        let lower = covered.read_i64::<BigEndian>()?;
        let upper = covered.read_i64::<BigEndian>()?;

        let actual = covered.finalize();
        let stored = reader.read_u32::<BigEndian>()?;
        if actual != stored {
            return Err(errcrc!(
                "data file header crc {actual:#010x} does not match stored {stored:#010x}"
            ));
        }
        Ok(FileMetaData {
            database,
            series,
            range: TimeRange::new(lower, upper),
        })
    }
}

fn read_name<R: Read>(reader: &mut R) -> Result<String> {
    let len = read_uvarint(reader)? as usize;
    if len > 4096 {
        return Err(errcrc!("implausible name length {len} in data file header"));
    }
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| errcrc!("invalid utf-8 in data file header: {e}"))
}

/// A reader that feeds everything it reads into a CRC digest.
struct CrcReader<'a, R> {
    inner: &'a mut R,
    digest: crc::Digest<'static, u32>,
}

impl<'a, R: Read> CrcReader<'a, R> {
    fn new(inner: &'a mut R) -> Self {
        CrcReader {
            inner,
            digest: CRC32.digest(),
        }
    }

    fn finalize(self) -> u32 {
        self.digest.finalize()
    }
}

impl<R: Read> Read for CrcReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }
}

/// An immutable view of the partition's data file at a committed size.
pub struct TimeSeriesFile {
    path: PathBuf,
    metadata: FileMetaData,
    file_size: u64,
    block_positions: BTreeMap<TimeRange, BlockPosition>,
    replay_position: Option<ReplayPosition>,
    compression: CompressionType,
}

impl TimeSeriesFile {
    /// Opens the partition's data file, creating the header metadata in
    /// memory when the file does not exist yet (nothing touches disk until
    /// the first flush). If a crash left bytes past the committed size
    /// they are truncated away here.
    pub fn open(
        config: &Config,
        database: &str,
        series: &str,
        compression: CompressionType,
        timestamp_unit: TimeUnit,
        partition_metadata: &PartitionMetaData,
    ) -> Result<TimeSeriesFile> {
        let lower_millis = timestamp_unit.to_millis(partition_metadata.range.lower);
        let path = config
            .database_dir(database)
            .join(format!("{series}-{lower_millis}.ts"));

        if path.exists() {
            let physical = std::fs::metadata(&path)?.len();
            if physical > partition_metadata.file_size {
                tracing::warn!(
                    path = %path.display(),
                    physical,
                    committed = partition_metadata.file_size,
                    "truncating torn append past committed file size"
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(partition_metadata.file_size)?;
                file.sync_all()?;
            }
        }

        let metadata = if path.exists() && partition_metadata.file_size > 0 {
            let mut reader = std::io::BufReader::new(File::open(&path)?);
            FileMetaData::parse_from(&mut reader)?
        } else {
            FileMetaData::new(database, series, partition_metadata.range)
        };

        Ok(TimeSeriesFile {
            path,
            metadata,
            file_size: partition_metadata.file_size,
            block_positions: partition_metadata.block_positions.clone(),
            replay_position: partition_metadata.replay_position,
            compression,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.file_size
    }

    pub fn block_positions(&self) -> &BTreeMap<TimeRange, BlockPosition> {
        &self.block_positions
    }

    pub fn replay_position(&self) -> Option<ReplayPosition> {
        self.replay_position
    }

    /// Appends the blocks of the given mem series, in order, and returns
    /// the successor file value. The write is durably synced before the
    /// successor exists; on any failure the current value stays the
    /// committed truth and the bytes past it are dead weight for the next
    /// open to truncate.
    pub fn append(&self, mems: &[Arc<MemTimeSeries>]) -> Result<TimeSeriesFile> {
        tracing::debug!(
            path = %self.path.display(),
            mems = mems.len(),
            at = self.file_size,
            "appending mem series to data file"
        );
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        writer.seek(SeekFrom::Start(self.file_size))?;

        let mut offset = self.file_size;
        if offset == 0 {
            let mut header = Vec::new();
            self.metadata.write_to(&mut header)?;
            writer.write_all(&header)?;
            offset = header.len() as u64;
        }

        let mut block_positions = self.block_positions.clone();
        let mut replay_position = self.replay_position;
        for mem in mems {
            for mem_block in mem.blocks() {
                let Some(range) = mem_block.range() else {
                    continue;
                };
                let length = block::write_block(
                    &mut writer,
                    range,
                    mem_block.record_count(),
                    mem_block.chunks(),
                    self.compression,
                )?;
                block_positions.insert(range, BlockPosition::new(offset, length));
                offset += length;
            }
            replay_position = mem.replay_position().or(replay_position);
        }

        writer.flush()?;
        writer.get_ref().sync_data()?;

        Ok(TimeSeriesFile {
            path: self.path.clone(),
            metadata: self.metadata.clone(),
            file_size: offset,
            block_positions,
            replay_position,
            compression: self.compression,
        })
    }

    /// Streams records from every on-disk block overlapping `range_set`,
    /// seeking directly to each block through the position map.
    pub fn iter(
        &self,
        range_set: &RangeSet,
        field_types: Vec<Vec<FieldType>>,
    ) -> Result<FileRecordIter> {
        let positions: Vec<BlockPosition> = self
            .block_positions
            .iter()
            .filter(|(range, _)| range_set.overlaps(range))
            .map(|(_, position)| *position)
            .collect();
        let file = if positions.is_empty() {
            None
        } else {
            Some(File::open(&self.path)?)
        };
        Ok(FileRecordIter {
            file,
            positions: positions.into(),
            current: None,
            field_types,
            failed: false,
        })
    }
}

/// Lazy record iterator over a data file. Holds its own file handle, so it
/// stays valid if the partition is evicted or flushed concurrently.
pub struct FileRecordIter {
    file: Option<File>,
    positions: std::collections::VecDeque<BlockPosition>,
    current: Option<RecordIter>,
    field_types: Vec<Vec<FieldType>>,
    failed: bool,
}

impl FileRecordIter {
    fn load_next_block(&mut self) -> Result<Option<RecordIter>> {
        let Some(position) = self.positions.pop_front() else {
            return Ok(None);
        };
        let Some(file) = self.file.as_mut() else {
            return Ok(None);
        };
        file.seek(SeekFrom::Start(position.offset))?;
        let mut reader = std::io::Read::by_ref(file).take(position.length);
        let (header, payload) = block::read_block(&mut reader)?;
        Ok(Some(RecordIter::new(
            payload,
            header.record_count,
            &self.field_types,
        )))
    }
}

impl Iterator for FileRecordIter {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(iter) = &mut self.current {
                match iter.next() {
                    Some(Ok(record)) => return Some(Ok(record)),
                    Some(Err(e)) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                    None => {}
                }
            }
            match self.load_next_block() {
                Ok(Some(iter)) => self.current = Some(iter),
                Ok(None) => return None,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
