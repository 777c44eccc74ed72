//! Commit log segment files.
//!
//! A segment is a fixed-size-bounded append-only file named
//! `commitlog/NNNNNN.log`, holding length prefixed, CRC protected frames:
//!
//! ```text
//! +---------+-----------+------------------+-----------+
//! | magic:4 | version:2 | Frame 1          | Frame 2...|
//! +---------+-----------+------------------+-----------+
//!
//! Frame := length:varint | payload:bytes | crc32(payload):u32
//! ```
//!
//! Frame offsets are absolute file offsets; `(segment id, frame offset)`
//! is the replay position handed back to writers.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::commitlog::ReplayPosition;
use crate::errcrc;
use crate::error::Result;
use crate::model::varint::{read_uvarint, uvarint_len, write_uvarint};

pub static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const MAGIC: &[u8; 4] = b"HZCL";
const VERSION: u16 = 1;
pub const HEADER_SIZE: u64 = 6;

pub fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:06}.log"))
}

/// Parses a segment id out of a file name like `000042.log`.
pub fn parse_segment_id(name: &str) -> Option<u64> {
    name.strip_suffix(".log")?.parse().ok()
}

/// Lists the segment ids present in the commit log directory, ascending.
pub fn list_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    if !dir.exists() {
        return Ok(ids);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = entry.file_name().to_str().and_then(parse_segment_id) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// The segment currently receiving appends. Only the commit log writer
/// thread touches it.
pub struct SegmentWriter {
    file: File,
    writer: BufWriter<File>,
    id: u64,
    size: u64,
}

impl SegmentWriter {
    /// Creates a fresh segment and durably writes its header.
    pub fn create(dir: &Path, id: u64) -> Result<SegmentWriter> {
        let path = segment_path(dir, id);
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file.try_clone()?);
        writer.write_all(MAGIC)?;
        writer.write_u16::<BigEndian>(VERSION)?;
        writer.flush()?;
        file.sync_data()?;
        tracing::debug!(segment = id, path = %path.display(), "created commit log segment");
        Ok(SegmentWriter {
            file,
            writer,
            id,
            size: HEADER_SIZE,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of bytes a frame for `payload` occupies on disk.
    pub fn frame_len(payload: &[u8]) -> u64 {
        (uvarint_len(payload.len() as u64) + payload.len() + 4) as u64
    }

    /// Buffers one frame and returns the position it will be durable at
    /// after the next [`SegmentWriter::sync`].
    pub fn append(&mut self, payload: &[u8]) -> Result<ReplayPosition> {
        let position = ReplayPosition::new(self.id, self.size);
        write_uvarint(&mut self.writer, payload.len() as u64)?;
        self.writer.write_all(payload)?;
        self.writer.write_u32::<BigEndian>(CRC32.checksum(payload))?;
        self.size += Self::frame_len(payload);
        Ok(position)
    }

    /// Flushes buffered frames and syncs them to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// Sequential reader over one segment's frames, yielding each frame's
/// position and payload. CRC failures surface as `ChecksumMismatch`.
pub struct FrameIter {
    reader: BufReader<File>,
    segment: u64,
    offset: u64,
    failed: bool,
}

impl FrameIter {
    pub fn open(dir: &Path, segment: u64) -> Result<FrameIter> {
        let path = segment_path(dir, segment);
        let mut reader = BufReader::new(File::open(&path)?);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(errcrc!("bad magic in commit log segment {segment}"));
        }
        let version = reader.read_u16::<BigEndian>()?;
        if version != VERSION {
            return Err(errcrc!(
                "unsupported commit log segment version {version} in segment {segment}"
            ));
        }

        Ok(FrameIter {
            reader,
            segment,
            offset: HEADER_SIZE,
            failed: false,
        })
    }

    /// Offset of the next unread frame; after a failure, the offset of
    /// the corrupt frame. Used by the truncate-tail replay policy.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read_frame(&mut self) -> Result<Option<(ReplayPosition, Vec<u8>)>> {
        let position = ReplayPosition::new(self.segment, self.offset);

        let length = {
            let mut first = [0u8; 1];
            match self.reader.read(&mut first)? {
                0 => return Ok(None), // clean end of segment
                _ => {
                    if first[0] & 0x80 == 0 {
                        first[0] as u64
                    } else {
                        let mut chained = first.as_slice().chain(&mut self.reader);
                        read_uvarint(&mut chained)
                            .map_err(|_| errcrc!("truncated frame length in segment {}", self.segment))?
                    }
                }
            }
        };

        let mut payload = vec![0u8; length as usize];
        self.reader
            .read_exact(&mut payload)
            .map_err(|_| errcrc!("truncated frame payload in segment {}", self.segment))?;
        let stored = self
            .reader
            .read_u32::<BigEndian>()
            .map_err(|_| errcrc!("truncated frame checksum in segment {}", self.segment))?;

        let actual = CRC32.checksum(&payload);
        if actual != stored {
            return Err(errcrc!(
                "frame crc {actual:#010x} does not match stored {stored:#010x} at {position}"
            ));
        }

        self.offset += (uvarint_len(length) + payload.len() + 4) as u64;
        Ok(Some((position, payload)))
    }
}

impl Iterator for FrameIter {
    type Item = Result<(ReplayPosition, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.read_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Truncates a segment at the given offset, discarding a corrupt tail.
pub fn truncate_segment(dir: &Path, segment: u64, offset: u64) -> Result<()> {
    let path = segment_path(dir, segment);
    let file = OpenOptions::new().write(true).open(&path)?;
    file.set_len(offset)?;
    file.sync_data()?;
    tracing::warn!(segment, offset, "truncated corrupt commit log tail");
    Ok(())
}

/// Removes a segment file. Missing files are fine; a crash may have
/// beaten us to it.
pub fn delete_segment(dir: &Path, segment: u64) -> Result<()> {
    match fs::remove_file(segment_path(dir, segment)) {
        Ok(()) => {
            tracing::info!(segment, "deleted commit log segment");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
