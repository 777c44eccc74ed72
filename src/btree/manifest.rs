//! B+tree manifest.
//!
//! Publishing a new tree root must be atomic: either the old root or the
//! new one, never a half written pointer. Roots are therefore appended to
//! a separate manifest file as fixed 28 byte trailers and the reader scans
//! backwards from EOF to the newest trailer whose CRC checks out:
//!
//! ```text
//! Trailer := rootOffset:8 | freeListOffset:8 | generation:8 | crc32:4
//! ```
//!
//! A torn trailer at the tail simply loses the last publication; the tree
//! pages it pointed at are unreachable but intact, and the previous
//! trailer still describes a fully consistent tree.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::Result;

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub const TRAILER_SIZE: u64 = 28;

/// One published tree state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ManifestRecord {
    /// Page offset of the root node; 0 means the tree is empty.
    pub root: u64,
    /// Page offset of the free list page; 0 means no free pages.
    pub free_list: u64,
    /// Monotonically increasing publication counter.
    pub generation: u64,
}

impl ManifestRecord {
    fn encode(&self) -> [u8; TRAILER_SIZE as usize] {
        let mut buf = [0u8; TRAILER_SIZE as usize];
        {
            let mut writer = &mut buf[..];
            writer.write_u64::<BigEndian>(self.root).unwrap();
            writer.write_u64::<BigEndian>(self.free_list).unwrap();
            writer.write_u64::<BigEndian>(self.generation).unwrap();
        }
        let crc = CRC32.checksum(&buf[..24]);
        (&mut buf[24..]).write_u32::<BigEndian>(crc).unwrap();
        buf
    }

    fn decode(buf: &[u8; TRAILER_SIZE as usize]) -> Option<ManifestRecord> {
        let mut reader = &buf[..];
        let root = reader.read_u64::<BigEndian>().ok()?;
        let free_list = reader.read_u64::<BigEndian>().ok()?;
        let generation = reader.read_u64::<BigEndian>().ok()?;
        let stored = reader.read_u32::<BigEndian>().ok()?;
        if CRC32.checksum(&buf[..24]) != stored {
            return None;
        }
        Some(ManifestRecord {
            root,
            free_list,
            generation,
        })
    }
}

/// The append-only manifest file.
pub struct ManifestFile {
    file: File,
}

impl ManifestFile {
    /// Opens (or creates) the manifest and returns the newest valid
    /// record, scanning backwards past any torn tail.
    pub fn open(path: &Path) -> Result<(ManifestFile, Option<ManifestRecord>)> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();

        let mut record = None;
        let mut position = len - len % TRAILER_SIZE;
        while position >= TRAILER_SIZE {
            position -= TRAILER_SIZE;
            let mut buf = [0u8; TRAILER_SIZE as usize];
            file.read_exact_at(&mut buf, position)?;
            if let Some(found) = ManifestRecord::decode(&buf) {
                record = Some(found);
                break;
            }
            tracing::warn!(position, "skipping invalid manifest trailer");
        }

        Ok((ManifestFile { file }, record))
    }

    /// Durably appends a new record. The tree pages it references must be
    /// synced before this is called.
    pub fn append(&mut self, record: &ManifestRecord) -> Result<()> {
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&record.encode())?;
        self.file.sync_data()?;
        Ok(())
    }
}
