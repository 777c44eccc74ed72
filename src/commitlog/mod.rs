//! Segmented write-ahead commit log.
//!
//! Every write is framed into the log before it becomes visible in a
//! partition. The log is a ring of fixed-size segments; a single writer
//! thread batches appends into group commits (see [`writer`]), replay
//! rebuilds partition state after a crash (see [`replay`]), and segments
//! are deleted once no partition holds unflushed data from them.

pub mod replay;
pub mod segment;
mod writer;

use std::fmt::Display;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::config::Config;
use crate::error::{Error, Result};
use writer::{Request, WriterTask};

/// The log coordinate assigned to a record: segment id plus the frame's
/// byte offset within it. Totally ordered, compared lexicographically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplayPosition {
    pub segment: u64,
    pub offset: u64,
}

impl ReplayPosition {
    pub fn new(segment: u64, offset: u64) -> ReplayPosition {
        ReplayPosition { segment, offset }
    }
}

impl Display for ReplayPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "({}:{})", self.segment, self.offset)
    }
}

/// Single-fire handle resolving to the durable position of one append.
///
/// Dropping the handle abandons the wait; the append itself still goes
/// through with the rest of its batch.
pub struct ReplayFuture {
    receiver: Receiver<Result<ReplayPosition>>,
}

impl ReplayFuture {
    /// Blocks until the batch containing this append was fsynced.
    pub fn wait(self) -> Result<ReplayPosition> {
        self.receiver.recv()?
    }
}

/// The commit log front end handed to the rest of the engine.
pub struct CommitLog {
    dir: PathBuf,
    tx: Sender<Request>,
    handle: Mutex<Option<JoinHandle<()>>>,
    current_segment: Arc<AtomicU64>,
}

impl CommitLog {
    /// Opens the commit log and starts the writer thread on a fresh
    /// segment after any existing ones. Old segments are left for replay
    /// and retention to deal with.
    pub fn open(config: &Config) -> Result<CommitLog> {
        let dir = config.commitlog_dir();
        std::fs::create_dir_all(&dir)?;

        let next_id = segment::list_segments(&dir)?
            .last()
            .map_or(0, |last| last + 1);
        let first_segment = segment::SegmentWriter::create(&dir, next_id)?;
        let current_segment = Arc::new(AtomicU64::new(next_id));

        let (tx, rx) = mpsc::channel();
        let task = WriterTask {
            dir: dir.clone(),
            segment_size: config.segment_size,
            batch_size: config.batch_size,
            batch_window: config.batch_window,
            requests: rx,
            current_segment: current_segment.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("commitlog-writer".to_string())
            .spawn(move || task.run(first_segment))?;

        tracing::info!(segment = next_id, dir = %dir.display(), "commit log open");
        Ok(CommitLog {
            dir,
            tx,
            handle: Mutex::new(Some(handle)),
            current_segment,
        })
    }

    /// Queues one payload for the next group commit and returns the
    /// acknowledgement handle.
    pub fn append(&self, payload: Vec<u8>) -> Result<ReplayFuture> {
        let (ack, receiver): (SyncSender<Result<ReplayPosition>>, _) = mpsc::sync_channel(1);
        self.tx
            .send(Request::Append { payload, ack })
            .map_err(|_| Error::Shutdown)?;
        Ok(ReplayFuture { receiver })
    }

    /// Forces the pending batch out and waits for the fsync.
    pub fn sync(&self) -> Result<()> {
        let (ack, receiver) = mpsc::sync_channel(1);
        self.tx
            .send(Request::Sync { ack })
            .map_err(|_| Error::Shutdown)?;
        receiver.recv()?
    }

    /// The segment currently receiving appends.
    pub fn current_segment(&self) -> u64 {
        self.current_segment.load(Ordering::SeqCst)
    }

    /// Ids of every segment on disk, ascending.
    pub fn segments(&self) -> Result<Vec<u64>> {
        segment::list_segments(&self.dir)
    }

    /// Deletes segments older than `floor`, never touching the active
    /// one. The caller proves non-reference: every live partition's first
    /// non-flushed segment must be `>= floor`.
    pub fn delete_segments_below(&self, floor: u64) -> Result<usize> {
        let limit = floor.min(self.current_segment());
        let mut deleted = 0;
        for id in segment::list_segments(&self.dir)? {
            if id < limit {
                segment::delete_segment(&self.dir, id)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Stops the writer after flushing whatever is pending.
    pub fn shutdown(&self) -> Result<()> {
        let _ = self.tx.send(Request::Shutdown);
        if let Some(handle) = self.handle.lock()?.take() {
            handle
                .join()
                .map_err(|_| Error::Io("commit log writer panicked".to_string()))?;
        }
        Ok(())
    }
}

impl Drop for CommitLog {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
