//! The commit log writer task.
//!
//! A single dedicated thread owns the active segment. Writers hand it
//! their payload together with a one-shot acknowledgement channel; the
//! thread buffers frames until the batch byte threshold is reached or the
//! batch window elapses, then flushes, fsyncs and resolves every waiter
//! with its individual replay position. One fsync pays for the whole
//! batch, which is what keeps write latency sane under load.
//!
//! A request that made it onto the queue is always written; dropping the
//! acknowledgement handle before then simply makes the resolution send a
//! no-op.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::commitlog::segment::SegmentWriter;
use crate::commitlog::ReplayPosition;
use crate::error::Result;

pub(crate) enum Request {
    Append {
        payload: Vec<u8>,
        ack: SyncSender<Result<ReplayPosition>>,
    },
    Sync {
        ack: SyncSender<Result<()>>,
    },
    Shutdown,
}

pub(crate) struct WriterTask {
    pub dir: PathBuf,
    pub segment_size: u64,
    pub batch_size: usize,
    pub batch_window: Duration,
    pub requests: Receiver<Request>,
    /// Shared with the commit log front end so segment deletion never
    /// touches the segment being written.
    pub current_segment: Arc<AtomicU64>,
}

struct Pending {
    ack: SyncSender<Result<ReplayPosition>>,
    position: ReplayPosition,
}

impl WriterTask {
    pub fn run(self, mut segment: SegmentWriter) {
        let mut pending: Vec<Pending> = Vec::new();
        let mut buffered = 0usize;
        let mut batch_started: Option<Instant> = None;

        loop {
            let request = if pending.is_empty() {
                match self.requests.recv() {
                    Ok(request) => request,
                    Err(_) => break,
                }
            } else {
                let elapsed = batch_started.map(|t| t.elapsed()).unwrap_or_default();
                let remaining = self.batch_window.saturating_sub(elapsed);
                match self.requests.recv_timeout(remaining) {
                    Ok(request) => request,
                    Err(RecvTimeoutError::Timeout) => {
                        Self::commit(&mut segment, &mut pending, &mut buffered).ok();
                        batch_started = None;
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            };

            match request {
                Request::Append { payload, ack } => {
                    if let Err(e) = self.maybe_rotate(&mut segment, &payload, &mut pending, &mut buffered) {
                        let _ = ack.send(Err(e));
                        continue;
                    }
                    match segment.append(&payload) {
                        Ok(position) => {
                            if pending.is_empty() {
                                batch_started = Some(Instant::now());
                            }
                            pending.push(Pending { ack, position });
                            buffered += payload.len();
                            if buffered >= self.batch_size {
                                Self::commit(&mut segment, &mut pending, &mut buffered).ok();
                                batch_started = None;
                            }
                        }
                        Err(e) => {
                            let _ = ack.send(Err(e));
                        }
                    }
                }
                Request::Sync { ack } => {
                    let result = Self::commit(&mut segment, &mut pending, &mut buffered);
                    batch_started = None;
                    let _ = ack.send(result);
                }
                Request::Shutdown => break,
            }
        }

        // Drain whatever is still pending so no writer hangs forever.
        Self::commit(&mut segment, &mut pending, &mut buffered).ok();
        tracing::debug!("commit log writer stopped");
    }

    /// Rotates to a fresh segment when the next frame would overflow the
    /// current one. The pending batch is committed first so positions in
    /// the old segment are durable before it stops being the active one.
    fn maybe_rotate(
        &self,
        segment: &mut SegmentWriter,
        payload: &[u8],
        pending: &mut Vec<Pending>,
        buffered: &mut usize,
    ) -> Result<()> {
        let frame_len = SegmentWriter::frame_len(payload);
        if segment.size() + frame_len <= self.segment_size {
            return Ok(());
        }
        Self::commit(segment, pending, buffered)?;
        let next_id = segment.id() + 1;
        tracing::info!(
            from = segment.id(),
            to = next_id,
            size = segment.size(),
            "rotating commit log segment"
        );
        *segment = SegmentWriter::create(&self.dir, next_id)?;
        self.current_segment.store(next_id, Ordering::SeqCst);
        Ok(())
    }

    /// Makes the buffered batch durable and resolves every waiter. On
    /// failure all waiters get the same error and nothing is considered
    /// durable.
    fn commit(
        segment: &mut SegmentWriter,
        pending: &mut Vec<Pending>,
        buffered: &mut usize,
    ) -> Result<()> {
        if pending.is_empty() && *buffered == 0 {
            return Ok(());
        }
        let result = segment.sync();
        match &result {
            Ok(()) => {
                for waiter in pending.drain(..) {
                    let _ = waiter.ack.send(Ok(waiter.position));
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "commit log batch sync failed");
                for waiter in pending.drain(..) {
                    let _ = waiter.ack.send(Err(e.clone()));
                }
            }
        }
        *buffered = 0;
        result
    }
}
