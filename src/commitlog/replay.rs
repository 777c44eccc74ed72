//! Commit log replay.
//!
//! On startup every retained segment is read in id order and each frame is
//! routed back through the write path, tagged as a replay. Partitions drop
//! frames whose position is not newer than what their data file already
//! holds, which is the whole idempotence story: replaying the same log
//! against the same files any number of times converges to the same state.

use std::path::Path;

use crate::commitlog::segment::{self, FrameIter};
use crate::commitlog::ReplayPosition;
use crate::error::{Error, Result};

/// Replays every frame in segments `>= from_segment`, calling `apply` with
/// each frame's position and payload. Returns the number of frames
/// applied.
///
/// A corrupt frame fails the replay unless `truncate_corrupt_tail` is set,
/// in which case the segment is cut at the corrupt frame and replay stops
/// there with a warning.
pub fn replay<F>(
    dir: &Path,
    from_segment: u64,
    truncate_corrupt_tail: bool,
    mut apply: F,
) -> Result<u64>
where
    F: FnMut(ReplayPosition, &[u8]) -> Result<()>,
{
    let segments = segment::list_segments(dir)?;
    let mut applied = 0u64;

    for id in segments.into_iter().filter(|id| *id >= from_segment) {
        tracing::debug!(segment = id, "replaying commit log segment");
        let mut frames = FrameIter::open(dir, id)?;
        loop {
            match frames.next() {
                Some(Ok((position, payload))) => {
                    apply(position, &payload)?;
                    applied += 1;
                }
                Some(Err(Error::ChecksumMismatch(msg))) => {
                    if !truncate_corrupt_tail {
                        return Err(Error::ChecksumMismatch(msg));
                    }
                    tracing::warn!(
                        segment = id,
                        offset = frames.offset(),
                        "corrupt commit log frame, discarding tail: {msg}"
                    );
                    segment::truncate_segment(dir, id, frames.offset())?;
                    return Ok(applied);
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::segment::SegmentWriter;
    use std::fs;

    fn write_segments(dir: &Path) {
        let mut first = SegmentWriter::create(dir, 0).unwrap();
        first.append(b"a").unwrap();
        first.append(b"b").unwrap();
        first.sync().unwrap();

        let mut second = SegmentWriter::create(dir, 1).unwrap();
        second.append(b"c").unwrap();
        second.sync().unwrap();
    }

    #[test]
    fn test_replays_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_segments(dir.path());

        let mut seen = Vec::new();
        let applied = replay(dir.path(), 0, false, |position, payload| {
            seen.push((position, payload.to_vec()));
            Ok(())
        })
        .unwrap();

        assert_eq!(applied, 3);
        assert_eq!(seen[0].1, b"a");
        assert_eq!(seen[2].1, b"c");
        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_replay_respects_segment_floor() {
        let dir = tempfile::tempdir().unwrap();
        write_segments(dir.path());

        let mut seen = Vec::new();
        let applied = replay(dir.path(), 1, false, |_, payload| {
            seen.push(payload.to_vec());
            Ok(())
        })
        .unwrap();

        assert_eq!(applied, 1);
        assert_eq!(seen, vec![b"c".to_vec()]);
    }

    #[test]
    fn test_corruption_fails_without_policy() {
        let dir = tempfile::tempdir().unwrap();
        write_segments(dir.path());

        // Corrupt the last byte of segment 1.
        let path = segment::segment_path(dir.path(), 1);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 5;
        bytes[last] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let result = replay(dir.path(), 0, false, |_, _| Ok(()));
        assert!(matches!(result, Err(Error::ChecksumMismatch(_))));
    }

    #[test]
    fn test_truncate_tail_policy_discards_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SegmentWriter::create(dir.path(), 0).unwrap();
        writer.append(b"good").unwrap();
        writer.append(b"doomed").unwrap();
        writer.sync().unwrap();

        // Corrupt the second frame.
        let path = segment::segment_path(dir.path(), 0);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 5;
        bytes[last] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let mut seen = Vec::new();
        let applied = replay(dir.path(), 0, true, |_, payload| {
            seen.push(payload.to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(applied, 1);
        assert_eq!(seen, vec![b"good".to_vec()]);

        // The tail is gone for good: a second replay sees a clean segment.
        let applied = replay(dir.path(), 0, false, |_, _| Ok(())).unwrap();
        assert_eq!(applied, 1);
    }
}
