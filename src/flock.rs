//! Exclusive data directory lock.
//!
//! Two engine instances sharing one data directory would corrupt the
//! commit log and the catalogue, so open takes an advisory `flock` on a
//! lock file before touching anything else. The lock file carries the
//! owning process id to make a stuck lock diagnosable.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn lock<P: AsRef<Path>>(path: P) -> Result<FileLock> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Self::try_lock(&file).map_err(|e| {
            Error::Io(format!(
                "data directory is locked by another process ({}): {e}",
                path.display()
            ))
        })?;

        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(FileLock { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> std::io::Result<()> {
        use std::os::unix::io::AsRawFd;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> std::io::Result<()> {
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// The lock releases when the file handle closes; the file itself stays
// behind so a later open can reuse it without races.
