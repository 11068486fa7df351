//! Single-instance PID lock
//!
//! Holds an exclusive `flock` on the PID file for the life of the process.
//! A file left behind by a dead process is not locked, so it is simply
//! taken over and rewritten.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::LockError;

/// Exclusive lock on a PID file, released and removed on drop
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    // Kept open to hold the lock
    _file: File,
}

impl PidLock {
    /// Take the lock and write the current PID into `path`.
    ///
    /// # Errors
    ///
    /// - `LockError::AlreadyRunning` if another process holds the lock
    /// - `LockError::File` if the file cannot be opened or written
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();
        let file_err = |e: std::io::Error| LockError::File {
            path: path.display().to_string(),
            reason: e.to_string(),
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(file_err)?;
        }

        // Not truncated yet: a running holder's PID must stay readable
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .custom_flags(libc::O_CLOEXEC)
            .open(&path)
            .map_err(file_err)?;

        // SAFETY: the fd is owned by `file` and valid for this call
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                let mut contents = String::new();
                let _ = file.read_to_string(&mut contents);
                let pid = contents.trim();
                return Err(LockError::AlreadyRunning {
                    pid: if pid.is_empty() { "unknown".into() } else { pid.to_string() },
                });
            }
            return Err(file_err(err));
        }

        file.set_len(0).map_err(file_err)?;
        file.seek(SeekFrom::Start(0)).map_err(file_err)?;
        writeln!(file, "{}", std::process::id()).map_err(file_err)?;
        file.flush().map_err(file_err)?;

        debug!(path = %path.display(), "Acquired PID lock");
        Ok(Self { path, _file: file })
    }

    /// Path of the PID file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        // Removed while still locked, then the fd closes and releases it
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove PID file");
        } else {
            debug!(path = %self.path.display(), "Released PID lock");
        }
    }
}
