//! OS advisory exclusive locking for `.norma/` (spec Section 5: "the run
//! lock serializes all orchestrator activity").

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use norma_core::errors::FatalError;

/// Holds the lock file open for the duration of a run; the OS releases the
/// `flock` when this is dropped (process exit, panic, or explicit drop).
#[derive(Debug)]
pub struct RunLock {
    _file: File,
    path: PathBuf,
}

impl RunLock {
    /// Acquire the lock, blocking until it is free. Used by `norma run`.
    pub fn acquire_blocking(norma_dir: &Path) -> Result<Self, FatalError> {
        let (file, path) = open_lock_file(norma_dir)?;
        // SAFETY: `file`'s fd is valid for the duration of this call; flock
        // only affects the open file description, not the fd itself.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(FatalError::LockAcquisition(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        Ok(Self { _file: file, path })
    }

    /// Try to acquire the lock without blocking. Used by `norma loop` to
    /// probe whether another orchestrator already owns `.norma/`.
    pub fn try_acquire(norma_dir: &Path) -> Result<Option<Self>, FatalError> {
        let (file, path) = open_lock_file(norma_dir)?;
        // SAFETY: see `acquire_blocking`.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(Some(Self { _file: file, path }));
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Ok(None);
        }
        Err(FatalError::LockAcquisition(err.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_lock_file(norma_dir: &Path) -> Result<(File, PathBuf), FatalError> {
    let locks_dir = norma_dir.join("locks");
    std::fs::create_dir_all(&locks_dir).map_err(|e| FatalError::RunDirCreation {
        path: locks_dir.display().to_string(),
        source: e,
    })?;
    let path = locks_dir.join("run.lock");
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&path)
        .map_err(|e| FatalError::RunDirCreation {
            path: path.display().to_string(),
            source: e,
        })?;
    Ok((file, path))
}
