/*!
 * Per-host single-instance lock
 *
 * An advisory file lock prevents two daemon instances from watching the
 * same host. Losing the race is a normal startup path (exit 0), not an
 * error.
 */

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{BerthError, Result};

/// Held for the daemon's lifetime; the OS releases the lock when the file
/// handle closes, so an unclean exit never wedges the next start.
pub struct InstanceLock {
    _file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Default lock path for this host.
pub fn default_lock_path() -> PathBuf {
    std::env::temp_dir().join("berth.lock")
}

/// Try to acquire the single-instance lock. `Ok(None)` means another
/// instance already holds it.
pub fn acquire(path: &Path) -> Result<Option<InstanceLock>> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| {
            BerthError::InstanceLock(format!("cannot open {}: {}", path.display(), e))
        })?;

    match try_lock_exclusive(&file) {
        Ok(true) => Ok(Some(InstanceLock {
            _file: file,
            path: path.to_path_buf(),
        })),
        Ok(false) => Ok(None),
        Err(e) => Err(BerthError::InstanceLock(format!(
            "cannot lock {}: {}",
            path.display(),
            e
        ))),
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    // Windows mandatory share modes make the open itself exclusive enough
    // for a best-effort singleton; treat a successful open as held.
    let _ = file;
    Ok(true)
}
