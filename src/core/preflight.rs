/*!
 * Pre-flight destination checks
 *
 * Runs before each engine invocation: estimates the source tree size,
 * checks the target volume has room for it plus a safety margin, and
 * probes that the destination is actually writable. A failed pre-flight
 * skips the run; it is never fatal to the daemon.
 */

use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

/// Safety margin applied on top of the estimated size
pub const SAFETY_MARGIN_PERCENT: f64 = 0.10;

/// Minimum free space to always leave on the target (100 MB)
pub const MIN_FREE_SPACE_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum PreflightError {
    #[error("insufficient space on target: need {required} bytes, {available} available")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("target root is not writable: {0}")]
    TargetUnwritable(String),

    #[error("cannot create destination directory {path}: {message}")]
    DestinationUnavailable { path: PathBuf, message: String },
}

/// Validate the destination before handing it to the copy engine. Returns
/// the estimated source-tree size on success.
pub fn check_destination(
    source: &Path,
    destination: &Path,
) -> Result<u64, PreflightError> {
    let estimated = estimate_tree_size(source);

    std::fs::create_dir_all(destination).map_err(|e| {
        PreflightError::DestinationUnavailable {
            path: destination.to_path_buf(),
            message: e.to_string(),
        }
    })?;

    ensure_sufficient_space(destination, estimated)?;
    ensure_writable(destination)?;
    Ok(estimated)
}

/// Total size of the files under `dir`. Unreadable entries are skipped;
/// an estimate does not need to be exact, only honest about scale.
pub fn estimate_tree_size(dir: &Path) -> u64 {
    let mut total = 0u64;
    for entry in WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_file() {
            if let Ok(metadata) = entry.metadata() {
                total = total.saturating_add(metadata.len());
            }
        }
    }
    total
}

fn ensure_sufficient_space(destination: &Path, required: u64) -> Result<(), PreflightError> {
    let disks = sysinfo::Disks::new_with_refreshed_list();

    // Longest mount-point prefix owns the destination.
    let mut target: Option<(usize, u64)> = None;
    for disk in disks.iter() {
        let mount = disk.mount_point();
        if destination.starts_with(mount) {
            let len = mount.as_os_str().len();
            if target.map_or(true, |(l, _)| len > l) {
                target = Some((len, disk.available_space()));
            }
        }
    }

    match target {
        Some((_, available)) => {
            let margin = (required as f64 * SAFETY_MARGIN_PERCENT) as u64;
            let total_required = required
                .saturating_add(margin)
                .saturating_add(MIN_FREE_SPACE_BYTES);
            if available < total_required {
                return Err(PreflightError::InsufficientSpace {
                    required: total_required,
                    available,
                });
            }
            Ok(())
        }
        None => {
            // Unknown volume (unusual mount topology): let the engine try.
            tracing::debug!(
                "could not determine volume for {}, skipping space check",
                destination.display()
            );
            Ok(())
        }
    }
}

fn ensure_writable(destination: &Path) -> Result<(), PreflightError> {
    NamedTempFile::new_in(destination)
        .map(|_| ())
        .map_err(|e| PreflightError::TargetUnwritable(e.to_string()))
}
