/*!
 * Sentinel-based target resolution
 *
 * The authorized backup target is the one eligible volume whose root
 * carries the configured marker file. An explicit root override bypasses
 * discovery entirely. Marker probes are bounded by a per-volume timeout so
 * a dying or network-backed volume cannot stall resolution; a timeout
 * counts as "no sentinel".
 */

use crossbeam_channel::bounded;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::core::log_sink::LogHandle;
use crate::core::volume::normalize_root;
use crate::error::{EXIT_CONFLICT, EXIT_NO_TARGET};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Which volume classes to scan for the marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanScope {
    /// Removable volumes only; never probes internal disks
    RemovableOnly,
    /// Every mounted volume (one-shot mode opt-in)
    AllVolumes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Present,
    Absent,
    TimedOut,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("explicit backup root unavailable: {0}")]
    RootUnavailable(PathBuf),

    #[error("no volume carrying sentinel '{0}' was found")]
    NotFound(String),

    #[error("multiple volumes carry sentinel '{}': {}", .marker, join_paths(.candidates))]
    Conflict {
        marker: String,
        candidates: Vec<PathBuf>,
    },
}

impl ResolveError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ResolveError::RootUnavailable(_) | ResolveError::NotFound(_) => EXIT_NO_TARGET,
            ResolveError::Conflict { .. } => EXIT_CONFLICT,
        }
    }
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Check one volume root for the marker file, bounded by `PROBE_TIMEOUT`.
pub fn probe_marker(root: &Path, marker: &str) -> ProbeOutcome {
    probe_marker_with_timeout(root, marker, PROBE_TIMEOUT)
}

pub fn probe_marker_with_timeout(root: &Path, marker: &str, timeout: Duration) -> ProbeOutcome {
    let (tx, rx) = bounded(1);
    let target = root.join(marker);

    // Detached worker: if the device wedges, the thread is stranded with
    // it, not the caller.
    let spawned = thread::Builder::new()
        .name("berth-sentinel-probe".to_string())
        .spawn(move || {
            let _ = tx.send(target.is_file());
        });
    if let Err(e) = spawned {
        tracing::debug!("could not spawn sentinel probe: {}", e);
        return ProbeOutcome::Absent;
    }

    match rx.recv_timeout(timeout) {
        Ok(true) => ProbeOutcome::Present,
        Ok(false) => ProbeOutcome::Absent,
        Err(_) => ProbeOutcome::TimedOut,
    }
}

/// Volume roots eligible for sentinel scanning, deduplicated and in
/// lexicographic order.
pub fn eligible_roots(scope: ScanScope) -> Vec<PathBuf> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let mut roots = BTreeSet::new();
    for disk in disks.iter() {
        let mount = disk.mount_point();
        if mount.as_os_str().is_empty() {
            continue;
        }
        if scope == ScanScope::AllVolumes || disk.is_removable() {
            roots.insert(normalize_root(mount));
        }
    }
    roots.into_iter().collect()
}

/// Probe the given roots for the marker and require exactly one match.
/// More than one match is a deliberate safety stop: refusing to guess
/// beats writing to the wrong device.
pub fn resolve_among(
    roots: &[PathBuf],
    marker: &str,
    log: &LogHandle,
) -> Result<PathBuf, ResolveError> {
    let mut matches: Vec<PathBuf> = Vec::new();
    for root in roots {
        match probe_marker(root, marker) {
            ProbeOutcome::Present => matches.push(root.clone()),
            ProbeOutcome::Absent => {}
            ProbeOutcome::TimedOut => {
                log.submit(&format!(
                    "sentinel probe timed out on {}, treating as no sentinel",
                    root.display()
                ));
            }
        }
    }
    matches.sort();
    match matches.len() {
        0 => Err(ResolveError::NotFound(marker.to_string())),
        1 => Ok(matches.remove(0)),
        _ => Err(ResolveError::Conflict {
            marker: marker.to_string(),
            candidates: matches,
        }),
    }
}

/// Full resolution: explicit override, or a single discovery scan.
pub fn resolve(
    explicit_root: Option<&Path>,
    marker: &str,
    scope: ScanScope,
    log: &LogHandle,
) -> Result<PathBuf, ResolveError> {
    if let Some(root) = explicit_root {
        return if root.is_dir() {
            Ok(normalize_root(root))
        } else {
            Err(ResolveError::RootUnavailable(root.to_path_buf()))
        };
    }
    let roots = eligible_roots(scope);
    resolve_among(&roots, marker, log)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::log_sink::{LogSink, LogSinkOptions};
    use tempfile::tempdir;

    fn test_sink(dir: &Path) -> LogSink {
        let options = LogSinkOptions {
            echo_console: false,
            ..LogSinkOptions::default()
        };
        LogSink::new(&dir.join("test.log"), options).unwrap()
    }

    #[test]
    fn test_probe_present_and_absent() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".backup-target"), b"").unwrap();

        assert_eq!(
            probe_marker(dir.path(), ".backup-target"),
            ProbeOutcome::Present
        );
        assert_eq!(
            probe_marker(dir.path(), ".other-marker"),
            ProbeOutcome::Absent
        );
    }

    #[test]
    fn test_marker_must_be_a_file() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".backup-target")).unwrap();
        assert_eq!(
            probe_marker(dir.path(), ".backup-target"),
            ProbeOutcome::Absent
        );
    }

    #[test]
    fn test_explicit_root_bypasses_discovery() {
        let dir = tempdir().unwrap();
        let sink = test_sink(dir.path());
        let resolved = resolve(
            Some(dir.path()),
            ".backup-target",
            ScanScope::RemovableOnly,
            &sink.handle(),
        )
        .unwrap();
        assert_eq!(resolved, normalize_root(dir.path()));
    }

    #[test]
    fn test_explicit_root_missing_is_code_2() {
        let dir = tempdir().unwrap();
        let sink = test_sink(dir.path());
        let err = resolve(
            Some(Path::new("/no/such/volume")),
            ".backup-target",
            ScanScope::RemovableOnly,
            &sink.handle(),
        )
        .unwrap_err();
        assert!(matches!(err, ResolveError::RootUnavailable(_)));
        assert_eq!(err.exit_code(), EXIT_NO_TARGET);
    }

    #[test]
    fn test_zero_matches_is_code_2() {
        let dir = tempdir().unwrap();
        let sink = test_sink(dir.path());
        let a = dir.path().join("a");
        std::fs::create_dir(&a).unwrap();

        let err = resolve_among(&[a], ".backup-target", &sink.handle()).unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
        assert_eq!(err.exit_code(), EXIT_NO_TARGET);
    }

    #[test]
    fn test_single_match_wins() {
        let dir = tempdir().unwrap();
        let sink = test_sink(dir.path());
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::create_dir(&a).unwrap();
        std::fs::create_dir(&b).unwrap();
        std::fs::write(b.join(".backup-target"), b"").unwrap();

        let resolved =
            resolve_among(&[a, b.clone()], ".backup-target", &sink.handle()).unwrap();
        assert_eq!(resolved, b);
    }

    #[test]
    fn test_conflict_is_code_3_with_sorted_candidates() {
        let dir = tempdir().unwrap();
        let sink = test_sink(dir.path());
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::create_dir(&a).unwrap();
        std::fs::create_dir(&b).unwrap();
        std::fs::write(a.join(".backup-target"), b"").unwrap();
        std::fs::write(b.join(".backup-target"), b"").unwrap();

        // Deliberately probe in reverse order; the report is lexicographic.
        let err =
            resolve_among(&[b.clone(), a.clone()], ".backup-target", &sink.handle())
                .unwrap_err();
        assert_eq!(err.exit_code(), EXIT_CONFLICT);
        match &err {
            ResolveError::Conflict { candidates, .. } => {
                assert_eq!(candidates, &vec![a.clone(), b.clone()]);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        let rendered = err.to_string();
        let pos_a = rendered.find(&a.display().to_string()).unwrap();
        let pos_b = rendered.find(&b.display().to_string()).unwrap();
        assert!(pos_a < pos_b);
    }
}
