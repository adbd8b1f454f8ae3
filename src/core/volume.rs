/*!
 * Volume arrival/removal event stream
 *
 * The bus abstracts the OS volume event source behind `VolumeEventSource`.
 * The native implementation watches the platform's mount base directories
 * for appearing/disappearing mount points; when it cannot initialize, the
 * bus degrades to polling the mounted removable volumes once per second and
 * synthesizing Arrival/Removal from set differences. Either way events land
 * in a bounded drop-oldest queue, so a stalled consumer can never stall the
 * event-delivery context.
 */

use crossbeam_channel::Receiver;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::core::cancel::{cancellation, CancelHandle, CancelToken};
use crate::core::channel::{lossy, LossySender};
use crate::core::log_sink::LogHandle;

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const EVENT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeEventKind {
    Arrival,
    Removal,
}

/// One normalized volume transition, consumed exactly once by the
/// orchestrator.
#[derive(Debug, Clone)]
pub struct VolumeEvent {
    pub kind: VolumeEventKind,
    pub root: PathBuf,
    pub observed_at: Instant,
}

#[derive(Debug, thiserror::Error)]
pub enum VolumeSourceError {
    #[error("no mount base directory available to watch")]
    NoWatchRoots,

    #[error("filesystem watcher error: {0}")]
    Notify(#[from] notify::Error),

    #[error("could not spawn polling thread: {0}")]
    Spawn(String),
}

/// Pluggable event source; the polling implementation substitutes
/// transparently when the native one fails to initialize.
pub trait VolumeEventSource: Send {
    fn start(&mut self) -> Result<(), VolumeSourceError>;
    fn stop(&mut self);
}

/// Normalize a volume root to its canonical form so arrivals and removals
/// of the same volume correlate.
pub fn normalize_root(path: &Path) -> PathBuf {
    let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    normalize_platform(resolved)
}

#[cfg(windows)]
fn normalize_platform(path: PathBuf) -> PathBuf {
    let s = path.to_string_lossy();
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some(drive), Some(':')) if drive.is_ascii_lowercase() => {
            let mut out = String::with_capacity(s.len());
            out.push(drive.to_ascii_uppercase());
            out.push(':');
            out.extend(chars);
            PathBuf::from(out)
        }
        _ => path,
    }
}

#[cfg(not(windows))]
fn normalize_platform(path: PathBuf) -> PathBuf {
    path
}

// ---------------------------------------------------------------------
// Native source: watch mount base directories
// ---------------------------------------------------------------------

pub struct MountWatchSource {
    tx: LossySender<VolumeEvent>,
    watcher: Option<RecommendedWatcher>,
}

impl MountWatchSource {
    pub fn new(tx: LossySender<VolumeEvent>) -> Self {
        Self { tx, watcher: None }
    }
}

impl VolumeEventSource for MountWatchSource {
    fn start(&mut self) -> Result<(), VolumeSourceError> {
        let bases: Vec<PathBuf> = platform_mount_bases()
            .into_iter()
            .filter(|b| b.is_dir())
            .collect();
        if bases.is_empty() {
            return Err(VolumeSourceError::NoWatchRoots);
        }

        let tx = self.tx.clone();
        let watch_bases = bases.clone();
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => emit_mount_event(&tx, &watch_bases, &event),
                Err(e) => tracing::debug!("mount watcher error: {}", e),
            })?;

        for base in &bases {
            watcher.watch(base, RecursiveMode::NonRecursive)?;
        }
        tracing::debug!("watching {} mount base directories", bases.len());
        self.watcher = Some(watcher);
        Ok(())
    }

    fn stop(&mut self) {
        self.watcher = None;
    }
}

/// Runs on the watcher's callback thread: must never block, so events go
/// straight into the lossy queue.
fn emit_mount_event(
    tx: &LossySender<VolumeEvent>,
    bases: &[PathBuf],
    event: &notify::Event,
) {
    use notify::EventKind;

    let kind = match event.kind {
        EventKind::Create(_) => VolumeEventKind::Arrival,
        EventKind::Remove(_) => VolumeEventKind::Removal,
        _ => return,
    };
    for path in &event.paths {
        // Only direct children of a watched base are mount roots.
        let is_mount_root = path
            .parent()
            .map_or(false, |parent| bases.iter().any(|b| b == parent));
        if !is_mount_root {
            continue;
        }
        tx.send(VolumeEvent {
            kind,
            root: normalize_root(path),
            observed_at: Instant::now(),
        });
    }
}

#[cfg(target_os = "linux")]
fn platform_mount_bases() -> Vec<PathBuf> {
    let mut bases = vec![
        PathBuf::from("/media"),
        PathBuf::from("/mnt"),
        PathBuf::from("/run/media"),
    ];
    if let Ok(user) = std::env::var("USER") {
        bases.push(PathBuf::from("/media").join(&user));
        bases.push(PathBuf::from("/run/media").join(&user));
    }
    bases
}

#[cfg(target_os = "macos")]
fn platform_mount_bases() -> Vec<PathBuf> {
    vec![PathBuf::from("/Volumes")]
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn platform_mount_bases() -> Vec<PathBuf> {
    Vec::new()
}

// ---------------------------------------------------------------------
// Polling fallback
// ---------------------------------------------------------------------

pub struct PollingSource {
    tx: LossySender<VolumeEvent>,
    cancel: CancelToken,
    interval: Duration,
    initial_seen: HashSet<PathBuf>,
    worker: Option<JoinHandle<()>>,
}

impl PollingSource {
    pub fn new(
        tx: LossySender<VolumeEvent>,
        cancel: CancelToken,
        interval: Duration,
        initial_seen: HashSet<PathBuf>,
    ) -> Self {
        Self {
            tx,
            cancel,
            interval,
            initial_seen,
            worker: None,
        }
    }
}

impl VolumeEventSource for PollingSource {
    fn start(&mut self) -> Result<(), VolumeSourceError> {
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        let interval = self.interval;
        let mut seen = std::mem::take(&mut self.initial_seen);

        let worker = thread::Builder::new()
            .name("berth-volume-poll".to_string())
            .spawn(move || loop {
                let current = removable_roots();
                for event in diff_roots(&seen, &current) {
                    tx.send(event);
                }
                seen = current;
                if cancel.wait_timeout(interval) {
                    break;
                }
            })
            .map_err(|e| VolumeSourceError::Spawn(e.to_string()))?;

        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Currently-mounted removable volume roots. A problem inspecting one
/// volume is logged and skipped; it never hides the other volumes.
fn removable_roots() -> HashSet<PathBuf> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let mut roots = HashSet::new();
    for disk in disks.iter() {
        let mount = disk.mount_point();
        if mount.as_os_str().is_empty() {
            tracing::debug!("skipping volume with empty mount point");
            continue;
        }
        if disk.is_removable() {
            roots.insert(normalize_root(mount));
        }
    }
    roots
}

/// Synthesize Arrival for previously-unseen roots and Removal for vanished
/// ones. Deterministic output order for a given input.
pub(crate) fn diff_roots(
    seen: &HashSet<PathBuf>,
    current: &HashSet<PathBuf>,
) -> Vec<VolumeEvent> {
    let now = Instant::now();
    let mut arrived: Vec<&PathBuf> = current.difference(seen).collect();
    let mut removed: Vec<&PathBuf> = seen.difference(current).collect();
    arrived.sort();
    removed.sort();

    let mut events = Vec::with_capacity(arrived.len() + removed.len());
    for root in arrived {
        events.push(VolumeEvent {
            kind: VolumeEventKind::Arrival,
            root: root.clone(),
            observed_at: now,
        });
    }
    for root in removed {
        events.push(VolumeEvent {
            kind: VolumeEventKind::Removal,
            root: root.clone(),
            observed_at: now,
        });
    }
    events
}

// ---------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------

/// Owns the active event source and the bounded event queue.
pub struct VolumeEventBus {
    tx: LossySender<VolumeEvent>,
    rx: Receiver<VolumeEvent>,
    stop: CancelHandle,
    stop_token: CancelToken,
    source: Option<Box<dyn VolumeEventSource>>,
    log: LogHandle,
}

impl VolumeEventBus {
    pub fn new(log: LogHandle) -> Self {
        let (tx, rx) = lossy(EVENT_QUEUE_CAPACITY);
        let (stop, stop_token) = cancellation();
        Self {
            tx,
            rx,
            stop,
            stop_token,
            source: None,
            log,
        }
    }

    /// The consumer end of the event queue.
    pub fn events(&self) -> Receiver<VolumeEvent> {
        self.rx.clone()
    }

    /// Start emitting events: prime with already-mounted removable volumes,
    /// then run the native watcher, degrading to polling if it cannot
    /// initialize.
    pub fn start(&mut self) {
        let initial = removable_roots();
        for event in diff_roots(&HashSet::new(), &initial) {
            self.tx.send(event);
        }

        let mut native = MountWatchSource::new(self.tx.clone());
        match native.start() {
            Ok(()) => {
                self.source = Some(Box::new(native));
            }
            Err(e) => {
                self.log.submit(&format!(
                    "volume watcher unavailable ({}), falling back to {}s polling",
                    e,
                    POLL_INTERVAL.as_secs()
                ));
                let mut polling = PollingSource::new(
                    self.tx.clone(),
                    self.stop_token.clone(),
                    POLL_INTERVAL,
                    initial,
                );
                match polling.start() {
                    Ok(()) => self.source = Some(Box::new(polling)),
                    Err(e) => {
                        // Never crash the daemon over a dead event source.
                        self.log
                            .submit(&format!("volume polling unavailable: {}", e));
                    }
                }
            }
        }
    }

    pub fn stop(&mut self) {
        self.stop.cancel();
        if let Some(mut source) = self.source.take() {
            source.stop();
        }
    }
}

impl Drop for VolumeEventBus {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots(paths: &[&str]) -> HashSet<PathBuf> {
        paths.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn test_diff_synthesizes_arrivals_for_unseen_roots() {
        let events = diff_roots(&roots(&[]), &roots(&["/mnt/a", "/mnt/b"]));
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| e.kind == VolumeEventKind::Arrival));
        assert_eq!(events[0].root, PathBuf::from("/mnt/a"));
        assert_eq!(events[1].root, PathBuf::from("/mnt/b"));
    }

    #[test]
    fn test_diff_synthesizes_removals_for_vanished_roots() {
        let events = diff_roots(&roots(&["/mnt/a", "/mnt/b"]), &roots(&["/mnt/b"]));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, VolumeEventKind::Removal);
        assert_eq!(events[0].root, PathBuf::from("/mnt/a"));
    }

    #[test]
    fn test_diff_stable_set_is_quiet() {
        let set = roots(&["/mnt/a"]);
        assert!(diff_roots(&set, &set).is_empty());
    }

    #[test]
    fn test_diff_mixed_transition() {
        let events = diff_roots(&roots(&["/mnt/old"]), &roots(&["/mnt/new"]));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, VolumeEventKind::Arrival);
        assert_eq!(events[0].root, PathBuf::from("/mnt/new"));
        assert_eq!(events[1].kind, VolumeEventKind::Removal);
        assert_eq!(events[1].root, PathBuf::from("/mnt/old"));
    }

    #[test]
    fn test_normalize_root_survives_missing_path() {
        let ghost = Path::new("/definitely/not/mounted/anywhere");
        assert_eq!(normalize_root(ghost), PathBuf::from(ghost));
    }

    #[test]
    fn test_normalize_root_resolves_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let normalized = normalize_root(dir.path());
        assert!(normalized.is_absolute());
    }
}
