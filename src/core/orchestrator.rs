/*!
 * Backup orchestration
 *
 * Consumes the normalized volume-event stream and drives the whole
 * pipeline: debounce repeated arrivals, probe for the sentinel, latch the
 * conflict state when more than one volume carries it, and dispatch at
 * most one supervised backup run at a time through the single-flight
 * guard. Sentinel state lives exclusively in this consumer loop; the guard
 * is the only thing shared with run workers.
 */

use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::audit::{new_run_id, RunJournal, RunRecord};
use crate::config::BackupConfig;
use crate::core::cancel::CancelToken;
use crate::core::log_sink::LogHandle;
use crate::core::preflight;
use crate::core::sentinel::{self, ProbeOutcome, ScanScope};
use crate::core::single_flight::SingleFlight;
use crate::core::supervisor::{self, RunOutcome};
use crate::core::volume::{normalize_root, VolumeEvent, VolumeEventKind};
use crate::error::{EXIT_FAILURE, EXIT_SUCCESS};

/// Per-root sentinel tracking: `Unknown -> {NoSentinel, HasSentinel} ->
/// (removal) -> Unknown`.
struct RootState {
    has_sentinel: bool,
    /// Set only on arrivals that were accepted (not debounced)
    last_trigger: Option<Instant>,
}

struct ProbeReport {
    root: PathBuf,
    outcome: ProbeOutcome,
}

struct RunReport {
    root: PathBuf,
    /// None when the run was skipped before the engine launched
    outcome: Option<RunOutcome>,
}

pub struct Orchestrator {
    config: Arc<BackupConfig>,
    log: LogHandle,
    cancel: CancelToken,
    journal: Option<Arc<RunJournal>>,
    guard: SingleFlight,
    debounce: Duration,
    explicit_root: Option<PathBuf>,
    roots: HashMap<PathBuf, RootState>,
    probing: HashSet<PathBuf>,
    timeout_logged: HashSet<PathBuf>,
    /// Root whose sentinel was just confirmed, held back until every
    /// in-flight probe has reported so simultaneous carriers are seen as a
    /// conflict instead of a first-past-the-post run.
    pending_trigger: Option<PathBuf>,
    conflict: bool,
    runs_completed: Arc<AtomicU64>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<BackupConfig>,
        log: LogHandle,
        cancel: CancelToken,
        journal: Option<Arc<RunJournal>>,
    ) -> Self {
        let debounce = Duration::from_secs(config.debounce_secs);
        let explicit_root = config
            .explicit_root
            .as_deref()
            .map(normalize_root);
        Self {
            config,
            log,
            cancel,
            journal,
            guard: SingleFlight::new(),
            debounce,
            explicit_root,
            roots: HashMap::new(),
            probing: HashSet::new(),
            timeout_logged: HashSet::new(),
            pending_trigger: None,
            conflict: false,
            runs_completed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Backups that actually invoked the engine, successful or not.
    pub fn runs_completed(&self) -> u64 {
        self.runs_completed.load(Ordering::Relaxed)
    }

    /// Consume volume events until cancellation or until the event source
    /// disconnects. Probe results and run completions feed back into the
    /// same loop, so all per-root state stays single-threaded.
    pub fn watch(&mut self, events: Receiver<VolumeEvent>) {
        let (probe_tx, probe_rx) = bounded::<ProbeReport>(16);
        let (done_tx, done_rx) = bounded::<RunReport>(4);
        let cancel_rx = self.cancel.channel().clone();

        self.log.submit("watching for sentinel volumes");
        loop {
            crossbeam_channel::select! {
                recv(events) -> msg => match msg {
                    Ok(event) => self.handle_event(event, &probe_tx, &done_tx),
                    Err(_) => break,
                },
                recv(probe_rx) -> msg => {
                    if let Ok(report) = msg {
                        self.handle_probe(report, &done_tx);
                    }
                },
                recv(done_rx) -> msg => {
                    if let Ok(report) = msg {
                        self.handle_run_done(report);
                    }
                },
                recv(cancel_rx) -> _ => break,
            }
        }

        // Give an in-flight run a moment to observe cancellation and wind
        // down before the caller tears the log sink away.
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.guard.is_busy() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        self.log.submit("watcher stopped");
    }

    fn handle_event(
        &mut self,
        event: VolumeEvent,
        probe_tx: &Sender<ProbeReport>,
        done_tx: &Sender<RunReport>,
    ) {
        let root = event.root;
        if let Some(ref explicit) = self.explicit_root {
            if &root != explicit {
                tracing::debug!("ignoring event for non-target root {}", root.display());
                return;
            }
        }
        match event.kind {
            VolumeEventKind::Removal => {
                self.roots.remove(&root);
                self.probing.remove(&root);
                self.timeout_logged.remove(&root);
                if self.pending_trigger.as_ref() == Some(&root) {
                    self.pending_trigger = None;
                }
                self.log
                    .submit(&format!("volume removed: {}", root.display()));
                self.refresh_conflict();
                // A removal can drain the probe set and unblock a deferred
                // trigger for the surviving carrier.
                self.maybe_fire_pending(done_tx);
            }
            VolumeEventKind::Arrival => {
                let now = Instant::now();
                let state = self.roots.entry(root.clone()).or_insert(RootState {
                    has_sentinel: false,
                    last_trigger: None,
                });
                if within_debounce(state.last_trigger, now, self.debounce) {
                    tracing::debug!("debounced arrival for {}", root.display());
                    return;
                }
                state.last_trigger = Some(now);
                self.log
                    .submit(&format!("volume arrived: {}", root.display()));

                if self.explicit_root.is_some() {
                    // Explicit override makes sentinel presence implicit.
                    self.apply_probe_result(root, ProbeOutcome::Present, done_tx);
                } else if self.probing.contains(&root) {
                    tracing::debug!(
                        "sentinel probe already in flight for {}",
                        root.display()
                    );
                } else {
                    self.start_probe(root, probe_tx);
                }
            }
        }
    }

    fn start_probe(&mut self, root: PathBuf, probe_tx: &Sender<ProbeReport>) {
        self.probing.insert(root.clone());
        let marker = self.config.sentinel_name.clone();
        let tx = probe_tx.clone();
        let probe_root = root.clone();
        let spawned = thread::Builder::new()
            .name("berth-probe".to_string())
            .spawn(move || {
                let outcome = sentinel::probe_marker(&probe_root, &marker);
                let _ = tx.send(ProbeReport {
                    root: probe_root,
                    outcome,
                });
            });
        if spawned.is_err() {
            self.probing.remove(&root);
            self.log.submit(&format!(
                "could not start sentinel probe for {}",
                root.display()
            ));
        }
    }

    fn handle_probe(&mut self, report: ProbeReport, done_tx: &Sender<RunReport>) {
        self.probing.remove(&report.root);
        if !self.roots.contains_key(&report.root) {
            // Removed while the probe was in flight; the state is gone and
            // a later arrival must re-probe.
            return;
        }
        self.apply_probe_result(report.root, report.outcome, done_tx);
    }

    fn apply_probe_result(
        &mut self,
        root: PathBuf,
        outcome: ProbeOutcome,
        done_tx: &Sender<RunReport>,
    ) {
        let confirmed = match outcome {
            ProbeOutcome::Present => true,
            ProbeOutcome::Absent => false,
            ProbeOutcome::TimedOut => {
                if self.timeout_logged.insert(root.clone()) {
                    self.log.submit(&format!(
                        "sentinel probe timed out on {}, treating as no sentinel",
                        root.display()
                    ));
                }
                false
            }
        };
        if let Some(state) = self.roots.get_mut(&root) {
            state.has_sentinel = confirmed;
        }
        if confirmed {
            self.pending_trigger = Some(root);
        }
        self.refresh_conflict();
        if self.conflict {
            self.pending_trigger = None;
        }
        self.maybe_fire_pending(done_tx);
    }

    /// Fire the deferred trigger once no probe is in flight and the
    /// candidate is the single sentinel carrier.
    fn maybe_fire_pending(&mut self, done_tx: &Sender<RunReport>) {
        if !self.probing.is_empty() {
            return;
        }
        let Some(candidate) = self.pending_trigger.take() else {
            return;
        };
        let carriers = self.sentinel_roots();
        if carriers.len() == 1 && carriers[0] == candidate {
            self.try_start_run(candidate, done_tx);
        }
    }

    fn sentinel_roots(&self) -> Vec<PathBuf> {
        self.roots
            .iter()
            .filter(|(_, state)| state.has_sentinel)
            .map(|(root, _)| root.clone())
            .collect()
    }

    /// Latch into conflict on >1 sentinel carriers, logging exactly once
    /// per transition; dropping back to <=1 clears the latch silently.
    fn refresh_conflict(&mut self) {
        let mut carriers = self.sentinel_roots();
        if carriers.len() > 1 {
            if !self.conflict {
                self.conflict = true;
                carriers.sort();
                let listing = carriers
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                self.log.submit(&format!(
                    "conflict: multiple volumes carry the sentinel ({}), refusing to run until resolved",
                    listing
                ));
            }
        } else {
            self.conflict = false;
        }
    }

    fn try_start_run(&mut self, root: PathBuf, done_tx: &Sender<RunReport>) {
        let Some(permit) = self.guard.try_acquire() else {
            self.log.submit(&format!(
                "backup already running, ignoring trigger for {}",
                root.display()
            ));
            return;
        };
        self.log
            .submit(&format!("sentinel volume ready: {}", root.display()));

        let config = Arc::clone(&self.config);
        let log = self.log.clone();
        let cancel = self.cancel.clone();
        let journal = self.journal.clone();
        let done_tx = done_tx.clone();
        let spawned = thread::Builder::new()
            .name("berth-backup-run".to_string())
            .spawn(move || {
                // Held for the worker's whole lifetime; released on every
                // exit path including panics.
                let _permit = permit;
                let outcome =
                    execute_run(&root, &config, &log, &cancel, journal.as_deref());
                let _ = done_tx.send(RunReport { root, outcome });
            });
        if let Err(e) = spawned {
            // The closure (and with it the permit) was dropped.
            self.log
                .submit(&format!("could not start backup worker: {}", e));
        }
    }

    fn handle_run_done(&mut self, report: RunReport) {
        match report.outcome {
            Some(outcome) => {
                self.runs_completed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "run finished for {}: {}",
                    report.root.display(),
                    outcome.label()
                );
            }
            None => {
                tracing::debug!("run skipped for {}", report.root.display());
            }
        }
    }
}

fn within_debounce(last: Option<Instant>, now: Instant, window: Duration) -> bool {
    match last {
        Some(last) => now.duration_since(last) < window,
        None => false,
    }
}

/// One pre-flighted, journaled, supervised run. Returns `None` when the
/// run was skipped before the engine launched.
fn execute_run(
    root: &Path,
    config: &BackupConfig,
    log: &LogHandle,
    cancel: &CancelToken,
    journal: Option<&RunJournal>,
) -> Option<RunOutcome> {
    let destination = root.join(&config.destination_folder);
    let run_id = new_run_id();
    if let Some(journal) = journal {
        journal.emit(&RunRecord::started(&run_id, &config.source, &destination));
    }
    let started = Instant::now();

    let result = match preflight::check_destination(&config.source, &destination) {
        Err(e) => {
            log.submit(&format!(
                "pre-flight check failed for {}: {}",
                root.display(),
                e
            ));
            Err(e.to_string())
        }
        Ok(estimated) => {
            tracing::debug!("pre-flight passed, ~{} bytes to transfer", estimated);
            match supervisor::run(root, config, log, cancel) {
                Ok(outcome) => Ok(outcome),
                Err(e) => {
                    log.submit(&format!("backup run could not start: {}", e));
                    Err(e.to_string())
                }
            }
        }
    };

    let duration_ms = started.elapsed().as_millis() as u64;
    if let Some(journal) = journal {
        let record = match &result {
            Ok(outcome) => RunRecord::completed(
                &run_id,
                &config.source,
                &destination,
                outcome.label(),
                outcome.exit_code(),
                duration_ms,
                None,
            ),
            Err(message) => RunRecord::completed(
                &run_id,
                &config.source,
                &destination,
                "skipped",
                None,
                duration_ms,
                Some(message.clone()),
            ),
        };
        journal.emit(&record);
    }
    result.ok()
}

/// One-shot mode: resolve the target exactly once and run exactly one
/// supervised backup, mapped onto the process exit code.
pub fn run_once(
    config: &BackupConfig,
    log: &LogHandle,
    cancel: &CancelToken,
    journal: Option<&RunJournal>,
) -> i32 {
    let scope = if config.scan_all_volumes {
        ScanScope::AllVolumes
    } else {
        ScanScope::RemovableOnly
    };
    let root = match sentinel::resolve(
        config.explicit_root.as_deref(),
        &config.sentinel_name,
        scope,
        log,
    ) {
        Ok(root) => root,
        Err(e) => {
            log.submit(&e.to_string());
            return e.exit_code();
        }
    };
    match execute_run(&root, config, log, cancel, journal) {
        Some(RunOutcome::Success { .. }) => EXIT_SUCCESS,
        Some(RunOutcome::Failure { .. }) | Some(RunOutcome::Canceled) | None => EXIT_FAILURE,
    }
}
