/*!
 * Supervised copy-engine execution
 *
 * Spawns the external copy engine with captured output, classifies every
 * line (important lines go to the log immediately, the rest feed a bounded
 * summary ring or, in verbose mode, a rate-limited live stream), enforces
 * cancellation by terminating the engine's whole process group, and maps
 * the engine's exit code onto the run outcome. Exit codes at or above
 * `FAILURE_THRESHOLD` are failures, matching the bit-flag convention of
 * file-copy utilities where low bits are informational.
 */

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::num::NonZeroU32;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::BackupConfig;
use crate::core::cancel::CancelToken;
use crate::core::log_sink::LogHandle;
use crate::error::{BerthError, Result};

/// Engine exit codes at or above this value are real failures
pub const FAILURE_THRESHOLD: i32 = 8;

/// Ring-buffer capacity for non-important output lines
pub const SUMMARY_CAPACITY: usize = 30;

/// How many ring-buffer entries are flushed when the run ends
pub const SUMMARY_TAIL: usize = 15;

/// Verbose-mode forwarding rate limit
pub const VERBOSE_LINES_PER_SEC: u32 = 5;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const TERM_GRACE: Duration = Duration::from_millis(500);

type LineLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;
type SummaryBuffer = Arc<Mutex<VecDeque<String>>>;

/// Outcome of one supervised engine invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success { exit_code: i32 },
    Failure { exit_code: i32 },
    Canceled,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success { .. })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RunOutcome::Success { exit_code } | RunOutcome::Failure { exit_code } => {
                Some(*exit_code)
            }
            RunOutcome::Canceled => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Success { .. } => "success",
            RunOutcome::Failure { .. } => "failure",
            RunOutcome::Canceled => "canceled",
        }
    }
}

/// Run the copy engine against `target_root` and supervise it to
/// completion or cancellation.
///
/// Fails fast (no subprocess) when the source directory is missing or the
/// destination tree cannot be created; everything after the spawn is
/// reported through the returned outcome, never as an error.
pub fn run(
    target_root: &Path,
    config: &BackupConfig,
    log: &LogHandle,
    cancel: &CancelToken,
) -> Result<RunOutcome> {
    if !config.source.is_dir() {
        return Err(BerthError::SourceMissing(config.source.clone()));
    }
    let destination = target_root.join(&config.destination_folder);
    std::fs::create_dir_all(&destination)?;

    let args = build_engine_args(&config.source, &destination, config);
    log.submit(&format!(
        "launching copy engine: {} {}",
        config.engine.program,
        args.join(" ")
    ));

    let mut command = Command::new(&config.engine.program);
    command
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group so cancellation can take out helper processes
        // the engine spawns, not just the engine itself.
        command.process_group(0);
    }

    let mut child = command.spawn().map_err(|e| {
        BerthError::EngineSpawn(format!("{}: {}", config.engine.program, e))
    })?;

    if config.low_priority {
        lower_priority(&child, log);
    }

    let summary: SummaryBuffer =
        Arc::new(Mutex::new(VecDeque::with_capacity(SUMMARY_CAPACITY)));
    let limiter: Arc<LineLimiter> = Arc::new(RateLimiter::direct(Quota::per_second(
        NonZeroU32::new(VERBOSE_LINES_PER_SEC).unwrap(),
    )));

    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(
            "berth-engine-stdout",
            stdout,
            log.clone(),
            Arc::clone(&summary),
            Arc::clone(&limiter),
            config.verbose,
        ));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(
            "berth-engine-stderr",
            stderr,
            log.clone(),
            Arc::clone(&summary),
            Arc::clone(&limiter),
            config.verbose,
        ));
    }

    let outcome = supervise_wait(&mut child, cancel, log);

    // Pipes close once the process group is gone; readers drain and exit.
    for reader in readers.into_iter().flatten() {
        let _ = reader.join();
    }

    match outcome {
        RunOutcome::Success { exit_code } => {
            if !config.verbose {
                dump_summary(&summary, log);
            }
            log.submit(&format!(
                "Backup completed successfully (engine exit code {})",
                exit_code
            ));
        }
        RunOutcome::Failure { exit_code } => {
            dump_summary(&summary, log);
            log.submit(&format!("Backup failed: engine exit code {}", exit_code));
        }
        RunOutcome::Canceled => {
            log.submit("Backup canceled");
        }
    }

    Ok(outcome)
}

/// `<source> <destination> <retry-flags> <no-progress> [mirror]
/// [exclusions]`, spellings taken from configuration.
pub fn build_engine_args(
    source: &Path,
    destination: &Path,
    config: &BackupConfig,
) -> Vec<String> {
    let engine = &config.engine;
    let mut args = vec![
        source.display().to_string(),
        destination.display().to_string(),
    ];
    args.extend(engine.retry_flags.iter().cloned());
    args.push(engine.no_progress_flag.clone());
    if config.mirror {
        args.push(engine.mirror_flag.clone());
    }
    for pattern in &config.exclude_patterns {
        args.push(engine.exclude_flag.clone());
        args.push(pattern.clone());
    }
    args
}

/// Lines carrying these tokens are forwarded to the log unconditionally.
pub fn is_important(line: &str) -> bool {
    let upper = line.to_uppercase();
    upper.contains("ERROR") || upper.contains("FAILED") || upper.contains("WARNING")
}

fn spawn_reader<R>(
    name: &str,
    stream: R,
    log: LogHandle,
    summary: SummaryBuffer,
    limiter: Arc<LineLimiter>,
    verbose: bool,
) -> Option<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    let log_for_closure = log.clone();
    let spawned = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let log = log_for_closure;
            let reader = BufReader::new(stream);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                if is_important(&line) {
                    log.submit(&line);
                } else if verbose && limiter.check().is_ok() {
                    log.submit(&line);
                } else {
                    push_summary(&summary, line);
                }
            }
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            log.submit(&format!("could not attach engine output reader: {}", e));
            None
        }
    }
}

fn push_summary(summary: &SummaryBuffer, line: String) {
    if let Ok(mut buf) = summary.lock() {
        if buf.len() == SUMMARY_CAPACITY {
            buf.pop_front();
        }
        buf.push_back(line);
    }
}

fn dump_summary(summary: &SummaryBuffer, log: &LogHandle) {
    if let Ok(buf) = summary.lock() {
        let skip = buf.len().saturating_sub(SUMMARY_TAIL);
        for line in buf.iter().skip(skip) {
            log.submit(line);
        }
    }
}

fn supervise_wait(child: &mut Child, cancel: &CancelToken, log: &LogHandle) -> RunOutcome {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return outcome_from_status(status),
            Ok(None) => {}
            Err(e) => {
                log.submit(&format!("lost track of copy engine: {}", e));
                terminate_tree(child, log);
                return RunOutcome::Failure { exit_code: -1 };
            }
        }
        if cancel.wait_timeout(WAIT_POLL_INTERVAL) {
            terminate_tree(child, log);
            return RunOutcome::Canceled;
        }
    }
}

fn outcome_from_status(status: ExitStatus) -> RunOutcome {
    // Killed-by-signal has no code; that is never a success.
    let code = status.code().unwrap_or(-1);
    if (0..FAILURE_THRESHOLD).contains(&code) {
        RunOutcome::Success { exit_code: code }
    } else {
        RunOutcome::Failure { exit_code: code }
    }
}

#[cfg(unix)]
fn terminate_tree(child: &mut Child, log: &LogHandle) {
    // The child leads its own group, so its pid doubles as the pgid.
    let pgid = child.id() as libc::pid_t;
    unsafe {
        libc::killpg(pgid, libc::SIGTERM);
    }
    let deadline = Instant::now() + TERM_GRACE;
    while Instant::now() < deadline {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        thread::sleep(Duration::from_millis(25));
    }
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            log.submit(&format!(
                "could not kill copy engine process group: {}",
                err
            ));
        }
    }
    let _ = child.wait();
}

#[cfg(not(unix))]
fn terminate_tree(child: &mut Child, log: &LogHandle) {
    if let Err(e) = child.kill() {
        log.submit(&format!("could not kill copy engine: {}", e));
    }
    let _ = child.wait();
}

#[cfg(unix)]
fn lower_priority(child: &Child, log: &LogHandle) {
    let pgid = child.id() as libc::id_t;
    let rc = unsafe { libc::setpriority(libc::PRIO_PGRP, pgid, 10) };
    if rc != 0 {
        log.submit(&format!(
            "note: could not lower copy engine priority: {}",
            std::io::Error::last_os_error()
        ));
    }
}

#[cfg(not(unix))]
fn lower_priority(_child: &Child, _log: &LogHandle) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackupConfig;
    use std::path::PathBuf;

    fn test_config() -> BackupConfig {
        let mut config = BackupConfig::starter(PathBuf::from("/data"));
        config.engine.program = "copytool".to_string();
        config.engine.retry_flags = vec!["/R:2".to_string(), "/W:5".to_string()];
        config.engine.no_progress_flag = "/NP".to_string();
        config.engine.mirror_flag = "/MIR".to_string();
        config.engine.exclude_flag = "/XD".to_string();
        config.exclude_patterns.clear();
        config
    }

    #[test]
    fn test_build_args_basic() {
        let config = test_config();
        let args = build_engine_args(
            Path::new("/data"),
            Path::new("/mnt/usb/Backup"),
            &config,
        );
        assert_eq!(args, vec!["/data", "/mnt/usb/Backup", "/R:2", "/W:5", "/NP"]);
    }

    #[test]
    fn test_build_args_mirror_and_excludes() {
        let mut config = test_config();
        config.mirror = true;
        config.exclude_patterns = vec!["*.tmp".to_string(), "cache".to_string()];
        let args = build_engine_args(
            Path::new("/data"),
            Path::new("/mnt/usb/Backup"),
            &config,
        );
        assert_eq!(
            args,
            vec![
                "/data",
                "/mnt/usb/Backup",
                "/R:2",
                "/W:5",
                "/NP",
                "/MIR",
                "/XD",
                "*.tmp",
                "/XD",
                "cache"
            ]
        );
    }

    #[test]
    fn test_is_important_matches_case_insensitively() {
        assert!(is_important("2024/01/01 ERROR 32 (0x00000020)"));
        assert!(is_important("access Failed for file"));
        assert!(is_important("warning: skipping junction"));
        assert!(!is_important("  New File          1234  report.pdf"));
    }

    #[test]
    fn test_summary_ring_is_bounded() {
        let summary: SummaryBuffer = Arc::new(Mutex::new(VecDeque::new()));
        for i in 0..100 {
            push_summary(&summary, format!("line {}", i));
        }
        let buf = summary.lock().unwrap();
        assert_eq!(buf.len(), SUMMARY_CAPACITY);
        assert_eq!(buf.front().unwrap(), "line 70");
        assert_eq!(buf.back().unwrap(), "line 99");
    }

    #[cfg(unix)]
    #[test]
    fn test_outcome_threshold() {
        use std::os::unix::process::ExitStatusExt;

        let ok = ExitStatus::from_raw(0);
        assert_eq!(outcome_from_status(ok), RunOutcome::Success { exit_code: 0 });

        let info = ExitStatus::from_raw(3 << 8);
        assert_eq!(
            outcome_from_status(info),
            RunOutcome::Success { exit_code: 3 }
        );

        let failed = ExitStatus::from_raw(8 << 8);
        assert_eq!(
            outcome_from_status(failed),
            RunOutcome::Failure { exit_code: 8 }
        );

        // Killed by signal: no exit code, never a success.
        let signaled = ExitStatus::from_raw(libc::SIGKILL);
        assert_eq!(
            outcome_from_status(signaled),
            RunOutcome::Failure { exit_code: -1 }
        );
    }

    #[test]
    fn test_outcome_accessors() {
        assert!(RunOutcome::Success { exit_code: 1 }.is_success());
        assert!(!RunOutcome::Canceled.is_success());
        assert_eq!(RunOutcome::Failure { exit_code: 16 }.exit_code(), Some(16));
        assert_eq!(RunOutcome::Canceled.exit_code(), None);
        assert_eq!(RunOutcome::Canceled.label(), "canceled");
    }
}
