/*!
 * Integration tests for supervised copy-engine execution
 */

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::{tempdir, TempDir};

use berth::config::BackupConfig;
use berth::core::cancel::cancellation;
use berth::core::log_sink::{LogSink, LogSinkOptions};
use berth::core::supervisor::{self, RunOutcome};

struct Harness {
    config: BackupConfig,
    sink: Option<LogSink>,
    log_path: PathBuf,
    _source: TempDir,
    _engine_dir: TempDir,
    _log_dir: TempDir,
}

/// Build a config around a fake shell-script engine.
fn harness(engine_script: &str) -> Harness {
    let source = tempdir().unwrap();
    std::fs::write(source.path().join("data.txt"), b"payload").unwrap();

    let engine_dir = tempdir().unwrap();
    let script = engine_dir.path().join("engine.sh");
    std::fs::write(&script, engine_script).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let log_dir = tempdir().unwrap();
    let log_path = log_dir.path().join("berth.log");
    let sink = LogSink::new(
        &log_path,
        LogSinkOptions {
            echo_console: false,
            ..LogSinkOptions::default()
        },
    )
    .unwrap();

    let mut config = BackupConfig::starter(source.path().to_path_buf());
    config.engine.program = script.display().to_string();
    config.engine.retry_flags.clear();
    config.engine.no_progress_flag = "--noop".to_string();
    config.exclude_patterns.clear();

    Harness {
        config,
        sink: Some(sink),
        log_path,
        _source: source,
        _engine_dir: engine_dir,
        _log_dir: log_dir,
    }
}

impl Harness {
    fn drain_log(&mut self) -> String {
        self.sink.take().unwrap().shutdown();
        std::fs::read_to_string(&self.log_path).unwrap()
    }
}

#[test]
fn exit_zero_is_success() {
    let mut h = harness("#!/bin/sh\nexit 0\n");
    let target = tempdir().unwrap();
    let (_cancel_handle, cancel) = cancellation();

    let log = h.sink.as_ref().unwrap().handle();
    let outcome = supervisor::run(target.path(), &h.config, &log, &cancel).unwrap();
    assert_eq!(outcome, RunOutcome::Success { exit_code: 0 });

    let contents = h.drain_log();
    assert!(contents.contains("Backup completed successfully"));
    assert!(target.path().join("Backup").is_dir());
}

#[test]
fn exit_code_below_threshold_is_success() {
    let mut h = harness("#!/bin/sh\nexit 3\n");
    let target = tempdir().unwrap();
    let (_cancel_handle, cancel) = cancellation();

    let log = h.sink.as_ref().unwrap().handle();
    let outcome = supervisor::run(target.path(), &h.config, &log, &cancel).unwrap();
    assert_eq!(outcome, RunOutcome::Success { exit_code: 3 });
    drop(h.drain_log());
}

#[test]
fn exit_code_eight_is_failure_with_summary_tail() {
    let script = "#!/bin/sh\n\
        i=0\n\
        while [ $i -lt 40 ]; do\n\
        echo \"copied file $i\"\n\
        i=$((i+1))\n\
        done\n\
        exit 8\n";
    let mut h = harness(script);
    let target = tempdir().unwrap();
    let (_cancel_handle, cancel) = cancellation();

    let log = h.sink.as_ref().unwrap().handle();
    let outcome = supervisor::run(target.path(), &h.config, &log, &cancel).unwrap();
    assert_eq!(outcome, RunOutcome::Failure { exit_code: 8 });

    let contents = h.drain_log();
    assert!(contents.contains("Backup failed: engine exit code 8"));
    // The tail holds the last 15 of the 40 summary lines.
    assert!(contents.contains("copied file 39"));
    assert!(contents.contains("copied file 25"));
    assert!(!contents.contains("copied file 24"));
}

#[test]
fn important_lines_are_forwarded_immediately() {
    let script = "#!/bin/sh\n\
        echo \"boring progress line\"\n\
        echo \"ERROR 32 (0x00000020) copying file\" 1>&2\n\
        echo \"warning: retry scheduled\"\n\
        exit 0\n";
    let mut h = harness(script);
    let target = tempdir().unwrap();
    let (_cancel_handle, cancel) = cancellation();

    let log = h.sink.as_ref().unwrap().handle();
    let outcome = supervisor::run(target.path(), &h.config, &log, &cancel).unwrap();
    assert!(outcome.is_success());

    let contents = h.drain_log();
    assert!(contents.contains("ERROR 32"));
    assert!(contents.contains("warning: retry scheduled"));
    // Non-important lines still arrive through the summary tail.
    assert!(contents.contains("boring progress line"));
}

#[test]
fn missing_source_fails_fast_without_spawning() {
    let mut h = harness("#!/bin/sh\necho SPAWNED > engine-ran.txt\nexit 0\n");
    h.config.source = PathBuf::from("/no/such/source");
    let target = tempdir().unwrap();
    let (_cancel_handle, cancel) = cancellation();

    let log = h.sink.as_ref().unwrap().handle();
    let result = supervisor::run(target.path(), &h.config, &log, &cancel);
    assert!(result.is_err());
    assert!(!target.path().join("engine-ran.txt").exists());
    drop(h.drain_log());
}

#[test]
fn cancellation_yields_canceled_and_kills_the_process_tree() {
    // The engine spawns a helper, records its pid, and blocks; group
    // termination must take the helper down too.
    let script = "#!/bin/sh\n\
        sleep 30 &\n\
        echo $! > \"$2/helper.pid\"\n\
        wait\n";
    let mut h = harness(script);
    let target = tempdir().unwrap();
    let (cancel_handle, cancel) = cancellation();

    let log = h.sink.as_ref().unwrap().handle();
    let config = h.config.clone();
    let target_path = target.path().to_path_buf();
    let worker = std::thread::spawn(move || {
        supervisor::run(&target_path, &config, &log, &cancel).unwrap()
    });

    // Let the engine start and write the helper pid.
    let pid_file = target.path().join("Backup").join("helper.pid");
    wait_for(&pid_file, Duration::from_secs(5));

    cancel_handle.cancel();
    let outcome = worker.join().unwrap();
    assert_eq!(outcome, RunOutcome::Canceled);

    // Helper must be gone shortly after the group was signalled.
    let helper_pid = std::fs::read_to_string(&pid_file).unwrap();
    let helper_pid = helper_pid.trim().to_string();
    std::thread::sleep(Duration::from_millis(800));
    let alive = std::process::Command::new("kill")
        .args(["-0", &helper_pid])
        .status()
        .unwrap()
        .success();
    assert!(!alive, "helper process survived group termination");

    let contents = h.drain_log();
    assert!(contents.contains("Backup canceled"));
    assert!(!contents.contains("Backup failed"));
}

fn wait_for(path: &Path, timeout: Duration) {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if path.exists() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("timed out waiting for {}", path.display());
}
