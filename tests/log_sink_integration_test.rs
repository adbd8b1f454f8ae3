/*!
 * Log sink behavior across restarts and concurrent submitters
 */

use std::path::Path;
use std::time::Duration;

use tempfile::tempdir;

use berth::core::log_sink::{LogSink, LogSinkOptions};

fn quiet_options() -> LogSinkOptions {
    LogSinkOptions {
        echo_console: false,
        ..LogSinkOptions::default()
    }
}

#[test]
fn log_file_is_append_only_across_sink_lifetimes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("berth.log");

    let first = LogSink::new(&path, quiet_options()).unwrap();
    first.handle().submit("from the first run");
    first.shutdown();

    let second = LogSink::new(&path, quiet_options()).unwrap();
    second.handle().submit("from the second run");
    second.shutdown();

    let contents = std::fs::read_to_string(&path).unwrap();
    let first_pos = contents.find("from the first run").unwrap();
    let second_pos = contents.find("from the second run").unwrap();
    assert!(first_pos < second_pos);
}

#[test]
fn concurrent_submitters_all_land_with_per_thread_order() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("berth.log");

    let sink = LogSink::new(&path, quiet_options()).unwrap();
    let mut workers = Vec::new();
    for thread_id in 0..4 {
        let handle = sink.handle();
        workers.push(std::thread::spawn(move || {
            for i in 0..25 {
                handle.submit(&format!("t{} line {:02}", thread_id, i));
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }
    sink.shutdown();

    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents.lines().count(), 100);

    // Enqueue order is preserved per submitter.
    for thread_id in 0..4 {
        let positions: Vec<usize> = (0..25)
            .map(|i| {
                contents
                    .find(&format!("t{} line {:02}", thread_id, i))
                    .unwrap()
            })
            .collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted);
    }
}

#[test]
fn every_line_carries_a_timestamp_prefix() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("berth.log");

    let sink = LogSink::new(&path, quiet_options()).unwrap();
    sink.handle().submit("stamped");
    sink.shutdown();

    let contents = std::fs::read_to_string(&path).unwrap();
    let line = contents.lines().next().unwrap();
    // "YYYY-MM-DD HH:MM:SS.mmm <text>"
    let (prefix, rest) = line.split_at(23);
    assert!(prefix.chars().next().unwrap().is_ascii_digit());
    assert_eq!(&prefix[4..5], "-");
    assert_eq!(&prefix[10..11], " ");
    assert_eq!(&prefix[19..20], ".");
    assert_eq!(rest.trim(), "stamped");
}

#[test]
fn shutdown_flushes_within_grace_even_with_queued_lines() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("berth.log");

    let sink = LogSink::new(&path, quiet_options()).unwrap();
    let handle = sink.handle();
    for i in 0..200 {
        handle.submit(&format!("queued line {}", i));
    }
    let started = std::time::Instant::now();
    sink.shutdown();
    assert!(started.elapsed() < Duration::from_secs(4));

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("queued line 199"));
}

#[test]
fn sink_creates_missing_parent_directories() {
    let dir = tempdir().unwrap();
    let path: std::path::PathBuf = dir.path().join("deep/nested/berth.log");

    let sink = LogSink::new(&path, quiet_options()).unwrap();
    sink.handle().submit("created the tree");
    sink.shutdown();

    assert!(Path::new(&path).exists());
}
