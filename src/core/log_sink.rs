/*!
 * Bounded asynchronous log sink
 *
 * Submissions are non-blocking: lines are timestamped, optionally echoed to
 * the console, and pushed into a drop-oldest queue drained by a single
 * writer thread. The writer batches disk writes and flushes every
 * `FLUSH_EVERY_LINES` lines or every `FLUSH_INTERVAL`, whichever comes
 * first, and always flushes on shutdown within a bounded grace period.
 * Sustained saturation is never silent: the first dropped line and every
 * 100th thereafter surface a warning through the console echo and a
 * best-effort synchronous file append.
 */

use chrono::Local;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::core::cancel::{cancellation, CancelHandle, CancelToken};
use crate::core::channel::{lossy, LossySender};
use crate::error::{BerthError, Result};

pub const QUEUE_CAPACITY: usize = 4096;
pub const FLUSH_EVERY_LINES: usize = 50;
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(400);
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// A timestamped line queued for the writer.
struct LogLine {
    stamp: String,
    text: String,
}

#[derive(Debug, Clone)]
pub struct LogSinkOptions {
    /// Echo every line to stdout as it is submitted
    pub echo_console: bool,
    pub queue_capacity: usize,
    pub flush_every_lines: usize,
    pub flush_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for LogSinkOptions {
    fn default() -> Self {
        Self {
            echo_console: true,
            queue_capacity: QUEUE_CAPACITY,
            flush_every_lines: FLUSH_EVERY_LINES,
            flush_interval: FLUSH_INTERVAL,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }
}

/// The owning side of the sink; spawns and later reaps the writer thread.
pub struct LogSink {
    handle: LogHandle,
    stop: CancelHandle,
    done_rx: Receiver<()>,
    writer: Option<JoinHandle<()>>,
    grace: Duration,
}

impl LogSink {
    pub fn new(path: &Path, options: LogSinkOptions) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    BerthError::LogSetup(format!(
                        "cannot create log directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        // Open once up front so an unwritable log path fails at startup
        // instead of being silently swallowed by the writer.
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                BerthError::LogSetup(format!("cannot open {}: {}", path.display(), e))
            })?;

        let (tx, rx) = lossy::<LogLine>(options.queue_capacity);
        let (stop, stop_token) = cancellation();
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);

        let buffer_size = writer_buffer_size(path);
        let flush_every = options.flush_every_lines.max(1);
        let flush_interval = options.flush_interval;
        let grace = options.shutdown_grace;

        let writer = thread::Builder::new()
            .name("berth-log-writer".to_string())
            .spawn(move || {
                let mut out = BufWriter::with_capacity(buffer_size, file);
                writer_loop(&rx, &stop_token, &mut out, flush_every, flush_interval, grace);
                let _ = out.flush();
                let _ = done_tx.send(());
            })
            .map_err(|e| BerthError::LogSetup(format!("cannot spawn log writer: {}", e)))?;

        let handle = LogHandle {
            tx,
            echo: options.echo_console,
            dropped: Arc::new(AtomicU64::new(0)),
            path: Arc::new(path.to_path_buf()),
        };

        Ok(Self {
            handle,
            stop,
            done_rx,
            writer: Some(writer),
            grace,
        })
    }

    /// A cloneable submission handle for producers.
    pub fn handle(&self) -> LogHandle {
        self.handle.clone()
    }

    /// Stop the writer, giving it the configured grace period to flush.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if let Some(writer) = self.writer.take() {
            self.stop.cancel();
            // The writer drains within its own grace deadline; wait a
            // little longer than that before giving up on the join.
            let wait = self.grace + Duration::from_millis(500);
            match self.done_rx.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => {} // writer wedged on I/O
                _ => {
                    let _ = writer.join();
                }
            }
        }
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

/// Cloneable, non-blocking submission handle.
#[derive(Clone)]
pub struct LogHandle {
    tx: LossySender<LogLine>,
    echo: bool,
    dropped: Arc<AtomicU64>,
    path: Arc<PathBuf>,
}

impl LogHandle {
    /// Submit one line. Never blocks; under saturation the oldest queued
    /// line is dropped to admit this one.
    pub fn submit(&self, text: &str) {
        let stamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
        if self.echo {
            println!("{} {}", stamp, text);
        }
        let discarded = self.tx.send(LogLine {
            stamp,
            text: text.to_string(),
        });
        if discarded > 0 {
            self.note_drops(discarded);
        }
    }

    /// Total lines dropped so far.
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn note_drops(&self, discarded: u64) {
        let prev = self.dropped.fetch_add(discarded, Ordering::Relaxed);
        let total = prev + discarded;
        if should_warn(prev, total) {
            let stamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
            let warning = format!(
                "WARNING: log queue saturated, {} lines dropped so far",
                total
            );
            if self.echo {
                eprintln!("{} {}", stamp, warning);
            }
            // Bypass the queue: a saturation report must not depend on the
            // queue it is reporting on.
            if let Ok(mut file) = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path.as_ref())
            {
                let _ = writeln!(file, "{} {}", stamp, warning);
            }
        }
    }
}

/// Warn on the first drop and on each crossing of a 100-drop boundary.
fn should_warn(prev_total: u64, new_total: u64) -> bool {
    prev_total == 0 || prev_total / 100 != new_total / 100
}

fn writer_loop(
    rx: &Receiver<LogLine>,
    stop: &CancelToken,
    out: &mut BufWriter<std::fs::File>,
    flush_every: usize,
    flush_interval: Duration,
    grace: Duration,
) {
    let mut pending = 0usize;
    let mut next_flush = Instant::now() + flush_interval;

    loop {
        let timeout = next_flush.saturating_duration_since(Instant::now());
        crossbeam_channel::select! {
            recv(rx) -> msg => match msg {
                Ok(line) => {
                    let _ = writeln!(out, "{} {}", line.stamp, line.text);
                    pending += 1;
                    if pending >= flush_every {
                        let _ = out.flush();
                        pending = 0;
                        next_flush = Instant::now() + flush_interval;
                    }
                }
                Err(_) => return,
            },
            recv(stop.channel()) -> _ => break,
            default(timeout) => {
                if pending > 0 {
                    let _ = out.flush();
                    pending = 0;
                }
                next_flush = Instant::now() + flush_interval;
            }
        }
    }

    // Shutdown: drain whatever is already queued, bounded by the grace
    // period, then flush.
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        match rx.try_recv() {
            Ok(line) => {
                let _ = writeln!(out, "{} {}", line.stamp, line.text);
            }
            Err(_) => break,
        }
    }
}

/// Pick the writer's buffer size from the volume class backing the log
/// path: removable and network media get a larger buffer, fixed media a
/// smaller one. Functionally inert, purely a throughput knob.
fn writer_buffer_size(path: &Path) -> usize {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let mut best: Option<(usize, bool)> = None;
    for disk in disks.iter() {
        let mount = disk.mount_point();
        if path.starts_with(mount) {
            let len = mount.as_os_str().len();
            if best.map_or(true, |(l, _)| len > l) {
                best = Some((len, disk.is_removable()));
            }
        }
    }
    match best {
        Some((_, true)) => 64 * 1024,
        _ => 16 * 1024,
    }
}
