/*!
 * Run journal
 *
 * Structured JSON Lines records for every backup run (one on start, one on
 * completion), for observability and after-the-fact forensics. Journal
 * write failures are swallowed: record-keeping must never affect daemon
 * behavior.
 */

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{BerthError, Result};

/// One journal entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// ISO 8601 timestamp with timezone
    pub timestamp: String,

    /// Correlates the start and completion records of one run
    pub run_id: String,

    pub source: String,
    pub destination: String,

    /// started, success, failure, canceled, or skipped
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunRecord {
    pub fn started(run_id: &str, source: &Path, destination: &Path) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            run_id: run_id.to_string(),
            source: source.display().to_string(),
            destination: destination.display().to_string(),
            status: "started".to_string(),
            exit_code: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn completed(
        run_id: &str,
        source: &Path,
        destination: &Path,
        status: &str,
        exit_code: Option<i32>,
        duration_ms: u64,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            run_id: run_id.to_string(),
            source: source.display().to_string(),
            destination: destination.display().to_string(),
            status: status.to_string(),
            exit_code,
            duration_ms: Some(duration_ms),
            error,
        }
    }
}

/// Fresh identifier for correlating one run's records.
pub fn new_run_id() -> String {
    format!("run-{}", Utc::now().format("%Y%m%d-%H%M%S%.3f"))
}

/// Append-only JSON Lines journal, safe to share across run workers.
pub struct RunJournal {
    writer: Mutex<BufWriter<std::fs::File>>,
    path: PathBuf,
}

impl RunJournal {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                BerthError::Config(format!(
                    "cannot open journal {}: {}",
                    path.display(),
                    e
                ))
            })?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Best-effort append; errors are swallowed by design.
    pub fn emit(&self, record: &RunRecord) {
        if let Ok(json) = serde_json::to_string(record) {
            if let Ok(mut writer) = self.writer.lock() {
                let _ = writeln!(writer, "{}", json);
                let _ = writer.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_start_and_completion_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let journal = RunJournal::open(&path).unwrap();

        let run_id = new_run_id();
        journal.emit(&RunRecord::started(
            &run_id,
            Path::new("/data"),
            Path::new("/mnt/usb/Backup"),
        ));
        journal.emit(&RunRecord::completed(
            &run_id,
            Path::new("/data"),
            Path::new("/mnt/usb/Backup"),
            "success",
            Some(0),
            1500,
            None,
        ));

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let start: RunRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(start.status, "started");
        assert_eq!(start.run_id, run_id);
        assert!(start.exit_code.is_none());

        let done: RunRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(done.status, "success");
        assert_eq!(done.exit_code, Some(0));
        assert_eq!(done.duration_ms, Some(1500));
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let record = RunRecord::started(
            "run-1",
            Path::new("/data"),
            Path::new("/mnt/usb/Backup"),
        );
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("exit_code"));
        assert!(!json.contains("duration_ms"));
        assert!(!json.contains("error"));
    }

    #[test]
    fn test_run_ids_are_unique_enough() {
        let a = new_run_id();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = new_run_id();
        assert_ne!(a, b);
    }
}
