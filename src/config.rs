/*!
 * Configuration types for berth
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BerthError, Result};

/// Main configuration for the backup daemon
///
/// Loaded once at startup from a TOML file and treated as immutable for the
/// daemon's lifetime. CLI flags may override individual fields before the
/// daemon starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory to back up
    pub source: PathBuf,

    /// Folder name created at the root of the target volume
    #[serde(default = "default_destination_folder")]
    pub destination_folder: String,

    /// Mirror mode: pass the engine's mirror flag (deletions propagate)
    #[serde(default)]
    pub mirror: bool,

    /// Exclusion patterns handed to the copy engine (glob syntax)
    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    /// Marker filename whose presence at a volume root authorizes it
    #[serde(default = "default_sentinel_name")]
    pub sentinel_name: String,

    /// Explicit target root; set, it bypasses sentinel discovery
    #[serde(default)]
    pub explicit_root: Option<PathBuf>,

    /// Forward all engine output (rate-limited) instead of the summary tail
    #[serde(default)]
    pub verbose: bool,

    /// Keep watching after startup; false means resolve once and exit
    #[serde(default = "default_true")]
    pub stay_running: bool,

    /// One-shot mode only: widen the sentinel scan beyond removable volumes
    #[serde(default)]
    pub scan_all_volumes: bool,

    /// Debounce window for repeated arrivals of the same root (seconds)
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,

    /// Backup log file (line-oriented, timestamped)
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,

    /// Optional run journal (JSON Lines, one record per run event)
    #[serde(default)]
    pub journal_file: Option<PathBuf>,

    /// Run the copy engine at lowered scheduling priority
    #[serde(default = "default_true")]
    pub low_priority: bool,

    /// Copy engine command and flag spellings
    #[serde(default)]
    pub engine: EngineConfig,
}

/// External copy-engine invocation: program plus the flag spellings used to
/// assemble `<source> <dest> <retry-flags> <no-progress> [mirror]
/// [exclusions]`. Defaults follow robocopy conventions on Windows and rsync
/// conventions elsewhere; the exit-code contract (>= 8 is failure) is the
/// same either way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_program")]
    pub program: String,

    /// Bounded retry/wait flags passed verbatim
    #[serde(default = "default_retry_flags")]
    pub retry_flags: Vec<String>,

    #[serde(default = "default_no_progress_flag")]
    pub no_progress_flag: String,

    #[serde(default = "default_mirror_flag")]
    pub mirror_flag: String,

    /// Flag emitted before each exclusion pattern
    #[serde(default = "default_exclude_flag")]
    pub exclude_flag: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: default_engine_program(),
            retry_flags: default_retry_flags(),
            no_progress_flag: default_no_progress_flag(),
            mirror_flag: default_mirror_flag(),
            exclude_flag: default_exclude_flag(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_destination_folder() -> String {
    "Backup".to_string()
}

fn default_sentinel_name() -> String {
    ".backup-target".to_string()
}

fn default_debounce_secs() -> u64 {
    8
}

fn default_log_file() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("berth").join("berth.log"))
        .unwrap_or_else(|| PathBuf::from("berth.log"))
}

#[cfg(windows)]
fn default_engine_program() -> String {
    "robocopy".to_string()
}

#[cfg(not(windows))]
fn default_engine_program() -> String {
    "rsync".to_string()
}

#[cfg(windows)]
fn default_retry_flags() -> Vec<String> {
    vec!["/R:2".to_string(), "/W:5".to_string()]
}

#[cfg(not(windows))]
fn default_retry_flags() -> Vec<String> {
    vec!["--archive".to_string(), "--timeout=30".to_string()]
}

#[cfg(windows)]
fn default_no_progress_flag() -> String {
    "/NP".to_string()
}

#[cfg(not(windows))]
fn default_no_progress_flag() -> String {
    "--no-motd".to_string()
}

#[cfg(windows)]
fn default_mirror_flag() -> String {
    "/MIR".to_string()
}

#[cfg(not(windows))]
fn default_mirror_flag() -> String {
    "--delete".to_string()
}

#[cfg(windows)]
fn default_exclude_flag() -> String {
    "/XD".to_string()
}

#[cfg(not(windows))]
fn default_exclude_flag() -> String {
    "--exclude".to_string()
}

impl BackupConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BerthError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: BackupConfig = toml::from_str(&contents)
            .map_err(|e| BerthError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| BerthError::Config(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Validate startup invariants. Failures here are fatal: the daemon
    /// reports them and exits before any watching begins.
    pub fn validate(&self) -> Result<()> {
        if !self.source.is_dir() {
            return Err(BerthError::SourceMissing(self.source.clone()));
        }
        if self.sentinel_name.is_empty() || has_separator(&self.sentinel_name) {
            return Err(BerthError::Config(format!(
                "sentinel_name must be a bare filename, got '{}'",
                self.sentinel_name
            )));
        }
        if self.destination_folder.is_empty() || has_separator(&self.destination_folder) {
            return Err(BerthError::Config(format!(
                "destination_folder must be a bare folder name, got '{}'",
                self.destination_folder
            )));
        }
        if self.debounce_secs == 0 {
            return Err(BerthError::Config(
                "debounce_secs must be at least 1".to_string(),
            ));
        }
        for pattern in &self.exclude_patterns {
            glob::Pattern::new(pattern).map_err(|e| {
                BerthError::Config(format!("invalid exclude pattern '{}': {}", pattern, e))
            })?;
        }
        if self.engine.program.is_empty() {
            return Err(BerthError::Config(
                "engine.program must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// A starter configuration for `berth init`
    pub fn starter(source: PathBuf) -> Self {
        Self {
            source,
            destination_folder: default_destination_folder(),
            mirror: false,
            exclude_patterns: vec!["*.tmp".to_string(), "node_modules".to_string()],
            sentinel_name: default_sentinel_name(),
            explicit_root: None,
            verbose: false,
            stay_running: true,
            scan_all_volumes: false,
            debounce_secs: default_debounce_secs(),
            log_file: default_log_file(),
            journal_file: None,
            low_priority: true,
            engine: EngineConfig::default(),
        }
    }
}

fn has_separator(name: &str) -> bool {
    name.contains('/') || name.contains('\\')
}
