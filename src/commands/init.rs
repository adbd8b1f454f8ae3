/*!
 * Init command: write a starter configuration
 */

use anyhow::{bail, Context, Result};
use std::path::PathBuf;

use crate::config::BackupConfig;

/// Write a starter configuration file and report where it landed.
/// Refuses to overwrite an existing file unless `force` is set.
pub fn run(path: Option<PathBuf>, source: Option<PathBuf>, force: bool) -> Result<PathBuf> {
    let path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };
    if path.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }

    let source = source
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    let config = BackupConfig::starter(source);
    config
        .to_file(&path)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Default configuration file path
fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("could not determine config directory"))?;
    Ok(base.join("berth").join("berth.toml"))
}
