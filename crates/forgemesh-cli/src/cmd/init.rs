//! `forgemesh init` — write a default config file.

use crate::config::default_config_path;
use crate::ui;
use chrono::Utc;
use forgemesh_types::config::NodeConfig;
use forgemesh_types::error::{MeshError, MeshResult};
use std::path::{Path, PathBuf};

pub fn cmd_init(config_path: Option<PathBuf>, force: bool) {
    let path = config_path.unwrap_or_else(default_config_path);
    match write_default_config(&path, force) {
        Ok(backup) => {
            ui::banner();
            ui::blank();
            if let Some(backup) = backup {
                ui::kv("Backup", &backup.display().to_string());
            }
            ui::success(&format!("Wrote {}", path.display()));
            ui::hint("Edit node_id and bootstrap_peers, then run `forgemesh start`");
        }
        Err(MeshError::Config(msg)) => {
            ui::error(&msg);
            ui::hint("Use --force to replace it");
            std::process::exit(1);
        }
        Err(e) => {
            ui::error(&format!("Failed to write config: {e}"));
            std::process::exit(1);
        }
    }
}

/// Write a fresh config with a newly generated node ID.
///
/// With `force`, an existing file is renamed aside first and the backup
/// path is returned.
fn write_default_config(path: &Path, force: bool) -> MeshResult<Option<PathBuf>> {
    if path.exists() && !force {
        return Err(MeshError::Config(format!(
            "{} already exists",
            path.display()
        )));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let backup = backup_existing_config(path)?;
    let contents = toml::to_string_pretty(&NodeConfig::default())
        .map_err(|e| MeshError::Serialization(e.to_string()))?;
    std::fs::write(path, contents)?;
    Ok(backup)
}

/// Rename an existing config to `config.toml.backup-<timestamp>`.
pub(crate) fn backup_existing_config(config_path: &Path) -> std::io::Result<Option<PathBuf>> {
    if !config_path.exists() {
        return Ok(None);
    }

    let file_name = config_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("config.toml");
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    let backup_path = config_path.with_file_name(format!("{file_name}.backup-{timestamp}"));

    std::fs::rename(config_path, &backup_path)?;
    Ok(Some(backup_path))
}
