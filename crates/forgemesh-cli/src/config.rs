//! Configuration loading from `~/.forgemesh/config.toml`.

use forgemesh_types::config::NodeConfig;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// `~/.forgemesh`, or a temp-dir fallback when there is no home directory.
pub fn forgemesh_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".forgemesh")
}

pub fn default_config_path() -> PathBuf {
    forgemesh_home().join("config.toml")
}

/// Load the node configuration, falling back to defaults.
///
/// A missing, unreadable, or malformed file is logged and replaced by
/// `NodeConfig::default()`.
pub fn load_config(path: Option<&Path>) -> NodeConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return NodeConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<NodeConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                NodeConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            NodeConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgemesh_types::config::{BootstrapPeer, DEFAULT_PORT};

    #[test]
    fn test_load_partial_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
node_id = "edge-1"
port = 24000

[[bootstrap_peers]]
host = "10.0.0.5"
port = 23001
"#,
        )
        .unwrap();

        let config = load_config(Some(&path));
        assert_eq!(config.node_id, "edge-1");
        assert_eq!(config.port, 24000);
        assert_eq!(config.bootstrap_peers, vec![BootstrapPeer::new("10.0.0.5", 23001)]);
        assert_eq!(config.host, "0.0.0.0");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.toml")));
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(!config.node_id.is_empty());
    }

    #[test]
    fn test_malformed_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();
        assert_eq!(load_config(Some(&path)).port, DEFAULT_PORT);
    }
}
