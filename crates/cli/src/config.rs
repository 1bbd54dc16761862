//! Config discovery and loading (SPEC_FULL.md §1): a project-local
//! `atc.toml`, falling back to a file under the user's config dir, falling
//! back to pure defaults. Every field can still be overridden by a CLI flag
//! or environment variable at the call site in `main.rs`.

use std::path::{Path, PathBuf};

use atc_protocol::defaults;
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: defaults::DEFAULT_BIND_HOST.to_string(),
            port: defaults::DEFAULT_BIND_PORT,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    /// Hex-encoded accepted tokens. Empty means authentication is disabled
    /// (spec §6's loopback-by-default posture).
    pub tokens: Vec<String>,
    /// Workspace root handed to every tool invocation. Defaults to the
    /// process working directory if unset.
    pub workspace_root: Option<PathBuf>,
}

const PROJECT_CONFIG_FILE: &str = "atc.toml";

/// Resolution order: `./atc.toml` in the current directory, then
/// `<user config dir>/atc/atc.toml`, then built-in defaults if neither
/// exists or fails to parse.
pub fn discover_and_load() -> Config {
    if let Some(config) = try_load(Path::new(PROJECT_CONFIG_FILE)) {
        info!(path = PROJECT_CONFIG_FILE, "loaded project-local config");
        return config;
    }

    if let Some(dir) = directories::ProjectDirs::from("", "", "atc") {
        let path = dir.config_dir().join(PROJECT_CONFIG_FILE);
        if let Some(config) = try_load(&path) {
            info!(path = %path.display(), "loaded user config");
            return config;
        }
    }

    debug!("no config file found, using defaults");
    Config::default()
}

fn try_load(path: &Path) -> Option<Config> {
    let contents = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&contents) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to parse config file, ignoring");
            None
        },
    }
}

/// Storage directory for any persisted state (spec §6: `~/.moonbot/`).
/// Nothing in the core is required to persist, but nodes/auth material
/// loaded "read-only at startup" lives here.
pub fn storage_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|b| b.home_dir().join(defaults::STORAGE_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(defaults::STORAGE_DIR_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.server.bind, defaults::DEFAULT_BIND_HOST);
        assert_eq!(config.server.port, defaults::DEFAULT_BIND_PORT);
        assert!(config.tokens.is_empty());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let result = try_load(&dir.path().join("missing.toml"));
        assert!(result.is_none());
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("atc.toml");
        std::fs::write(&path, "not valid toml [[[").unwrap();
        assert!(try_load(&path).is_none());
    }

    #[test]
    fn parses_a_well_formed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("atc.toml");
        std::fs::write(&path, "tokens = [\"deadbeef\"]\n\n[server]\nbind = \"0.0.0.0\"\nport = 9000\n").unwrap();
        let config = try_load(&path).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.tokens, vec!["deadbeef".to_string()]);
    }
}
