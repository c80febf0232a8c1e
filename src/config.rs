//! Configuration management for recheck
//!
//! Stores settings in ~/.config/recheck/config.json

use crate::error::{Error, Result};
use crate::logging::Logger;
use crate::util;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Plaintext API key fallback. The OPENROUTER_API_KEY environment
    /// variable takes precedence when set.
    pub openrouter_api_key: Option<String>,
    /// Cache entries kept before least-recently-used eviction.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Cached results older than this are treated as misses.
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: i64,
    /// Hash statically-imported files too, so edits to a dependency
    /// invalidate the tests that exercise it.
    #[serde(default = "default_track_dependencies")]
    pub track_dependencies: bool,
    /// Hard deadline for a single test process, in seconds.
    #[serde(default = "default_test_timeout_secs")]
    pub test_timeout_secs: u64,
    /// Ask before applying each suggested fix.
    #[serde(default = "default_confirm_fixes")]
    pub confirm_fixes: bool,
    /// Model requested from the assistant endpoint.
    #[serde(default = "default_assistant_model")]
    pub assistant_model: String,
    /// OpenRouter-compatible API base URL.
    #[serde(default = "default_assistant_base_url")]
    pub assistant_base_url: String,
}

fn default_max_entries() -> usize {
    200
}

fn default_max_age_hours() -> i64 {
    168 // one week
}

fn default_track_dependencies() -> bool {
    true
}

fn default_test_timeout_secs() -> u64 {
    120
}

fn default_confirm_fixes() -> bool {
    true
}

fn default_assistant_model() -> String {
    "anthropic/claude-sonnet-4".to_string()
}

fn default_assistant_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            openrouter_api_key: None,
            max_entries: default_max_entries(),
            max_age_hours: default_max_age_hours(),
            track_dependencies: default_track_dependencies(),
            test_timeout_secs: default_test_timeout_secs(),
            confirm_fixes: default_confirm_fixes(),
            assistant_model: default_assistant_model(),
            assistant_base_url: default_assistant_base_url(),
        }
    }
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("recheck"))
    }

    /// Get the config file path
    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Human-readable config location for help text.
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<config dir unavailable>".to_string())
    }

    /// Load config from disk, or return defaults.
    ///
    /// A missing file gets a starter config written so users can discover
    /// the tunables; a corrupt file is preserved next to the original and
    /// replaced by defaults with a warning.
    pub fn load(logger: &Logger) -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path, logger),
            None => Self::default(),
        }
    }

    /// Load from an explicit path. Never fails; degraded outcomes are logged.
    pub fn load_from(path: &Path, logger: &Logger) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(err) => {
                    preserve_corrupt_config(path, &content);
                    logger.warn(&format!(
                        "config file was corrupted ({}); a backup was saved and defaults were loaded",
                        err
                    ));
                    Self::default()
                }
            },
            Err(_) => {
                let config = Self::default();
                if let Err(err) = config.save_to(path) {
                    logger.debug(&format!("could not write starter config: {}", err));
                }
                config
            }
        }
    }

    /// Save config to the default location.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path().ok_or_else(|| {
            Error::Validation("could not determine config directory".to_string())
        })?;
        self.save_to(&path)
    }

    /// Save to an explicit path, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| Error::file_access(dir, e))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
            }
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::parse("config serialization", e))?;
        util::write_atomic(path, &content)
    }

    /// Get the OpenRouter API key (environment first, then config).
    pub fn get_api_key(&self) -> Option<String> {
        if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
            if !key.trim().is_empty() {
                return Some(key);
            }
        }
        self.openrouter_api_key.clone()
    }

    pub fn has_api_key(&self) -> bool {
        self.get_api_key().is_some()
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert!(config.openrouter_api_key.is_none());
        assert_eq!(config.max_entries, 200);
        assert_eq!(config.max_age_hours, 168);
        assert!(config.track_dependencies);
        assert!(config.confirm_fixes);
    }

    #[test]
    fn round_trip_preserves_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.max_entries = 50;
        config.test_timeout_secs = 30;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path, &Logger::silent());
        assert_eq!(loaded.max_entries, 50);
        assert_eq!(loaded.test_timeout_secs, 30);
    }

    #[test]
    fn missing_file_writes_starter_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let loaded = Config::load_from(&path, &Logger::silent());
        assert_eq!(loaded.max_entries, 200);
        assert!(path.exists());
    }

    #[test]
    fn corrupt_file_is_preserved_and_defaults_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not valid json").unwrap();

        let sink = Arc::new(crate::logging::MemorySink::default());
        let logger = Logger::with_sink(sink.clone(), false);
        let loaded = Config::load_from(&path, &logger);

        assert_eq!(loaded.max_entries, 200);
        assert!(path.with_extension("json.corrupt").exists());
        assert!(sink.contains("corrupted"));
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"max_entries": 10, "some_future_field": true}"#).unwrap();

        let loaded = Config::load_from(&path, &Logger::silent());
        assert_eq!(loaded.max_entries, 10);
        assert_eq!(loaded.max_age_hours, 168);
    }

    #[test]
    fn env_var_wins_over_config_key() {
        // std::env mutation is process-global; keep this the only test
        // touching OPENROUTER_API_KEY.
        let mut config = Config::default();
        config.openrouter_api_key = Some("sk-or-from-config".to_string());

        std::env::remove_var("OPENROUTER_API_KEY");
        assert_eq!(config.get_api_key().as_deref(), Some("sk-or-from-config"));

        std::env::set_var("OPENROUTER_API_KEY", "sk-or-from-env");
        assert_eq!(config.get_api_key().as_deref(), Some("sk-or-from-env"));
        std::env::remove_var("OPENROUTER_API_KEY");
    }
}
