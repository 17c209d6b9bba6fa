//! User configuration (`config.json`).
//!
//! Saved to the platform config directory, e.g. `~/.config/boxcraft/` on
//! Linux and `~/Library/Application Support/boxcraft/` on macOS. A few keys
//! can be overridden from the environment.

use crate::attention::AttentionOptions;
use crate::git_status::MIN_POLL_INTERVAL;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Overrides `git_poll_interval_ms`
pub const ENV_GIT_POLL_MS: &str = "BOXCRAFT_GIT_POLL_MS";
/// Overrides `events_file`
pub const ENV_EVENTS_FILE: &str = "BOXCRAFT_EVENTS_FILE";

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// User preferences (persisted to config.json).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Time between working-tree polls
    pub git_poll_interval_ms: u64,
    /// Limit for a single `git status` call
    pub git_query_timeout_ms: u64,
    pub sound_enabled: bool,
    pub notifications_enabled: bool,
    /// Lifecycle event log; `None` means `~/.boxcraft/data/events.jsonl`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            git_poll_interval_ms: 5_000,
            git_query_timeout_ms: 10_000,
            sound_enabled: true,
            notifications_enabled: true,
            events_file: None,
        }
    }
}

impl Config {
    /// Poll interval, never shorter than [`MIN_POLL_INTERVAL`]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.git_poll_interval_ms).max(MIN_POLL_INTERVAL)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.git_query_timeout_ms)
    }

    /// Resolved event log path, if a home directory is known.
    pub fn events_path(&self) -> Option<PathBuf> {
        self.events_file.clone().or_else(default_events_file)
    }

    pub fn attention_options(&self) -> AttentionOptions {
        AttentionOptions {
            sound_enabled: self.sound_enabled,
            notifications_enabled: self.notifications_enabled,
            ..Default::default()
        }
    }

    /// Apply environment overrides, reading variables through `lookup`.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(raw) = lookup(ENV_GIT_POLL_MS) {
            match raw.trim().parse() {
                Ok(ms) => self.git_poll_interval_ms = ms,
                Err(_) => warn!(var = ENV_GIT_POLL_MS, value = %raw, "ignoring invalid poll interval"),
            }
        }
        if let Some(path) = lookup(ENV_EVENTS_FILE).filter(|p| !p.is_empty()) {
            self.events_file = Some(PathBuf::from(path));
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Directory helpers
// ---------------------------------------------------------------------------

/// Boxcraft config directory (e.g. `~/.config/boxcraft/`).
fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("boxcraft"))
}

fn default_events_file() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".boxcraft").join("data").join("events.jsonl"))
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from disk plus environment overrides.
///
/// A missing or invalid file yields the defaults.
pub fn load_config() -> Config {
    let config = match config_path() {
        Some(path) => load_config_from(&path),
        None => Config::default(),
    };
    config.with_overrides(|key| std::env::var(key).ok())
}

/// Location of config.json, if the platform has a config directory.
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.json"))
}

/// Save config to disk, returning the path written.
pub fn save_config(config: &Config) -> Result<PathBuf, std::io::Error> {
    let path = config_path().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "config dir not found")
    })?;
    save_config_to(config, &path)?;
    Ok(path)
}

// ---------------------------------------------------------------------------
// Path-parameterised helpers (used by public API and tests)
// ---------------------------------------------------------------------------

pub fn load_config_from(path: &Path) -> Config {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "invalid config, using defaults");
            Config::default()
        }),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "no config file, using defaults");
            Config::default()
        }
    }
}

pub fn save_config_to(config: &Config, path: &Path) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config).map_err(std::io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Write to a temp file in the same directory, then rename over the target.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), std::io::Error> {
    use std::io::Write;

    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
