//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$MAILSTASH_CONFIG` (environment variable)
//! 2. `~/.config/mailstash/config.toml` (Linux/macOS)
//!    `%APPDATA%\mailstash\config.toml` (Windows)
//! 3. Built-in defaults

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StashError};
use crate::signal::PressureLevel;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// Temp file store layout.
    pub store: StoreConfig,
    /// Cleanup sweep tuning.
    pub cleanup: CleanupConfig,
    /// Decoding pipe sizing.
    pub pipe: PipeConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Override cache directory for temp files and logs.
    pub cache_dir: Option<PathBuf>,
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
}

/// Temp file store layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Name of the reserved directory inside the cache directory.
    /// Must stay stable across restarts so old files are still swept.
    pub directory_name: String,
    /// Prefix for generated file names.
    pub file_prefix: String,
    /// Authority component of content references.
    pub authority: String,
}

/// Cleanup sweep tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Files older than this many seconds are deleted by a sweep.
    pub delete_threshold_secs: u64,
    /// Lowest memory pressure level that triggers a sweep.
    pub pressure_threshold: PressureLevel,
}

/// Decoding pipe sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    /// Maximum number of decoded chunks buffered between drain and reader.
    pub capacity_chunks: usize,
    /// Size of one decoded chunk in bytes.
    pub chunk_size: usize,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            log_level: "warn".to_string(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            directory_name: "decrypted".to_string(),
            file_prefix: "decrypted-".to_string(),
            authority: "mailstash.decryptedfileprovider".to_string(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            delete_threshold_secs: 3 * 60,
            pressure_threshold: PressureLevel::Critical,
        }
    }
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            capacity_chunks: 16,
            chunk_size: 8 * 1024, // 8 KB
        }
    }
}

impl Config {
    /// Reject values the store, codec or pipe cannot work with.
    pub fn validate(&self) -> Result<()> {
        let dir = &self.store.directory_name;
        if dir.is_empty() || dir == "." || dir == ".." || dir.contains(['/', '\\']) {
            return Err(StashError::Config(format!(
                "store.directory_name '{dir}' must be a plain directory name"
            )));
        }
        if self.store.file_prefix.contains(['/', '\\']) {
            return Err(StashError::Config(format!(
                "store.file_prefix '{}' must not contain path separators",
                self.store.file_prefix
            )));
        }
        if self.store.authority.trim().is_empty() {
            return Err(StashError::Config("store.authority must not be empty".into()));
        }
        if self.pipe.capacity_chunks == 0 || self.pipe.chunk_size == 0 {
            return Err(StashError::Config(
                "pipe.capacity_chunks and pipe.chunk_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl CleanupConfig {
    /// Age threshold as a `Duration`.
    pub fn delete_threshold(&self) -> Duration {
        Duration::from_secs(self.delete_threshold_secs)
    }
}

// ── Load / save ─────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found, or on a read,
/// parse or validation error.
pub fn load_config() -> Config {
    match config_file_path() {
        Some(path) if path.exists() => load_config_from(&path),
        _ => Config::default(),
    }
}

/// Load configuration from `path`, falling back to defaults on any error.
pub fn load_config_from(path: &Path) -> Config {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Failed to read config file, using defaults"
            );
            return Config::default();
        }
    };
    let cfg = match toml::from_str::<Config>(&contents) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Failed to parse config, using defaults"
            );
            return Config::default();
        }
    };
    if let Err(e) = cfg.validate() {
        tracing::warn!(path = %path.display(), error = %e, "Using default config");
        return Config::default();
    }
    tracing::info!(path = %path.display(), "Loaded config");
    cfg
}

/// Save configuration to the standard location. Returns the path written.
pub fn save_config(config: &Config) -> anyhow::Result<PathBuf> {
    let path = config_file_path()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config file path"))?;
    save_config_to(config, &path)?;
    Ok(path)
}

/// Validate and write `config` as TOML to `path`.
pub fn save_config_to(config: &Config, path: &Path) -> anyhow::Result<()> {
    config.validate()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    tracing::info!(path = %path.display(), "Saved config");
    Ok(())
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("MAILSTASH_CONFIG") {
        return Some(PathBuf::from(env_path));
    }

    dirs::config_dir().map(|d| d.join("mailstash").join("config.toml"))
}

/// Return the cache directory for temp files, logs, etc.
pub fn cache_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.cache_dir {
        return dir.clone();
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailstash")
}

/// Return the reserved temp directory.
pub fn temp_dir(config: &Config) -> PathBuf {
    cache_dir(config).join(&config.store.directory_name)
}

/// Return the log file path.
pub fn log_file_path(config: &Config) -> PathBuf {
    cache_dir(config).join("mailstash.log")
}
