//! Configuration resolution for the CSPP mix client.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/cspp/settings.json)
//! 3. Project config (.cspp/settings.json)
//! 4. Environment variables (highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Mix client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixConfig {
    /// Deadline for writing one protocol message (seconds).
    pub send_timeout_secs: u64,
    /// Deadline for reading one protocol message after the first run (seconds).
    pub recv_timeout_secs: u64,
    /// Default log level for `cspp_client` when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit JSON log lines.
    pub log_json: bool,
}

impl Default for MixConfig {
    fn default() -> Self {
        Self {
            send_timeout_secs: 5,
            recv_timeout_secs: 20,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl MixConfig {
    pub const fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub const fn recv_timeout(&self) -> Duration {
        Duration::from_secs(self.recv_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.send_timeout_secs == 0 {
            return Err(Error::Config("send_timeout_secs must be positive".into()));
        }
        if self.recv_timeout_secs == 0 {
            return Err(Error::Config("recv_timeout_secs must be positive".into()));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<MixConfig> {
    let mut config = MixConfig::default();

    // Load global config
    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            config = load_config_file(&global_path)?;
            debug!(path = %global_path.display(), "loaded global config");
        }
    }

    // Load project config
    if let Some(dir) = project_dir {
        let project_path = dir.join(".cspp").join("settings.json");
        if project_path.exists() {
            config = merge_file(config, &project_path)?;
            debug!(path = %project_path.display(), "applied project config");
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;

    Ok(config)
}

/// Get the global config directory path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".cspp").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/cspp/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("cspp").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<MixConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Overlay only the keys present in the file at `path` onto `base`.
fn merge_file(base: MixConfig, path: &Path) -> Result<MixConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let overlay: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    let mut merged = serde_json::to_value(base)?;
    if let (Some(target), serde_json::Value::Object(fields)) = (merged.as_object_mut(), overlay) {
        target.extend(fields);
    }
    Ok(serde_json::from_value(merged)?)
}

fn apply_env_overrides(config: &mut MixConfig, var: impl Fn(&str) -> Option<String>) {
    override_parsed(&var, "CSPP_SEND_TIMEOUT_SECS", &mut config.send_timeout_secs);
    override_parsed(&var, "CSPP_RECV_TIMEOUT_SECS", &mut config.recv_timeout_secs);
    override_parsed(&var, "CSPP_LOG_LEVEL", &mut config.log_level);
    override_parsed(&var, "CSPP_LOG_JSON", &mut config.log_json);
}

fn override_parsed<T>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T)
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = var(key) else {
        return;
    };
    match value.parse() {
        Ok(parsed) => {
            debug!(key, "config overridden from environment");
            *slot = parsed;
        }
        Err(e) => warn!(key, value = %value, error = %e, "ignoring invalid config override"),
    }
}
