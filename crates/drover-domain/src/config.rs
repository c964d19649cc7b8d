//! Daemon configuration.
//!
//! Precedence: CLI flags > environment variables > JSON config file >
//! defaults. A `.env` / `.env.local` dotfile may seed the environment but
//! never overrides variables that are already set.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Constraints fed to the model router when resolving a model for a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPolicy {
    #[serde(default)]
    pub require_tools: bool,
    #[serde(default)]
    pub require_vision: bool,
    #[serde(default = "default_max_cost")]
    pub max_cost_usd: f64,
    #[serde(default)]
    pub preferred_models: Vec<String>,
}

fn default_max_cost() -> f64 {
    5.0
}

impl Default for ModelPolicy {
    fn default() -> Self {
        Self {
            require_tools: false,
            require_vision: false,
            max_cost_usd: default_max_cost(),
            preferred_models: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub model_policy: ModelPolicy,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8787".to_owned()
}

fn default_data_dir() -> String {
    "~/.drover".to_owned()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            data_dir: default_data_dir(),
            auth_token: String::new(),
            model_policy: ModelPolicy::default(),
        }
    }
}

impl Config {
    /// Load the config from a JSON file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: Config = serde_json::from_str(&raw)?;
        Ok(cfg)
    }

    /// Expand a leading `~` in `data_dir`.
    pub fn expand_home(&mut self) {
        self.data_dir = expand_home(&self.data_dir);
    }
}

/// Expand `~` / `~/...` against the user's home directory.
pub fn expand_home(value: &str) -> String {
    let home = match dirs::home_dir() {
        Some(h) => h,
        None => return value.to_owned(),
    };
    if value == "~" {
        return home.to_string_lossy().into_owned();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest).to_string_lossy().into_owned();
    }
    value.to_owned()
}

/// Load `key=value` pairs from a dotfile into the process environment.
/// Existing variables are never overridden; missing files are ignored.
pub fn load_env_file(path: &Path) {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return,
    };
    for raw_line in raw.lines() {
        let mut line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("export ") {
            line = rest.trim();
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || std::env::var_os(key).is_some() {
            continue;
        }
        let mut value = value.trim();
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = &value[1..value.len() - 1];
        }
        std::env::set_var(key, value);
    }
}

// ── Settings (persisted mutable slice of the config) ───────────────

/// The model policy survives restarts in `data_dir/settings.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub model_policy: ModelPolicy,
}

/// Load settings, returning `(settings, existed)`.
pub fn load_settings(path: &Path) -> Result<(Settings, bool)> {
    if path.as_os_str().is_empty() {
        return Err(Error::InvalidInput("settings path is empty".into()));
    }
    if !path.exists() {
        return Ok((Settings::default(), false));
    }
    let raw = std::fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&raw)?;
    Ok((settings, true))
}

pub fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::InvalidInput("settings path is empty".into()));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut payload = serde_json::to_string_pretty(settings)?;
    payload.push('\n');
    std::fs::write(path, payload)?;
    Ok(())
}
