//! Config file discovery and loading.

use std::path::{Path, PathBuf};

use {
    anyhow::{Context, Result},
    directories::ProjectDirs,
    tracing::{debug, info},
};

use crate::schema::WazperConfig;

const CONFIG_FILE_NAME: &str = "wazper.toml";

/// Default config location (`~/.config/wazper/wazper.toml` on Linux).
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "wazper", "wazper").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

/// Load and validate a config file.
pub fn load_config(path: &Path) -> Result<WazperConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: WazperConfig =
        toml::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    info!(path = %path.display(), "loaded config");
    Ok(config)
}

/// Load the explicit path if given, otherwise the default location. A missing
/// default file yields the built-in defaults.
pub fn discover_and_load(explicit: Option<&Path>) -> Result<WazperConfig> {
    if let Some(path) = explicit {
        return load_config(path);
    }
    match default_config_path() {
        Some(path) if path.exists() => load_config(&path),
        _ => {
            debug!("no config file found, using defaults");
            Ok(WazperConfig::default())
        },
    }
}

/// Apply `WAZPER_*` overrides. `lookup` is usually `|k| std::env::var(k).ok()`.
pub fn apply_env_overrides(config: &mut WazperConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(url) = lookup("WAZPER_DATABASE_URL") {
        config.storage.database_url = url;
    }
    if let Some(url) = lookup("WAZPER_SIDECAR_URL") {
        config.sidecar.url = url;
    }
    if let Some(level) = lookup("WAZPER_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(dir) = lookup("WAZPER_SESSIONS_DIR") {
        config.storage.sessions_dir = PathBuf::from(dir);
    }
}
