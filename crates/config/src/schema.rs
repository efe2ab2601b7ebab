//! Configuration schema. Every field has a default so an empty file is valid.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Root configuration (`wazper.toml`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WazperConfig {
    pub supervisor: SupervisorConfig,
    pub broadcast: BroadcastConfig,
    pub sidecar: SidecarConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

impl WazperConfig {
    /// Reject combinations the supervisor and broadcast engine cannot honor.
    pub fn validate(&self) -> anyhow::Result<()> {
        let s = &self.supervisor;
        if s.backoff_multiplier == 0 {
            anyhow::bail!("supervisor.backoff_multiplier must be at least 1");
        }
        if s.backoff_cap_secs < s.backoff_base_secs {
            anyhow::bail!(
                "supervisor.backoff_cap_secs ({}) is below backoff_base_secs ({})",
                s.backoff_cap_secs,
                s.backoff_base_secs
            );
        }
        let b = &self.broadcast;
        if b.default_delay_min_secs > b.default_delay_max_secs {
            anyhow::bail!(
                "broadcast.default_delay_min_secs ({}) exceeds default_delay_max_secs ({})",
                b.default_delay_min_secs,
                b.default_delay_max_secs
            );
        }
        if b.pause_poll_interval_ms == 0 {
            anyhow::bail!("broadcast.pause_poll_interval_ms must be positive");
        }
        Ok(())
    }
}

/// Connection supervisor tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Minimum spacing between two caller-initiated connects of one account.
    pub connect_cooldown_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_multiplier: u32,
    pub backoff_cap_secs: u64,
    /// Consecutive transient failures tolerated before the account is put in error.
    pub max_consecutive_failures: u32,
}

impl SupervisorConfig {
    pub fn connect_cooldown(&self) -> Duration {
        Duration::from_secs(self.connect_cooldown_secs)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connect_cooldown_secs: 30,
            backoff_base_secs: 5,
            backoff_multiplier: 3,
            backoff_cap_secs: 300,
            max_consecutive_failures: 5,
        }
    }
}

/// Broadcast engine defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub default_delay_min_secs: u64,
    pub default_delay_max_secs: u64,
    /// Granularity at which a paused run re-checks its control state.
    pub pause_poll_interval_ms: u64,
}

impl BroadcastConfig {
    pub fn pause_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pause_poll_interval_ms)
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            default_delay_min_secs: 10,
            default_delay_max_secs: 30,
            pause_poll_interval_ms: 100,
        }
    }
}

/// Protocol sidecar connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    pub url: String,
    pub connect_retries: u32,
    pub send_timeout_secs: u64,
}

impl SidecarConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9876".into(),
            connect_retries: 5,
            send_timeout_secs: 60,
        }
    }
}

/// Durable storage locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_url: String,
    /// Root of per-account credential directories.
    pub sessions_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://wazper.db?mode=rwc".into(),
            sessions_dir: PathBuf::from("sessions"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg: WazperConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, WazperConfig::default());
        assert_eq!(cfg.supervisor.connect_cooldown(), Duration::from_secs(30));
        assert_eq!(cfg.supervisor.max_consecutive_failures, 5);
        cfg.validate().unwrap();
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg: WazperConfig = toml::from_str(
            r#"
            [supervisor]
            backoff_base_secs = 2

            [sidecar]
            url = "ws://10.0.0.2:9000"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.supervisor.backoff_base_secs, 2);
        assert_eq!(cfg.supervisor.backoff_multiplier, 3);
        assert_eq!(cfg.sidecar.url, "ws://10.0.0.2:9000");
        assert_eq!(cfg.sidecar.send_timeout_secs, 60);
    }

    #[test]
    fn validate_rejects_inverted_delay_range() {
        let mut cfg = WazperConfig::default();
        cfg.broadcast.default_delay_min_secs = 40;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_cap_below_base() {
        let mut cfg = WazperConfig::default();
        cfg.supervisor.backoff_cap_secs = 1;
        assert!(cfg.validate().is_err());
    }
}
