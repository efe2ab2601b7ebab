//! Configuration for wazper: TOML schema, discovery and validation.

pub mod loader;
pub mod schema;

pub use {
    loader::{apply_env_overrides, default_config_path, discover_and_load, load_config},
    schema::{
        BroadcastConfig, LoggingConfig, SidecarConfig, StorageConfig, SupervisorConfig,
        WazperConfig,
    },
};
