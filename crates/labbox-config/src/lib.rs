//! Configuration system for labbox.
//!
//! Provides TOML-based configuration with:
//! - Sandbox limits, guest environment and interpreter overrides
//! - Validator allow-list extensions
//! - Store and log locations
//! - Config file layering (user config + project-local overrides)
//!
//! [`LabboxConfig::sandbox_config`] turns the merged file into the runtime
//! [`labbox_sandbox::SandboxConfig`].

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    APP_NAME, ConfigSource, LoadedConfig, PROJECT_CONFIG_FILE, USER_CONFIG_FILE, load_config,
    load_config_file, load_config_with_options, save_config, user_config_dir, user_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
