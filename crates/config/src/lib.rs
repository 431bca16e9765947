//! Configuration loading, env substitution and validation.
//!
//! Config files: `clawport.toml`, `clawport.yaml`, `clawport.yml` or
//! `clawport.json`. Searched in `./` then the user config directory
//! (`~/.config/clawport/` on Linux).
//!
//! Supports `${ENV_VAR}` and `${ENV_VAR:-fallback}` substitution in the raw
//! file before parsing.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    error::{Error, Result},
    loader::{
        config_dir, data_dir, find_config_file, find_or_default_config_path, load_config,
        save_config, set_config_dir, set_data_dir,
    },
    schema::{
        ChannelsConfig, ClawportConfig, GatewayConfig, RestartConfig, ServerConfig,
        WebhooksConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
