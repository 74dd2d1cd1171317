//! YAML configuration loading for the transfer engine
//!
//! This crate loads `configuration.yaml` from a config directory and
//! resolves two custom tags:
//!
//! - `!include path` - Include another YAML file
//! - `!env_var VAR` - Environment variable substitution
//!
//! # Example
//!
//! ```ignore
//! use xfer_config::Configuration;
//!
//! let config = Configuration::load("/config")?;
//! println!("watching {}", config.engine.transfers_root);
//! ```

mod engine_config;
mod error;
mod loader;

pub use engine_config::{Configuration, EngineConfig, NodeSeed, PulseConfig};
pub use error::{ConfigError, ConfigResult};
pub use loader::{load_yaml, load_yaml_string, YamlLoader};

// Re-export serde_yaml::Value for convenience
pub use serde_yaml::Value;
