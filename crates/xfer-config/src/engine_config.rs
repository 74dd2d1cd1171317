//! Engine configuration
//!
//! Parses `configuration.yaml`: the `engine:` section plus the optional
//! `log_level`, `nodes:` and `pulses:` entries.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::Path;
use std::time::Duration;
use xfer_core::{NodeKind, TypeCode, ValueType};

use crate::error::{ConfigError, ConfigResult};
use crate::loader::load_yaml;

/// Name of the configuration file inside the config directory
pub const CONFIG_FILE: &str = "configuration.yaml";

/// Settings of the transfer engine from the `engine:` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Folder whose subtree is scanned for transfers
    #[serde(default = "default_transfers_root")]
    pub transfers_root: String,

    /// Delay between discovery cycles
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Period of an interval trigger whose node has no numeric value
    #[serde(default = "default_trigger_interval_ms")]
    pub default_trigger_interval_ms: u64,

    /// Shortest period an interval trigger may run with
    #[serde(default = "default_min_trigger_interval_ms")]
    pub min_trigger_interval_ms: u64,

    /// Wait between attempts of the retrying read/write helpers
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_transfers_root() -> String {
    "/Nodes/Transfers".to_string()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_trigger_interval_ms() -> u64 {
    500
}

fn default_min_trigger_interval_ms() -> u64 {
    50
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_seed_kind() -> NodeKind {
    NodeKind::Value
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transfers_root: default_transfers_root(),
            poll_interval_ms: default_poll_interval_ms(),
            default_trigger_interval_ms: default_trigger_interval_ms(),
            min_trigger_interval_ms: default_min_trigger_interval_ms(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_trigger_interval(&self) -> Duration {
        Duration::from_millis(self.default_trigger_interval_ms)
    }

    pub fn min_trigger_interval(&self) -> Duration {
        Duration::from_millis(self.min_trigger_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Check the settings for values the engine cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if !self.transfers_root.starts_with('/') {
            return Err(ConfigError::InvalidSettings(format!(
                "engine.transfers_root must be an absolute path, got '{}'",
                self.transfers_root
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidSettings(
                "engine.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.min_trigger_interval_ms == 0 {
            return Err(ConfigError::InvalidSettings(
                "engine.min_trigger_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A node to create in the store at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSeed {
    /// Full path of the node; missing parent folders are created
    pub path: String,

    #[serde(default = "default_seed_kind")]
    pub kind: NodeKind,

    /// Type code of a value node
    #[serde(default, rename = "type")]
    pub type_code: Option<TypeCode>,

    #[serde(default)]
    pub is_array: bool,

    /// Location hint (e.g. `toggle`, `fallingedge`, `group`)
    #[serde(default)]
    pub location: Option<String>,

    #[serde(default)]
    pub read_only: bool,

    /// Initial value
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

impl NodeSeed {
    /// Declared value type, if the seed names one
    pub fn value_type(&self) -> Option<ValueType> {
        self.type_code.map(|type_code| ValueType {
            type_code,
            is_array: self.is_array,
        })
    }
}

/// A bridge pulsing a trigger node whenever watched nodes change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulseConfig {
    /// Paths of the value nodes to watch
    pub watch: Vec<String>,
    /// Path of the boolean node to pulse
    pub trigger: String,
}

/// Complete contents of `configuration.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub engine: EngineConfig,

    /// Log filter used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub nodes: Vec<NodeSeed>,

    #[serde(default)]
    pub pulses: Vec<PulseConfig>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            log_level: default_log_level(),
            nodes: Vec::new(),
            pulses: Vec::new(),
        }
    }
}

impl Configuration {
    /// Load configuration from a config directory
    ///
    /// A missing `configuration.yaml` yields the defaults.
    pub fn load(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref();
        if !config_dir.join(CONFIG_FILE).exists() {
            return Ok(Self::default());
        }

        let yaml = load_yaml(config_dir, CONFIG_FILE)?;
        Self::from_yaml(&yaml)
    }

    /// Parse configuration from a YAML value
    pub fn from_yaml(yaml: &Value) -> ConfigResult<Self> {
        if yaml.is_null() {
            return Ok(Self::default());
        }
        if !yaml.is_mapping() {
            return Err(ConfigError::InvalidValue {
                key: "root".to_string(),
                reason: "configuration must be a mapping".to_string(),
            });
        }

        let config: Configuration =
            serde_yaml::from_value(yaml.clone()).map_err(|e| ConfigError::InvalidValue {
                key: "configuration".to_string(),
                reason: e.to_string(),
            })?;

        config.engine.validate()?;
        for seed in &config.nodes {
            if seed.kind.is_value() && seed.type_code.is_none() {
                return Err(ConfigError::InvalidValue {
                    key: format!("nodes[{}].type", seed.path),
                    reason: "value nodes need a type".to_string(),
                });
            }
        }

        Ok(config)
    }
}
