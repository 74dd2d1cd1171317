//! Configuration errors

use std::path::PathBuf;
use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed YAML in {path:?}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `!include` whose argument is not a file name
    #[error("bad !include target {target}")]
    IncludeTarget { target: String },

    /// A file includes itself, directly or through other files
    #[error("include cycle: {chain}")]
    IncludeCycle { chain: String },

    #[error("environment variable '{name}' is not set and has no default")]
    MissingEnvVar { name: String },

    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    /// Engine settings the engine cannot run with
    #[error("invalid engine settings: {0}")]
    InvalidSettings(String),
}
