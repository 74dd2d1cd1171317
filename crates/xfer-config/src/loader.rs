//! YAML loading with `!include` and `!env_var`
//!
//! `!include file.yaml` splices in another file, resolved relative to the
//! file containing the tag. `!env_var NAME` or `!env_var NAME default`
//! substitutes an environment variable, re-parsed as YAML so numbers and
//! booleans keep their type. Other tags are left in place.

use crate::error::{ConfigError, ConfigResult};
use serde_yaml::value::TaggedValue;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Tags resolved by the loader
enum Tag {
    Include,
    EnvVar,
    Other,
}

impl Tag {
    fn of(tagged: &TaggedValue) -> Self {
        if tagged.tag == "include" {
            Tag::Include
        } else if tagged.tag == "env_var" {
            Tag::EnvVar
        } else {
            Tag::Other
        }
    }
}

/// Loader for one config directory
pub struct YamlLoader {
    config_dir: PathBuf,
    /// Files currently being loaded, outermost first
    chain: Vec<PathBuf>,
}

impl YamlLoader {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            chain: Vec::new(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Load a file, relative paths being taken from the config directory
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> ConfigResult<Value> {
        let path = self.config_dir.join(path.as_ref());
        self.load_path(path)
    }

    fn load_path(&mut self, path: PathBuf) -> ConfigResult<Value> {
        if self.chain.contains(&path) {
            let chain = self
                .chain
                .iter()
                .chain(std::iter::once(&path))
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(ConfigError::IncludeCycle { chain });
        }

        debug!(file = %path.display(), "Loading YAML");
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;

        self.chain.push(path.clone());
        let loaded = self.load_string(&content, &path);
        self.chain.pop();
        loaded
    }

    /// Parse `content` as if it had been read from `source`
    pub fn load_string(&mut self, content: &str, source: &Path) -> ConfigResult<Value> {
        let value = serde_yaml::from_str(content).map_err(|e| ConfigError::Yaml {
            path: source.to_path_buf(),
            source: e,
        })?;
        self.resolve(value, source)
    }

    fn resolve(&mut self, value: Value, source: &Path) -> ConfigResult<Value> {
        Ok(match value {
            Value::Tagged(tagged) => return self.resolve_tagged(*tagged, source),
            Value::Sequence(items) => Value::Sequence(
                items
                    .into_iter()
                    .map(|item| self.resolve(item, source))
                    .collect::<ConfigResult<_>>()?,
            ),
            Value::Mapping(entries) => {
                let mut resolved = Mapping::with_capacity(entries.len());
                for (key, item) in entries {
                    resolved.insert(self.resolve(key, source)?, self.resolve(item, source)?);
                }
                Value::Mapping(resolved)
            }
            plain => plain,
        })
    }

    fn resolve_tagged(&mut self, tagged: TaggedValue, source: &Path) -> ConfigResult<Value> {
        trace!(tag = %tagged.tag, "Resolving tag");
        match Tag::of(&tagged) {
            Tag::Include => {
                let Value::String(target) = &tagged.value else {
                    return Err(ConfigError::IncludeTarget {
                        target: format!("{:?}", tagged.value),
                    });
                };
                let path = source.parent().unwrap_or(&self.config_dir).join(target);
                self.load_path(path)
            }
            Tag::EnvVar => env_var(&tagged.value),
            Tag::Other => Ok(Value::Tagged(Box::new(TaggedValue {
                value: self.resolve(tagged.value, source)?,
                tag: tagged.tag,
            }))),
        }
    }
}

fn env_var(argument: &Value) -> ConfigResult<Value> {
    let Some(argument) = argument.as_str() else {
        return Err(ConfigError::InvalidValue {
            key: "!env_var".to_string(),
            reason: "expected a variable name".to_string(),
        });
    };

    let (name, fallback) = match argument.split_once(char::is_whitespace) {
        Some((name, fallback)) => (name, Some(fallback.trim())),
        None => (argument, None),
    };

    let raw = match (std::env::var(name), fallback) {
        (Ok(set), _) => set,
        (Err(_), Some(fallback)) => fallback.to_string(),
        (Err(_), None) => {
            return Err(ConfigError::MissingEnvVar {
                name: name.to_string(),
            })
        }
    };
    debug!(name, "Substituted environment variable");
    Ok(serde_yaml::from_str(&raw).unwrap_or(Value::String(raw)))
}

/// Load `file` from `config_dir`, resolving tags
pub fn load_yaml(config_dir: impl Into<PathBuf>, file: impl AsRef<Path>) -> ConfigResult<Value> {
    YamlLoader::new(config_dir).load_file(file)
}

/// Resolve tags in `content`, treating it as `source_name` inside `config_dir`
pub fn load_yaml_string(
    config_dir: impl Into<PathBuf>,
    content: &str,
    source_name: &str,
) -> ConfigResult<Value> {
    let mut loader = YamlLoader::new(config_dir);
    let source = loader.config_dir.join(source_name);
    loader.load_string(content, &source)
}
