//! YAML file loading
//!
//! Supports the `!env_var VAR [default]` tag. Substituted values are parsed
//! as YAML scalars so `!env_var SAVE_DELAY` can feed a numeric setting.

use crate::error::{ConfigError, ConfigResult};
use serde_yaml::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Loads YAML files relative to a config directory
pub struct YamlLoader {
    config_dir: PathBuf,
}

impl YamlLoader {
    /// Create a new YAML loader for the given config directory
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    /// Load and process a YAML file
    ///
    /// A missing file yields `Value::Null`.
    pub fn load_file(&self, path: impl AsRef<Path>) -> ConfigResult<Value> {
        let path = self.config_dir.join(path.as_ref());

        if !path.exists() {
            debug!("Configuration file not found: {:?}", path);
            return Ok(Value::Null);
        }

        debug!("Loading YAML file: {:?}", path);
        let content = fs::read_to_string(&path).map_err(|e| ConfigError::ReadFile {
            path: path.clone(),
            source: e,
        })?;

        self.load_string(&content, &path)
    }

    /// Load and process YAML from a string
    pub fn load_string(&self, content: &str, source_path: &Path) -> ConfigResult<Value> {
        if content.trim().is_empty() {
            return Ok(Value::Null);
        }

        let value: Value = serde_yaml::from_str(content).map_err(|e| ConfigError::ParseYaml {
            path: source_path.to_path_buf(),
            source: e,
        })?;

        process_value(value)
    }
}

fn process_value(value: Value) -> ConfigResult<Value> {
    match value {
        Value::Tagged(tagged) => process_tagged(*tagged),
        Value::Mapping(map) => {
            let mut result = serde_yaml::Mapping::new();
            for (k, v) in map {
                result.insert(process_value(k)?, process_value(v)?);
            }
            Ok(Value::Mapping(result))
        }
        Value::Sequence(seq) => Ok(Value::Sequence(
            seq.into_iter()
                .map(process_value)
                .collect::<ConfigResult<Vec<_>>>()?,
        )),
        _ => Ok(value),
    }
}

fn process_tagged(tagged: serde_yaml::value::TaggedValue) -> ConfigResult<Value> {
    let tag = tagged.tag.to_string();
    trace!("Processing tag '{}' with value {:?}", tag, tagged.value);

    if tag != "!env_var" {
        let processed = process_value(tagged.value)?;
        return Ok(Value::Tagged(Box::new(serde_yaml::value::TaggedValue {
            tag: tagged.tag,
            value: processed,
        })));
    }

    let directive = match tagged.value {
        Value::String(s) => s,
        _ => {
            return Err(ConfigError::InvalidValue {
                key: "!env_var".to_string(),
                reason: "environment variable name must be a string".to_string(),
            })
        }
    };

    // `!env_var NAME default` falls back to the default when NAME is unset
    let mut parts = directive.splitn(2, char::is_whitespace);
    let var_name = parts.next().unwrap_or_default().to_string();
    let default = parts.next().map(str::trim);

    let raw = match (std::env::var(&var_name), default) {
        (Ok(value), _) => value,
        (Err(_), Some(default)) => default.to_string(),
        (Err(_), None) => return Err(ConfigError::EnvVarNotFound { var: var_name }),
    };

    debug!("Substituted env var: {}", var_name);
    Ok(serde_yaml::from_str(&raw).unwrap_or(Value::String(raw)))
}

/// Load a YAML file from the config directory
pub fn load_yaml(config_dir: impl AsRef<Path>, file: impl AsRef<Path>) -> ConfigResult<Value> {
    YamlLoader::new(config_dir.as_ref()).load_file(file)
}
