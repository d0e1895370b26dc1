//! Layered run configuration: a JSON base file plus command-line overrides.

mod interpolate;
mod overrides;

pub use overrides::{parse_value, Override, OverrideKind};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0:?}")]
    NotFound(PathBuf),
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("config root in {0:?} must be a mapping")]
    NotAMapping(PathBuf),
    #[error("malformed override '{text}': {reason}")]
    MalformedOverride { text: String, reason: String },
    #[error("key '{0}' is not in the config, use '+{0}=...' to add it")]
    UnknownKey(String),
    #[error("key '{0}' already exists, use '++{0}=...' to force it")]
    KeyExists(String),
    #[error("cannot set '{key}': '{parent}' is not a mapping")]
    NotAContainer { key: String, parent: String },
    #[error("cannot resolve '${{{reference}}}' in '{key}': {reason}")]
    Interpolation {
        key: String,
        reference: String,
        reason: String,
    },
    #[error("invalid value for '{key}': {source}")]
    InvalidValue {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("conflicting settings: {0}")]
    Conflict(String),
}

/// Resolved configuration tree addressed with dotted keys (`model.optim.lr`).
///
/// Sequence elements are addressed by index (`model.task_templates.0.taskname`).
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigTree {
    root: Value,
}

impl Default for ConfigTree {
    fn default() -> Self {
        Self {
            root: Value::Object(Map::new()),
        }
    }
}

impl ConfigTree {
    pub fn new(root: Value) -> Self {
        Self { root }
    }

    /// Read a JSON base file. The root must be a mapping.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let root: Value = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if !root.is_object() {
            return Err(ConfigError::NotAMapping(path.to_path_buf()));
        }
        debug!("Loaded base config from {:?}", path);
        Ok(Self { root })
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        lookup(&self.root, key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// `true` when the key holds something other than `null`, `false` or an empty string.
    pub fn is_set(&self, key: &str) -> bool {
        match self.get(key) {
            None | Some(Value::Null) | Some(Value::Bool(false)) => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Typed lookup where an absent or `null` key yields `default`.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(value) => {
                serde_json::from_value(value.clone()).map_err(|source| ConfigError::InvalidValue {
                    key: key.to_string(),
                    source,
                })
            }
        }
    }

    /// Deserialize a subtree; absent or `null` yields `T::default()`.
    pub fn section<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T, ConfigError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(T::default()),
            Some(value) => {
                serde_json::from_value(value.clone()).map_err(|source| ConfigError::InvalidValue {
                    key: key.to_string(),
                    source,
                })
            }
        }
    }

    pub fn subtree(&self, key: &str) -> Option<ConfigTree> {
        match self.get(key) {
            None | Some(Value::Null) => None,
            Some(value) => Some(ConfigTree::new(value.clone())),
        }
    }

    /// Write `value` at `key`, creating intermediate mappings as needed.
    pub fn set(&mut self, key: &str, value: Value) -> Result<(), ConfigError> {
        let segments: Vec<&str> = key.split('.').collect();
        let (leaf, parents) = match segments.split_last() {
            Some((leaf, parents)) if !leaf.is_empty() => (*leaf, parents),
            _ => {
                return Err(ConfigError::MalformedOverride {
                    text: key.to_string(),
                    reason: "empty key".to_string(),
                })
            }
        };

        let mut node = &mut self.root;
        let mut walked = String::new();
        for segment in parents {
            if !walked.is_empty() {
                walked.push('.');
            }
            walked.push_str(segment);
            node = match node {
                Value::Object(map) => map
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new())),
                Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                    Some(item) => item,
                    None => return Err(ConfigError::UnknownKey(walked)),
                },
                _ => {
                    return Err(ConfigError::NotAContainer {
                        key: key.to_string(),
                        parent: walked,
                    })
                }
            };
            if node.is_null() {
                *node = Value::Object(Map::new());
            }
        }

        match node {
            Value::Object(map) => {
                map.insert(leaf.to_string(), value);
                Ok(())
            }
            Value::Array(items) => match leaf.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(slot) => {
                    *slot = value;
                    Ok(())
                }
                None => Err(ConfigError::UnknownKey(key.to_string())),
            },
            _ => Err(ConfigError::NotAContainer {
                key: key.to_string(),
                parent: parents.join("."),
            }),
        }
    }

    pub fn remove(&mut self, key: &str) -> Result<Value, ConfigError> {
        let (parent_key, leaf) = match key.rsplit_once('.') {
            Some((parent, leaf)) => (Some(parent), leaf),
            None => (None, key),
        };
        let parent = match parent_key {
            Some(parent) => lookup_mut(&mut self.root, parent),
            None => Some(&mut self.root),
        };
        parent
            .and_then(|node| node.as_object_mut())
            .and_then(|map| map.remove(leaf))
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))
    }

    pub fn apply_override(&mut self, item: &Override) -> Result<(), ConfigError> {
        match item.kind {
            OverrideKind::Set => {
                if !self.contains(&item.key) {
                    return Err(ConfigError::UnknownKey(item.key.clone()));
                }
                self.set(&item.key, item.value.clone())
            }
            OverrideKind::Add => {
                if self.contains(&item.key) {
                    return Err(ConfigError::KeyExists(item.key.clone()));
                }
                self.set(&item.key, item.value.clone())
            }
            OverrideKind::ForceSet => self.set(&item.key, item.value.clone()),
            OverrideKind::Delete => self.remove(&item.key).map(|_| ()),
        }
    }

    /// Parse and apply `key=value` strings in command-line order.
    pub fn apply_overrides<S: AsRef<str>>(&mut self, raw: &[S]) -> Result<(), ConfigError> {
        for text in raw {
            let item: Override = text.as_ref().parse()?;
            debug!("Applying override {}", text.as_ref());
            self.apply_override(&item)?;
        }
        Ok(())
    }

    /// Replace `${a.b}` references with the values they point at.
    pub fn resolve_interpolations(&mut self) -> Result<(), ConfigError> {
        interpolate::resolve(&mut self.root)
    }

    pub fn to_pretty(&self) -> String {
        serde_json::to_string_pretty(&self.root).unwrap_or_else(|_| self.root.to_string())
    }
}

impl fmt::Display for ConfigTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_pretty())
    }
}

pub(crate) fn lookup<'a>(root: &'a Value, key: &str) -> Option<&'a Value> {
    if key.is_empty() {
        return Some(root);
    }
    key.split('.').try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn lookup_mut<'a>(root: &'a mut Value, key: &str) -> Option<&'a mut Value> {
    key.split('.').try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
        _ => None,
    })
}
