//! Live configuration tree with dotted-path lookup and hot-reload merging.
//!
//! The tree is a single JSON object. Loads merge into it recursively; nothing is
//! ever deleted. A load whose input carries an `updated_config` object is a hot
//! patch and merges only that sub-object.

use std::path::Path;
use std::sync::RwLock;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tokio::sync::broadcast;

/// Key that marks a load as a hot patch.
pub const UPDATED_CONFIG_KEY: &str = "updated_config";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration must be a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// How a load was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLoad {
    /// Whole input merged (initial load).
    Full,
    /// Only `updated_config` merged.
    HotReload,
}

/// Notification sent to listeners after every load.
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub kind: ConfigLoad,
    /// Snapshot of the tree after the merge.
    pub config: Value,
}

pub struct ConfigStore {
    tree: RwLock<Map<String, Value>>,
    changes: broadcast::Sender<ConfigChange>,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore {
    /// Empty tree.
    pub fn new() -> Self {
        Self::from_map(Map::new())
    }

    /// Tree seeded with the keys every sub-process understands.
    pub fn with_defaults() -> Self {
        Self::from_map(default_config())
    }

    fn from_map(tree: Map<String, Value>) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            tree: RwLock::new(tree),
            changes,
        }
    }

    /// Merge `data` into the tree and notify listeners.
    ///
    /// If `data` has an `updated_config` object only that part is merged; otherwise the
    /// whole object is.
    pub fn load_from_json(&self, data: &Value) -> Result<ConfigLoad, ConfigError> {
        let Value::Object(data) = data else {
            return Err(ConfigError::NotAnObject(json_type_name(data)));
        };

        let (kind, snapshot) = {
            let mut tree = self.tree.write().unwrap_or_else(|e| e.into_inner());
            let kind = match data.get(UPDATED_CONFIG_KEY) {
                Some(Value::Object(patch)) => {
                    merge_json(&mut tree, patch);
                    ConfigLoad::HotReload
                }
                _ => {
                    merge_json(&mut tree, data);
                    ConfigLoad::Full
                }
            };
            (kind, Value::Object(tree.clone()))
        };

        match kind {
            ConfigLoad::HotReload => tracing::debug!("Configuration hot-reloaded via merge"),
            ConfigLoad::Full => tracing::debug!("Configuration loaded via merge"),
        }

        // Listeners may read the store, so notify only after the lock is released.
        let _ = self.changes.send(ConfigChange {
            kind,
            config: snapshot,
        });
        Ok(kind)
    }

    /// Read a JSON file and merge it as [`load_from_json`](Self::load_from_json) does.
    pub fn load_from_file(&self, path: impl AsRef<Path>) -> Result<ConfigLoad, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let data: Value = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        self.load_from_json(&data)
    }

    /// Value at a dotted path, or `default` if any segment is missing or not an object.
    pub fn get_value(&self, path: &str, default: Value) -> Value {
        if path.is_empty() {
            return default;
        }
        let tree = self.tree.read().unwrap_or_else(|e| e.into_inner());
        lookup(&tree, path).cloned().unwrap_or(default)
    }

    /// Typed lookup; `None` if missing or of the wrong shape.
    pub fn get<T: DeserializeOwned>(&self, path: &str) -> Option<T> {
        let value = {
            let tree = self.tree.read().unwrap_or_else(|e| e.into_inner());
            lookup(&tree, path)?.clone()
        };
        serde_json::from_value(value).ok()
    }

    pub fn get_or<T: DeserializeOwned>(&self, path: &str, default: T) -> T {
        self.get(path).unwrap_or(default)
    }

    /// Snapshot of the whole tree.
    pub fn get_config(&self) -> Value {
        let tree = self.tree.read().unwrap_or_else(|e| e.into_inner());
        Value::Object(tree.clone())
    }

    pub fn config_version(&self) -> i64 {
        self.get_or("version", 1)
    }

    pub fn process_description(&self) -> String {
        self.get_or("description", "No description available.".to_string())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.changes.subscribe()
    }
}

fn lookup<'a>(tree: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    let mut segments = path.split('.');
    let last = segments.next_back()?;
    let mut current = tree;
    for segment in segments {
        current = current.get(segment)?.as_object()?;
    }
    current.get(last)
}

/// Recursive merge: objects merge field by field, anything else overwrites.
pub fn merge_json(dest: &mut Map<String, Value>, src: &Map<String, Value>) {
    for (key, value) in src {
        match (dest.get_mut(key), value) {
            (Some(Value::Object(dest_obj)), Value::Object(src_obj)) => merge_json(dest_obj, src_obj),
            _ => {
                dest.insert(key.clone(), value.clone());
            }
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn default_config() -> Map<String, Value> {
    let defaults = json!({
        "ip_table": [],
        "work_directory": {},
        "watch_directories": [],
        "analysis_patterns": {},
        "ipc": {
            "server_name": "master_ipc_server",
            "reconnect_interval_ms": 5000,
            "heartbeat_interval_ms": 10000
        }
    });
    match defaults {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
