//! Variable stores: the read-only key/value source templates resolve against.
//! Populated out-of-band by an operator (a JSON/TOML file, or the environment).
//! The trigger only ever reads; nothing here is written at run time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use dumptruck_core::error::{DumptruckError, Result};

/// Environment variables with this prefix are exposed as variables:
/// `DUMPTRUCK_VAR_PG_HOST` becomes `pg_host`.
pub const ENV_PREFIX: &str = "DUMPTRUCK_VAR_";

/// Read-only key/value lookup.
pub trait VariableStore: Send + Sync {
    /// Value for `key`, or `None` when the key is absent.
    fn get(&self, key: &str) -> Option<String>;
}

impl VariableStore for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// In-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryVariables {
    values: HashMap<String, String>,
}

impl MemoryVariables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, String)> for MemoryVariables {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl VariableStore for MemoryVariables {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// File-backed store: a flat JSON object or TOML table.
/// Non-string scalars (numbers, booleans) are rendered as text.
pub struct FileVariables {
    path: PathBuf,
    values: HashMap<String, String>,
}

impl FileVariables {
    /// Load variables from disk. The format is picked by extension
    /// (`.toml`, otherwise JSON).
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DumptruckError::Store(format!("Failed to read {}: {e}", path.display())))?;

        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let values = if is_toml {
            parse_toml(&content)?
        } else {
            parse_json(&content)?
        };

        tracing::debug!("🔑 Loaded {} variables from {}", values.len(), path.display());
        Ok(Self {
            path: path.to_path_buf(),
            values,
        })
    }

    /// Load if the file exists, otherwise an empty store.
    pub fn load_or_empty(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No variables file at {}", path.display());
            Ok(Self {
                path: path.to_path_buf(),
                values: HashMap::new(),
            })
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl VariableStore for FileVariables {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

fn parse_json(content: &str) -> Result<HashMap<String, String>> {
    let value: serde_json::Value = serde_json::from_str(content)?;
    let object = value
        .as_object()
        .ok_or_else(|| DumptruckError::Store("variables file must be a JSON object".into()))?;

    let mut values = HashMap::with_capacity(object.len());
    for (key, value) in object {
        let text = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            other => {
                return Err(DumptruckError::Store(format!(
                    "variable '{key}' must be a scalar, got {other}"
                )));
            }
        };
        values.insert(key.clone(), text);
    }
    Ok(values)
}

fn parse_toml(content: &str) -> Result<HashMap<String, String>> {
    let table: toml::Table = toml::from_str(content)
        .map_err(|e| DumptruckError::Store(format!("Failed to parse variables: {e}")))?;

    let mut values = HashMap::with_capacity(table.len());
    for (key, value) in table {
        let text = match value {
            toml::Value::String(s) => s,
            toml::Value::Integer(i) => i.to_string(),
            toml::Value::Float(f) => f.to_string(),
            toml::Value::Boolean(b) => b.to_string(),
            other => {
                return Err(DumptruckError::Store(format!(
                    "variable '{key}' must be a scalar, got {}",
                    other.type_str()
                )));
            }
        };
        values.insert(key, text);
    }
    Ok(values)
}

/// Environment-backed store. Keys are lower-cased with the prefix removed.
#[derive(Debug, Clone, Default)]
pub struct EnvVariables {
    values: HashMap<String, String>,
}

impl EnvVariables {
    /// Snapshot the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(ENV_PREFIX, std::env::vars())
    }

    /// Build from an explicit set of `(NAME, value)` pairs.
    pub fn from_vars<I>(prefix: &str, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let values = vars
            .into_iter()
            .filter_map(|(name, value)| {
                name.strip_prefix(prefix)
                    .filter(|key| !key.is_empty())
                    .map(|key| (key.to_ascii_lowercase(), value))
            })
            .collect();
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl VariableStore for EnvVariables {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Consults each layer in order; the first hit wins.
#[derive(Default)]
pub struct LayeredVariables {
    layers: Vec<Box<dyn VariableStore>>,
}

impl LayeredVariables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a lower-priority layer.
    pub fn push(mut self, layer: impl VariableStore + 'static) -> Self {
        self.layers.push(Box::new(layer));
        self
    }
}

impl VariableStore for LayeredVariables {
    fn get(&self, key: &str) -> Option<String> {
        self.layers.iter().find_map(|layer| layer.get(key))
    }
}
