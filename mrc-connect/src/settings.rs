//! Read-only access to the persisted user settings. Only the manual
//! connection keys are consulted by the bootstrap.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use log::debug;

use crate::error::SettingsError;

pub const KEY_HOST: &str = "connection/host";
pub const KEY_PORT: &str = "connection/port";
pub const KEY_RPC_USER: &str = "connection/rpcuser";
pub const KEY_RPC_PASSWORD: &str = "connection/rpcpassword";

/// Key/value lookup over whatever backs the user's settings.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

impl SettingsStore for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

impl SettingsStore for BTreeMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        BTreeMap::get(self, key).cloned()
    }
}

/// Settings persisted as TOML. Nested tables are addressed with `/`, so the
/// `host` entry of the `[connection]` table is read as `connection/host`.
#[derive(Clone, Debug, Default)]
pub struct TomlSettings {
    values: BTreeMap<String, String>,
}

impl TomlSettings {
    /// Load from `path`. A missing file is an empty store, not an error.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("no settings file at {}", path.display());
                Ok(Self::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn parse(text: &str) -> Result<Self, SettingsError> {
        let table: toml::Table = text.parse()?;
        let mut values = BTreeMap::new();
        flatten("", &table, &mut values);
        Ok(Self { values })
    }
}

impl SettingsStore for TomlSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

fn flatten(prefix: &str, table: &toml::Table, out: &mut BTreeMap<String, String>) {
    for (name, value) in table {
        let key = if prefix.is_empty() { name.clone() } else { format!("{prefix}/{name}") };
        match value {
            toml::Value::Table(inner) => flatten(&key, inner, out),
            toml::Value::String(s) => {
                out.insert(key, s.clone());
            }
            other => {
                out.insert(key, other.to_string());
            }
        }
    }
}
