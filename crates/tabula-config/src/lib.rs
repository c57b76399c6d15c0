//! Table configuration for tabula.
//!
//! A [`TableConfig`] maps table names to their desired state. It is usually
//! loaded from JSON:
//!
//! ```json
//! {
//!   "user_type": { "isLookupTable": { "values": { "admin": {}, "user": {} } } },
//!   "users": {
//!     "columns": {
//!       "id": "SERIAL PRIMARY KEY",
//!       "email": { "isText": true, "trimmed": true, "lowerCased": true },
//!       "type": { "references": { "tableName": "user_type" }, "nullable": false },
//!       "status": { "enum": ["active", "disabled"], "defaultValue": "active" }
//!     },
//!     "indexes": { "users_email_idx": { "columns": "email", "unique": true } }
//!   }
//! }
//! ```

use camino::Utf8Path;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

mod error;
mod model;
mod project;

pub use error::ConfigError;
pub use model::*;
pub use project::{ProjectConfig, find_config_file, load, load_from};


/// Desired state for every managed table, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableConfig {
    pub tables: IndexMap<String, TableConfigEntry>,
}

impl TableConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Load a table config from a JSON file.
    pub fn from_path(path: &Utf8Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// The JSON payload recorded alongside each schema version.
    pub fn to_value(&self) -> serde_json::Value {
        // Every field is built from JSON-representable data.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn insert(&mut self, name: impl Into<String>, entry: TableConfigEntry) -> &mut Self {
        self.tables.insert(name.into(), entry);
        self
    }

    pub fn get(&self, name: &str) -> Option<&TableConfigEntry> {
        self.tables.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TableConfigEntry)> {
        self.tables.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn is_lookup(&self, name: &str) -> bool {
        self.get(name).is_some_and(TableConfigEntry::is_lookup)
    }

    /// Tables in creation order: lookup tables first so that references to
    /// them resolve, then everything else in declaration order.
    pub fn creation_order(&self) -> Vec<(&str, &TableConfigEntry)> {
        let (mut lookups, regular): (Vec<_>, Vec<_>) =
            self.iter().partition(|(_, entry)| entry.is_lookup());
        lookups.extend(regular);
        lookups
    }
}
