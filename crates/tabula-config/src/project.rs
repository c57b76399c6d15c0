//! Project configuration file handling.
//!
//! Looks for `.config/tabula.json` in the current directory or any parent directory.

use crate::{ConfigError, TableConfig};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

/// Contents of `.config/tabula.json`.
///
/// Relative paths are resolved against the project root (the directory that
/// contains `.config/`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProjectConfig {
    /// Path to the table config JSON.
    pub tables: Utf8PathBuf,
    /// Target schema version; version tracking is disabled when absent.
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default)]
    pub version_table_name: Option<String>,
    /// Raw SQL executed before every reconciliation.
    #[serde(default)]
    pub init_script: Option<Utf8PathBuf>,
    /// Connection string, `DATABASE_URL` takes precedence.
    #[serde(default)]
    pub database_url: Option<String>,
    /// Name of the SQL function backing `jsonbSchema` checks.
    #[serde(default)]
    pub jsonb_validator: Option<String>,
    #[serde(skip)]
    root: Utf8PathBuf,
}

impl ProjectConfig {
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn tables_path(&self) -> Utf8PathBuf {
        self.root.join(&self.tables)
    }

    pub fn init_script_path(&self) -> Option<Utf8PathBuf> {
        self.init_script.as_ref().map(|p| self.root.join(p))
    }

    pub fn load_tables(&self) -> Result<TableConfig, ConfigError> {
        TableConfig::from_path(&self.tables_path())
    }
}

/// Load configuration from `.config/tabula.json`, searching up the directory tree.
pub fn load() -> Result<(ProjectConfig, Utf8PathBuf), ConfigError> {
    let cwd = std::env::current_dir().map_err(|source| ConfigError::Io {
        path: Utf8PathBuf::from("."),
        source,
    })?;
    let cwd = Utf8PathBuf::from_path_buf(cwd).map_err(|_| ConfigError::NonUtf8Path)?;
    load_from(&cwd)
}

/// Load configuration starting from a specific directory.
pub fn load_from(start: &Utf8Path) -> Result<(ProjectConfig, Utf8PathBuf), ConfigError> {
    let config_path = find_config_file(start)?;
    let content = std::fs::read_to_string(&config_path).map_err(|source| ConfigError::Io {
        path: config_path.clone(),
        source,
    })?;

    let mut config: ProjectConfig =
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: config_path.clone(),
            source,
        })?;
    config.root = config_path
        .parent()
        .and_then(Utf8Path::parent)
        .map(Utf8Path::to_owned)
        .unwrap_or_default();

    Ok((config, config_path))
}

/// Find `.config/tabula.json` by searching up the directory tree.
pub fn find_config_file(start: &Utf8Path) -> Result<Utf8PathBuf, ConfigError> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".config/tabula.json");
        if config_path.exists() {
            return Ok(config_path);
        }

        if !current.pop() {
            return Err(ConfigError::NotFound);
        }
    }
}
