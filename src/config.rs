//! Configuration handling
//!
//! Settings live in `schemadb.toml`. A `.env` file next to it is loaded
//! first, then these environment variables override the file:
//!
//! - `SCHEMADB_DATABASE_URL` - PostgreSQL connection string
//! - `SCHEMADB_POOL_SIZE` - maximum open connections
//! - `SCHEMADB_ACQUIRE_TIMEOUT_MS` - how long to wait for a free connection
//! - `SCHEMADB_SCHEMA` - path to the JSON schema map

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::query::DEFAULT_OBJECT_ID_SIZE;
use crate::schema::SchemaMap;
use crate::storage::PgPoolOptions;
use crate::transaction::IsolationLevel;

/// Configuration file name
pub const CONFIG_FILE_NAME: &str = "schemadb.toml";

pub const ENV_DATABASE_URL: &str = "SCHEMADB_DATABASE_URL";
pub const ENV_POOL_SIZE: &str = "SCHEMADB_POOL_SIZE";
pub const ENV_ACQUIRE_TIMEOUT_MS: &str = "SCHEMADB_ACQUIRE_TIMEOUT_MS";
pub const ENV_SCHEMA: &str = "SCHEMADB_SCHEMA";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub database_url: String,
    #[serde(default)]
    pub pool: PoolSettings,
    /// JSON schema map, relative to the config file
    #[serde(default)]
    pub schema: Option<PathBuf>,
    #[serde(default = "default_object_id_size")]
    pub object_id_size: usize,
    #[serde(default)]
    pub transaction: TransactionSettings,
}

fn default_object_id_size() -> usize {
    DEFAULT_OBJECT_ID_SIZE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_pool_size")]
    pub size: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Applied to every new connection
    #[serde(default)]
    pub statement_timeout_ms: Option<u64>,
}

fn default_pool_size() -> usize {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    5000
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            statement_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionSettings {
    /// Retries after a serialization conflict when a call gives none
    #[serde(default)]
    pub default_retry: u32,
    #[serde(default)]
    pub default_isolation: IsolationLevel,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            pool: PoolSettings::default(),
            schema: None,
            object_id_size: default_object_id_size(),
            transaction: TransactionSettings::default(),
        }
    }
}

impl Settings {
    /// Load `schemadb.toml` from a directory, plus its `.env`.
    ///
    /// A missing config file yields defaults; environment overrides apply
    /// either way.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let env_path = dir.join(".env");
        if env_path.exists() {
            let _ = dotenvy::from_path(&env_path);
        }

        let config_path = dir.join(CONFIG_FILE_NAME);
        let mut settings = if config_path.exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut settings: Settings = toml::from_str(&content)?;
        if let (Some(schema), Some(dir)) = (&settings.schema, path.parent()) {
            if schema.is_relative() {
                settings.schema = Some(dir.join(schema));
            }
        }
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |name: &str| lookup(name).filter(|value| !value.is_empty());

        if let Some(url) = lookup(ENV_DATABASE_URL) {
            self.database_url = url;
        }
        if let Some(size) = lookup(ENV_POOL_SIZE).and_then(|v| v.parse().ok()) {
            self.pool.size = size;
        }
        if let Some(timeout) = lookup(ENV_ACQUIRE_TIMEOUT_MS).and_then(|v| v.parse().ok()) {
            self.pool.acquire_timeout_ms = timeout;
        }
        if let Some(schema) = lookup(ENV_SCHEMA) {
            self.schema = Some(PathBuf::from(schema));
        }
    }

    pub fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions {
            size: self.pool.size,
            acquire_timeout: Duration::from_millis(self.pool.acquire_timeout_ms),
            statement_timeout: self.pool.statement_timeout_ms.map(Duration::from_millis),
        }
    }

    /// Read the configured schema map; none configured means no classes.
    pub fn load_schema(&self) -> anyhow::Result<SchemaMap> {
        let Some(path) = &self.schema else {
            return Ok(SchemaMap::default());
        };
        let content = std::fs::read_to_string(path)?;
        let value: serde_json::Value = serde_json::from_str(&content)?;
        Ok(SchemaMap::from_json(&value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let settings: Settings = toml::from_str("database_url = \"postgres://localhost/app\"").unwrap();
        assert_eq!(settings.pool.size, 10);
        assert_eq!(settings.pool.acquire_timeout_ms, 5000);
        assert_eq!(settings.object_id_size, 10);
        assert_eq!(settings.transaction.default_retry, 0);
        assert_eq!(settings.transaction.default_isolation, IsolationLevel::Default);
    }

    #[test]
    fn test_from_file_resolves_schema_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"
database_url = "postgres://localhost/app"
schema = "schema.json"

[pool]
size = 4
statement_timeout_ms = 2000

[transaction]
default_retry = 3
default_isolation = "repeatable-read"
"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("schema.json"),
            r#"{"Post": {"fields": {"title": "string"}}}"#,
        )
        .unwrap();

        let settings = Settings::from_file(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(settings.schema, Some(dir.path().join("schema.json")));
        assert_eq!(settings.transaction.default_isolation, IsolationLevel::RepeatableRead);

        let options = settings.pool_options();
        assert_eq!(options.size, 4);
        assert_eq!(options.statement_timeout, Some(Duration::from_millis(2000)));

        let schema = settings.load_schema().unwrap();
        assert_eq!(schema.classes(), vec!["Post".to_string()]);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_DATABASE_URL, "postgres://db/other"),
            (ENV_POOL_SIZE, "32"),
            (ENV_ACQUIRE_TIMEOUT_MS, "not a number"),
            (ENV_SCHEMA, ""),
        ]);
        let mut settings = Settings::default();
        settings.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(settings.database_url, "postgres://db/other");
        assert_eq!(settings.pool.size, 32);
        assert_eq!(settings.pool.acquire_timeout_ms, 5000);
        assert_eq!(settings.schema, None);
    }
}
