use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{DbError, Result};

/// Default location of the database topology file.
pub const DEFAULT_DB_CONFIG_PATH: &str = "/var/run/redis/sonic-db/database_config.json";

/// Parsed `database_config.json`: instance addresses plus the logical
/// database table mapping names to `(instance, id, separator)`.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(rename = "INSTANCES")]
    pub instances: HashMap<String, InstanceConfig>,
    #[serde(rename = "DATABASES")]
    pub databases: HashMap<String, DatabaseConfig>,
}

/// One store instance: a unix socket and/or a TCP endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub unix_socket_path: Option<PathBuf>,
}

/// One logical database inside an instance.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub id: i64,
    pub separator: String,
    pub instance: String,
}

impl StoreConfig {
    /// Load and parse the topology file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| DbError::Config {
            path: path.to_path_buf(),
            source: Box::new(e),
        })?;
        serde_json::from_str(&raw).map_err(|e| DbError::Config {
            path: path.to_path_buf(),
            source: Box::new(e),
        })
    }

    /// Resolve a logical database by name.
    pub fn database(&self, name: &str) -> Result<(&DatabaseConfig, &InstanceConfig)> {
        let db = self
            .databases
            .get(name)
            .ok_or_else(|| DbError::UnknownDatabase {
                name: name.to_string(),
            })?;
        let instance = self
            .instances
            .get(&db.instance)
            .ok_or_else(|| DbError::BadInstance {
                name: name.to_string(),
            })?;
        Ok((db, instance))
    }
}
