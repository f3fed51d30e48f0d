use std::path::PathBuf;

/// Errors from store topology resolution and store access.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// The topology file could not be read or parsed.
    #[error("failed to load database config {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The topology file does not define the requested logical database.
    #[error("unknown database {name:?} in topology")]
    UnknownDatabase { name: String },

    /// The logical database references an instance the topology does not
    /// define, or the instance has no usable address.
    #[error("database {name:?} has no usable instance address")]
    BadInstance { name: String },

    /// An error from the store itself.
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),
}

pub type Result<T> = std::result::Result<T, DbError>;
