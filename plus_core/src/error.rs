//! Error type shared by the scaffolding layer.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid settings: {0}")]
    Settings(String),

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("database pool: {0}")]
    Pool(String),

    #[error("database connection: {0}")]
    Connection(#[from] diesel::ConnectionError),

    #[error(transparent)]
    Query(#[from] diesel::result::Error),

    #[error("template {0}")]
    Template(String),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("extension `{name}` failed to initialize: {reason}")]
    Extension { name: &'static str, reason: String },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
