use std::path::PathBuf;

use thiserror::Error;

use crate::llm::GenerationError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to walk history directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("database error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("failed to insert records {start}-{end}: {source}")]
    Batch {
        start: usize,
        end: usize,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to ingest {}: {source}", .path.display())]
    Ingest {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    #[error("invalid date format: {0} (use YYYY-MM-DD or YYYY-MM-DD HH:MM:SS)")]
    InvalidDate(String),

    #[error("query cannot be empty")]
    EmptyQuery,

    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("generation backend not available and no cached result")]
    NoGenerator,

    #[error("invalid config file {}: {source}", .path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("fzf not found in PATH, please install it first")]
    SelectorMissing,

    #[error("fzf failed: {0}")]
    Selector(String),

    #[error("{0}")]
    Integration(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
