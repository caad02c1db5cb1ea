//! Error types for Coven Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The store answered with no rows where exactly one was requested
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Remote store error: {message}")]
    Remote {
        code: Option<String>,
        message: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// One or more snapshot reads failed
    #[error("Failed to load game data: {0}")]
    Load(String),

    /// An optimistic write was rejected by the store
    #[error("Failed to {op}: {source}")]
    Write {
        op: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl Error {
    pub fn remote(message: impl Into<String>) -> Self {
        Error::Remote {
            code: None,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
