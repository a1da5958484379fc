use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("found something that is not a directory at {}, either delete it or specify a different location", .0.display())]
    NotADirectory(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Key primitive failed: {0}")]
    Crypto(String),

    #[error("Backing store error: {0}")]
    Backend(String),

    /// A concurrent writer changed the data underneath this commit.
    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Transaction failed to commit after {attempts} attempts")]
    TransactionConflict { attempts: u32 },
}

impl StoreError {
    /// Whether a commit that failed with this error may succeed if tried again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
