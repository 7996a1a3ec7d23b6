//! Durable storage abstraction for shared documents.
//!
//! This module defines the `DocumentStorage` trait used by the document
//! store to load and save whole documents. Storage is only touched on
//! explicit `load`/`save` requests, never on every edit.

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Document names must be a single, plain path component
    #[error("Invalid document name: {0:?}")]
    InvalidName(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Persistence backend for line documents.
///
/// Implementations must be thread-safe; the document store calls them from
/// whichever task happens to need a document first.
pub trait DocumentStorage: Send + Sync {
    /// Load the stored lines of `name`, or `None` if nothing is stored.
    fn load(&self, name: &str) -> StorageResult<Option<Vec<String>>>;

    /// Replace the stored content of `name` with `lines`.
    fn save(&self, name: &str, lines: &[String]) -> StorageResult<()>;
}

/// Reject names that could escape the storage root.
pub fn validate_name(name: &str) -> StorageResult<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}
