//! Error types for vdisk-core
//!
//! [`StoreError`] covers the content store and the streaming adapters built on
//! top of it. [`FsError`] is the result taxonomy every dispatcher verb answers
//! with; the host binding turns it into an OS error code.

use std::path::PathBuf;

use thiserror::Error;

use crate::tree::TreeError;

/// Errors that can occur while talking to a content store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Local I/O failure (pointer record, blob directory)
    #[error("I/O error: {0}")]
    Io(String),

    /// The requested object does not exist
    #[error("Object not found: {0}")]
    NotFound(String),

    /// The transport failed or was interrupted
    #[error("Transport error: {0}")]
    Transport(String),

    /// An object could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Key material was malformed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// The session no longer accepts input
    #[error("Session closed")]
    Closed,

    /// A write landed behind data that was already queued
    #[error("Non-sequential write: expected offset {expected}, got {got}")]
    NonSequential { expected: u64, got: u64 },
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl StoreError {
    /// Create a new NotFound error
    pub fn not_found(item: impl Into<String>) -> Self {
        Self::NotFound(item.into())
    }

    /// Create a new Transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create a new Crypto error
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto(message.into())
    }

    /// Create a new I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(message.into())
    }
}

/// Result codes returned by filesystem verbs
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsError {
    /// The path does not resolve to an entry
    #[error("file not found")]
    NotFound,

    /// An entry with that name already exists
    #[error("already exists")]
    AlreadyExists,

    /// Name length or characters are not allowed
    #[error("invalid name")]
    InvalidName,

    /// The parent folder (or the entry being moved/deleted) is missing
    #[error("path not found")]
    PathNotFound,

    /// The upload behind a write failed
    #[error("access denied")]
    AccessDenied,

    /// Folder still has children
    #[error("directory not empty")]
    DirectoryNotEmpty,

    /// No session of the required kind is bound to the handle
    #[error("invalid handle")]
    InvalidHandle,

    /// The leaf is still being uploaded and has no content yet
    #[error("content not finalized yet")]
    Pending,

    /// A network failure surfaced on a read or write verb
    #[error("transport failure: {0}")]
    Transport(String),
}

impl From<TreeError> for FsError {
    fn from(err: TreeError) -> Self {
        match err {
            TreeError::DuplicateName(_) => FsError::AlreadyExists,
            TreeError::NotAFolder | TreeError::NoSuchChild(_) => FsError::PathNotFound,
            TreeError::IntoOwnSubtree => FsError::InvalidName,
        }
    }
}

/// Result alias for dispatcher verbs
pub type FsResult<T> = Result<T, FsError>;

/// Errors raised while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("invalid config {path}: {message}")]
    Parse { path: PathBuf, message: String },
}
