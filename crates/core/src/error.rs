//! Error types for the cairn repository
//!
//! A single error enum is shared by every layer. We use `thiserror` for the
//! `Display` and `Error` implementations.
//!
//! The variants fall into four families:
//! - store faults (`FileNotFound`, `InvalidSeek`, `NoSuchAttribute`, ...)
//! - optimistic concurrency failures (`VersionConflict`), surfaced to callers
//! - transient container contention (`Deadlock`), retried internally
//! - corruption, which is fatal and never repaired silently

use crate::types::ItemId;
use std::io;
use thiserror::Error;

/// Result type alias for cairn operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the cairn repository
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file operations)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration could not be parsed or is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// A named file does not exist in the block file store
    #[error("File does not exist: {0}")]
    FileNotFound(String),

    /// Seek beyond the recorded length of a file
    #[error("Seeking past end of file: position {position}, length {length}")]
    InvalidSeek {
        /// Requested position
        position: u64,
        /// Recorded file length
        length: u64,
    },

    /// Schema declarations are inconsistent
    #[error("Schema error: {0}")]
    Schema(String),

    /// Kind is not registered in the schema
    #[error("No such kind: {0}")]
    NoSuchKind(String),

    /// Attribute is not declared by the item's kind
    #[error("Kind {kind} has no attribute {attribute}")]
    NoSuchAttribute {
        /// Kind name
        kind: String,
        /// Attribute name
        attribute: String,
    },

    /// Value does not match the attribute declaration
    #[error("Type mismatch on {attribute}: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Attribute name
        attribute: String,
        /// Declared type or cardinality
        expected: String,
        /// Type of the supplied value
        actual: String,
    },

    /// Item does not exist at the view's version
    #[error("Item not found: {0}")]
    ItemNotFound(ItemId),

    /// Item was deleted in this view
    #[error("Item is deleted: {0}")]
    ItemDeleted(ItemId),

    /// Optimistic commit conflict
    ///
    /// Another view committed a change to the same attribute after this
    /// view's base version. Recoverable by cancel/refresh and retry.
    #[error("Version conflict on item {item} (attributes {attributes:?}) with version {version}")]
    VersionConflict {
        /// Item modified by both views
        item: ItemId,
        /// Attributes modified by both views
        attributes: Vec<String>,
        /// Committed version that conflicted
        version: u64,
    },

    /// Container lock contention (transient)
    #[error("Deadlock detected in {context} after {attempts} attempt(s)")]
    Deadlock {
        /// Operation that hit the deadlock
        context: String,
        /// Number of attempts made
        attempts: usize,
    },

    /// Data corruption detected (fatal)
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Key not present in an ordered index
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Positional access outside the valid range
    #[error("Index {index} out of range for length {len}")]
    IndexOutOfRange {
        /// Requested index (may be negative)
        index: i64,
        /// Number of elements
        len: usize,
    },

    /// Moving a key after itself
    #[error("Invalid move: {0}")]
    InvalidMove(String),

    /// Collection proxy owned elsewhere or otherwise misused
    #[error("Ownership error: {0}")]
    Ownership(String),

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The view has been closed
    #[error("Repository view is not open: {0}")]
    ViewClosed(String),

    /// The repository has been closed
    #[error("Repository is not open")]
    RepositoryClosed,
}

impl Error {
    /// Shorthand for a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Shorthand for an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// True for optimistic-commit conflicts
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::VersionConflict { .. })
    }

    /// True for errors worth retrying locally (container contention)
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Deadlock { .. })
    }

    /// True when a file, item or key was not found
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::FileNotFound(_) | Error::ItemNotFound(_) | Error::KeyNotFound(_)
        )
    }

    /// True for non-recoverable errors
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Config(e.to_string())
    }
}
