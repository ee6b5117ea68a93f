//! Storage layer for cairn
//!
//! This crate implements everything that persists bytes:
//! - KvContainer: ordered key-value container, in memory or backed by a
//!   checksummed batch log
//! - Keyspace: named key prefixes so one batch spans several tables
//! - BlockFileStore: named byte streams stored as fixed-size blocks
//! - ItemStore: versioned item records and the kind index
//! - VersionLog: one record per committed version
//! - retry_on_deadlock: bounded backoff for transient container contention

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod container;
pub mod file;
pub mod items;
pub mod keyspace;
pub mod retry;
pub mod stream;
pub mod testing;
pub mod version_log;

pub use container::KvContainer;
pub use file::{BlockFileStore, FileRecord, DEFAULT_BLOCK_SHIFT, INDEX_BLOCK_SHIFT};
pub use items::{ItemRecord, ItemStore};
pub use keyspace::Keyspace;
pub use retry::{retry_on_deadlock, RetryConfig};
pub use stream::{InputStream, OutputStream};
pub use version_log::{CommitRecord, ItemChange, VersionLog};
