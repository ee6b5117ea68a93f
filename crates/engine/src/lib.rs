//! Repository engine for Cairn
//!
//! This crate ties the lower layers together:
//! - Repository: open/create/close, directory lock, configuration
//! - Views: isolated versioned windows with commit, refresh and merge
//! - Live sets: incrementally maintained kind, attribute, algebra and
//!   filter sets with listeners
//! - Background workers owning a private view
//!
//! The engine is the only component that knows about:
//! - The commit protocol (item records, kind index, version log, full-text)
//! - Inverse attribute maintenance and delete/copy policies

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod repository;
pub mod sets;
pub mod view;
pub mod worker;

pub use cairn_storage::RetryConfig;
pub use config::{RepositoryConfig, CONFIG_FILE_NAME};
pub use repository::Repository;
pub use sets::{ItemFacts, SetEvent, SetId, SetOp, SetSource, SetStats, WatchId};
pub use view::{ItemInfo, RepositoryView, ViewStatus, ROOT_KIND};
pub use worker::{Request, RepositoryWorker};
