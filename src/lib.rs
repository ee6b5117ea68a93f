//! Cairn - embedded versioned item repository
//!
//! Cairn stores typed, schema-described items and hands out isolated,
//! versioned views onto them. Views commit optimistically; changes to
//! different attributes merge, changes to the same attribute conflict
//! (set attributes and children lists merge element-wise).
//!
//! # Quick Start
//!
//! ```ignore
//! use cairn::{Attribute, Cardinality, Repository, SchemaBuilder, Value};
//!
//! let schema = SchemaBuilder::new()
//!     .kind("Note", &[], vec![
//!         Attribute::new("title").indexed(),
//!         Attribute::new("tags").with_cardinality(Cardinality::List),
//!     ])
//!     .build()?;
//! let repo = Repository::create("./notes", schema)?;
//!
//! let mut view = repo.create_view(Some("main"), None)?;
//! let note = view.create_item("Note", None, Some("first"))?;
//! view.set_value(note, "title", "Hello")?;
//! view.add_value(note, "tags", "greeting")?;
//! view.commit()?;
//! ```
//!
//! # Architecture
//!
//! - `cairn-core`: ids, values, persistent collections, schema, errors
//! - `cairn-storage`: container, item and version tables, block files
//! - `cairn-index`: positional skip list
//! - `cairn-search`: full-text segments and queries
//! - `cairn-engine`: repository, views, live sets, workers

pub use cairn_core::{
    Attribute, Cardinality, CopyPolicy, DeletePolicy, Error, FileId, ItemId, Kind, Literal,
    Owner, PersistentDict, PersistentList, PersistentSet, PersistentTuple, Resolved, Result,
    Schema, SchemaBuilder, Value, ValueType, Version,
};
pub use cairn_engine::{
    ItemFacts, ItemInfo, Repository, RepositoryConfig, RepositoryView, RepositoryWorker,
    RetryConfig, SetEvent, SetId, SetOp, SetSource, SetStats, ViewStatus, WatchId,
};
pub use cairn_search::{Hit, Query};
pub use cairn_storage::{BlockFileStore, InputStream, OutputStream};

/// Lower layers, for callers that need them directly
pub mod layers {
    pub use cairn_core as core;
    pub use cairn_engine as engine;
    pub use cairn_index as index;
    pub use cairn_search as search;
    pub use cairn_storage as storage;
}
