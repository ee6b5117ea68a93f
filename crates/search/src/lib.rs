//! Full-text search for cairn
//!
//! This crate provides:
//! - Tokenizer shared by documents and queries
//! - IndexWriter buffering one commit's documents
//! - FullTextIndex: immutable segments plus a manifest, kept in a
//!   [`BlockFileStore`](cairn_storage::BlockFileStore)
//! - BM25 ranking with required and excluded terms
//!
//! # Usage
//!
//! ```
//! use cairn_core::ItemId;
//! use cairn_search::FullTextIndex;
//! use cairn_storage::{BlockFileStore, KvContainer, INDEX_BLOCK_SHIFT};
//! use std::sync::Arc;
//!
//! let store = BlockFileStore::new(Arc::new(KvContainer::in_memory()), "fts", INDEX_BLOCK_SHIFT)?;
//! let index = FullTextIndex::open(store)?;
//!
//! let item = ItemId::new();
//! let mut writer = index.writer();
//! writer.index_value(item, "body", "notes from the planning meeting", 1);
//! index.commit_writer(writer, 1)?;
//!
//! let results = index.search_documents(1, Some("planning"), None, |_| true);
//! assert_eq!(results.iter().next().map(|h| h.item), Some(item));
//! # Ok::<(), cairn_core::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod index;
mod segment;
pub mod tokenizer;

pub use index::{FullTextIndex, Hit, IndexWriter, Query, SearchResults};
pub use segment::DocEntry;
pub use tokenizer::{term_frequencies, tokenize, tokenize_unique};
