//! Testing utilities for retry and commit atomicity
//!
//! - **FlakyContainer**: wraps a container and aborts batches with
//!   `Error::Deadlock`, either for the next N batches or on every batch
//!
//! # Example
//!
//! ```
//! use cairn_core::{Container, WriteBatch};
//! use cairn_storage::testing::FlakyContainer;
//! use cairn_storage::KvContainer;
//! use std::sync::Arc;
//!
//! let flaky = FlakyContainer::new(Arc::new(KvContainer::in_memory()));
//! flaky.fail_next(1);
//! assert!(flaky.put(b"k", b"v").is_err());
//! assert!(flaky.put(b"k", b"v").is_ok());
//! ```

mod flaky;

pub use flaky::FlakyContainer;
