//! Core traits for storage and reference resolution
//!
//! `Container` is the ordered key-value seam every persistent structure is
//! built on; `ItemResolver` lets collection proxies resolve references
//! without depending on the view that owns the items.

use crate::error::Result;
use crate::types::ItemId;

/// Single operation inside a [`WriteBatch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite a key
    Put {
        /// Key bytes
        key: Vec<u8>,
        /// Value bytes
        value: Vec<u8>,
    },
    /// Remove a key (no-op if absent)
    Delete {
        /// Key bytes
        key: Vec<u8>,
    },
}

/// Ordered list of writes applied atomically
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a put
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    /// Queue a delete
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }

    /// Append every operation of `other`
    pub fn extend(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }

    /// Number of queued operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Iterate operations in order
    pub fn iter(&self) -> std::slice::Iter<'_, BatchOp> {
        self.ops.iter()
    }
}

/// Ordered key-value container
///
/// Implementations may be in-memory or durable. Thread safety: all methods
/// must be callable concurrently (requires Send + Sync).
///
/// # Errors
///
/// Lock contention surfaces as `Error::Deadlock`, which callers treat as
/// transient and retry with bounded backoff.
pub trait Container: Send + Sync {
    /// Read a key
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// All entries whose key starts with `prefix`, in key order
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply every operation of `batch` or none of them
    fn apply_batch(&self, batch: &WriteBatch) -> Result<()>;

    /// Write a single key
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.apply_batch(&batch)
    }

    /// Delete a single key
    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.apply_batch(&batch)
    }
}

/// Answers whether a referenced item still exists
pub trait ItemResolver {
    /// True if `id` names a live (not deleted) item
    fn is_live(&self, id: ItemId) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_ordering() {
        let mut batch = WriteBatch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.delete(b"a".to_vec());
        assert_eq!(batch.len(), 2);
        assert!(matches!(batch.iter().last(), Some(BatchOp::Delete { .. })));
    }

    #[test]
    fn test_batch_extend() {
        let mut a = WriteBatch::new();
        a.put(b"k".to_vec(), b"v".to_vec());
        let mut b = WriteBatch::new();
        b.delete(b"x".to_vec());
        a.extend(b);
        assert_eq!(a.len(), 2);
        assert!(!a.is_empty());
    }
}
