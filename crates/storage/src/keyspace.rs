//! Named key prefixes inside one container
//!
//! Several logical tables (file records, blocks, items, commit log) share a
//! single container so that one batch can span all of them atomically.

use cairn_core::{Container, Result, WriteBatch};
use std::sync::Arc;

/// A logical table: every key is stored as `name | 0x00 | suffix`
#[derive(Clone)]
pub struct Keyspace {
    container: Arc<dyn Container>,
    prefix: Vec<u8>,
}

impl std::fmt::Debug for Keyspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyspace")
            .field("prefix", &String::from_utf8_lossy(&self.prefix))
            .finish()
    }
}

impl Keyspace {
    /// Keyspace `name` inside `container`
    pub fn new(container: Arc<dyn Container>, name: &str) -> Self {
        let mut prefix = name.as_bytes().to_vec();
        prefix.push(0);
        Self { container, prefix }
    }

    /// The underlying container
    pub fn container(&self) -> &Arc<dyn Container> {
        &self.container
    }

    /// Full container key for `suffix`
    pub fn key(&self, suffix: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.prefix.len() + suffix.len());
        key.extend_from_slice(&self.prefix);
        key.extend_from_slice(suffix);
        key
    }

    /// Read `suffix`
    pub fn get(&self, suffix: &[u8]) -> Result<Option<Vec<u8>>> {
        self.container.get(&self.key(suffix))
    }

    /// Write `suffix` immediately
    pub fn put(&self, suffix: &[u8], value: &[u8]) -> Result<()> {
        self.container.put(&self.key(suffix), value)
    }

    /// Delete `suffix` immediately
    pub fn delete(&self, suffix: &[u8]) -> Result<()> {
        self.container.delete(&self.key(suffix))
    }

    /// Queue a put of `suffix` into `batch`
    pub fn put_in(&self, batch: &mut WriteBatch, suffix: &[u8], value: Vec<u8>) {
        batch.put(self.key(suffix), value);
    }

    /// Queue a delete of `suffix` into `batch`
    pub fn delete_in(&self, batch: &mut WriteBatch, suffix: &[u8]) {
        batch.delete(self.key(suffix));
    }

    /// Entries whose suffix starts with `suffix_prefix`, keyed by suffix
    pub fn scan(&self, suffix_prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let strip = self.prefix.len();
        Ok(self
            .container
            .scan_prefix(&self.key(suffix_prefix))?
            .into_iter()
            .map(|(k, v)| (k[strip..].to_vec(), v))
            .collect())
    }
}
