//! Commit log
//!
//! One record per committed version, keyed by the version in big-endian
//! order, plus a `latest` marker written in the same batch as the record.
//! Used for conflict detection, refresh and the diagnostics listings.

use crate::keyspace::Keyspace;
use cairn_core::{Container, Error, ItemId, Result, Version, WriteBatch};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const LATEST_KEY: &[u8] = b"latest";

/// What one commit did to one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemChange {
    /// Changed item
    pub item: ItemId,
    /// Kind of the item
    pub kind: String,
    /// Attributes whose values changed
    pub attributes: Vec<String>,
    /// Item was created by this commit
    pub created: bool,
    /// Item was deleted by this commit
    pub deleted: bool,
    /// Children list changed
    pub children_changed: bool,
}

/// One committed version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Version produced
    pub version: Version,
    /// Commit time
    pub timestamp: DateTime<Utc>,
    /// Name of the committing view
    pub view_name: String,
    /// Items loaded in the committing view
    pub view_size: usize,
    /// Items written
    pub count: usize,
    /// Per-item changes
    pub changes: Vec<ItemChange>,
}

impl CommitRecord {
    /// Change entry for `item`, if this commit touched it
    pub fn change_for(&self, item: ItemId) -> Option<&ItemChange> {
        self.changes.iter().find(|c| c.item == item)
    }
}

/// Store of commit records
#[derive(Debug, Clone)]
pub struct VersionLog {
    versions: Keyspace,
    meta: Keyspace,
}

impl VersionLog {
    /// Version log inside `container`
    pub fn new(container: Arc<dyn Container>) -> Self {
        Self {
            versions: Keyspace::new(Arc::clone(&container), "versions"),
            meta: Keyspace::new(container, "meta"),
        }
    }

    /// Latest committed version (0 for an empty store)
    pub fn latest(&self) -> Result<Version> {
        match self.meta.get(LATEST_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::corruption("latest version marker is malformed"))?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }

    /// Queue `record` and the new latest marker into `batch`
    pub fn record_in(&self, batch: &mut WriteBatch, record: &CommitRecord) -> Result<()> {
        self.versions.put_in(
            batch,
            &record.version.to_be_bytes(),
            rmp_serde::to_vec(record)?,
        );
        self.meta
            .put_in(batch, LATEST_KEY, record.version.to_be_bytes().to_vec());
        Ok(())
    }

    /// Record of `version`
    pub fn get(&self, version: Version) -> Result<Option<CommitRecord>> {
        match self.versions.get(&version.to_be_bytes())? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Records with `from <= version <= to`, oldest first
    ///
    /// # Errors
    ///
    /// `Error::Corruption` if a version in the range below the latest marker
    /// has no record.
    pub fn range(&self, from: Version, to: Version) -> Result<Vec<CommitRecord>> {
        let latest = self.latest()?;
        let mut records = Vec::new();
        for version in from.max(1)..=to.min(latest) {
            let record = self
                .get(version)?
                .ok_or_else(|| Error::corruption(format!("commit record {} missing", version)))?;
            records.push(record);
        }
        Ok(records)
    }
}
