//! Versioned item records
//!
//! Every committed change to an item stores a full record under
//! `item id (16) | version (u64 BE)`, so the state of an item at version `v`
//! is the record with the greatest version `<= v`. A second keyspace maps
//! `kind | 0x00 | item id` to the version that created the item.

use crate::keyspace::Keyspace;
use cairn_core::{Container, Error, ItemId, Result, Value, Version, WriteBatch};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// Persisted state of one item at one version
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ItemRecord {
    /// Kind name
    pub kind: String,
    /// Parent in the namespace tree (`None` only for the root)
    pub parent: Option<ItemId>,
    /// Name, unique among siblings
    pub name: Option<String>,
    /// Attribute values
    pub values: BTreeMap<String, Value>,
    /// Children in creation order
    pub children: Vec<ItemId>,
    /// Tombstone marker
    pub deleted: bool,
}

fn record_key(id: ItemId, version: Version) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(id.as_bytes());
    key.extend_from_slice(&version.to_be_bytes());
    key
}

fn decode_version(suffix: &[u8]) -> Result<Version> {
    let bytes: [u8; 8] = suffix
        .get(16..24)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| Error::corruption("item record key too short"))?;
    Ok(u64::from_be_bytes(bytes))
}

fn kind_key(kind: &str, id: ItemId) -> Vec<u8> {
    let mut key = Vec::with_capacity(kind.len() + 17);
    key.extend_from_slice(kind.as_bytes());
    key.push(0);
    key.extend_from_slice(id.as_bytes());
    key
}

/// Store of versioned item records and the kind index
#[derive(Debug, Clone)]
pub struct ItemStore {
    items: Keyspace,
    kinds: Keyspace,
}

impl ItemStore {
    /// Item store inside `container`
    pub fn new(container: Arc<dyn Container>) -> Self {
        Self {
            items: Keyspace::new(Arc::clone(&container), "items"),
            kinds: Keyspace::new(container, "kinds"),
        }
    }

    /// State of `id` as of `at`, with the version that produced it
    pub fn load(&self, id: ItemId, at: Version) -> Result<Option<(Version, ItemRecord)>> {
        let mut found = None;
        for (suffix, bytes) in self.items.scan(id.as_bytes())? {
            let version = decode_version(&suffix)?;
            if version > at {
                break;
            }
            found = Some((version, bytes));
        }
        match found {
            Some((version, bytes)) => {
                trace!(item = %id, version, "Loaded item record");
                Ok(Some((version, rmp_serde::from_slice(&bytes)?)))
            }
            None => Ok(None),
        }
    }

    /// Every stored version of `id`, oldest first
    pub fn history(&self, id: ItemId) -> Result<Vec<(Version, ItemRecord)>> {
        self.items
            .scan(id.as_bytes())?
            .into_iter()
            .map(|(suffix, bytes)| Ok((decode_version(&suffix)?, rmp_serde::from_slice(&bytes)?)))
            .collect()
    }

    /// Versions of `id` committed after `after`
    pub fn versions_after(&self, id: ItemId, after: Version) -> Result<Vec<Version>> {
        let mut versions = Vec::new();
        for (suffix, _) in self.items.scan(id.as_bytes())? {
            let version = decode_version(&suffix)?;
            if version > after {
                versions.push(version);
            }
        }
        Ok(versions)
    }

    /// Latest version `<= at` in which `attribute` of `id` differs from its
    /// previous stored value
    pub fn last_change(&self, id: ItemId, attribute: &str, at: Version) -> Result<Option<Version>> {
        let mut last = None;
        let mut previous: Option<Value> = None;
        for (version, record) in self.history(id)? {
            if version > at {
                break;
            }
            let current = record.values.get(attribute).cloned();
            if current != previous {
                last = Some(version);
                previous = current;
            }
        }
        Ok(last)
    }

    /// Queue the record of `id` at `version` into `batch`
    pub fn save_in(
        &self,
        batch: &mut WriteBatch,
        id: ItemId,
        version: Version,
        record: &ItemRecord,
    ) -> Result<()> {
        self.items
            .put_in(batch, &record_key(id, version), rmp_serde::to_vec(record)?);
        Ok(())
    }

    /// Queue a kind index entry for an item created at `version`
    pub fn index_kind_in(&self, batch: &mut WriteBatch, kind: &str, id: ItemId, version: Version) {
        self.kinds
            .put_in(batch, &kind_key(kind, id), version.to_be_bytes().to_vec());
    }

    /// Items of exactly `kind` created at or before `at`
    ///
    /// Deleted items are included; callers check the record.
    pub fn items_of_kind(&self, kind: &str, at: Version) -> Result<Vec<ItemId>> {
        let mut prefix = kind.as_bytes().to_vec();
        prefix.push(0);
        let mut ids = Vec::new();
        for (suffix, value) in self.kinds.scan(&prefix)? {
            let created: [u8; 8] = value
                .as_slice()
                .try_into()
                .map_err(|_| Error::corruption("kind index entry has bad version"))?;
            if u64::from_be_bytes(created) > at {
                continue;
            }
            let raw: [u8; 16] = suffix
                .get(prefix.len()..)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| Error::corruption("kind index key has bad item id"))?;
            ids.push(ItemId::from_bytes(raw));
        }
        Ok(ids)
    }
}
