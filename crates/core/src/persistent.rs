//! Persistent collection proxies
//!
//! Collection values stored in item attributes: ordered sequences, keyed
//! mappings, fixed tuples and unordered sets. Each proxy:
//! - is owned by at most one `(item, attribute)` pair at a time
//! - flags itself dirty on mutation unless the caller passes `set_dirty = false`
//!   (bulk construction)
//! - re-parents embedded collection values through [`prepare_value`]
//!
//! Ownership and dirty state are in-memory bookkeeping only; they are
//! skipped by serde so the stored form is just the elements.

use crate::error::{Error, Result};
use crate::schema::CopyPolicy;
use crate::traits::ItemResolver;
use crate::types::ItemId;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The `(item, attribute)` pair that owns a collection value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    /// Owning item
    pub item: ItemId,
    /// Attribute holding the value
    pub attribute: String,
}

impl Owner {
    /// Create an owner handle
    pub fn new(item: ItemId, attribute: impl Into<String>) -> Self {
        Self {
            item,
            attribute: attribute.into(),
        }
    }
}

/// An element seen through an item resolver
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved<'a> {
    /// Non-reference element
    Value(&'a Value),
    /// Reference to a live item
    Item(ItemId),
    /// Reference whose target no longer exists
    Tombstone(ItemId),
}

impl<'a> Resolved<'a> {
    fn resolve(value: &'a Value, resolver: &dyn ItemResolver) -> Self {
        match value {
            Value::Ref(id) if resolver.is_live(*id) => Resolved::Item(*id),
            Value::Ref(id) => Resolved::Tombstone(*id),
            other => Resolved::Value(other),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Tracking {
    owner: Option<Owner>,
    dirty: bool,
}

impl Tracking {
    fn owned_by(owner: Option<&Owner>) -> Self {
        Self {
            owner: owner.cloned(),
            dirty: false,
        }
    }

    fn touch(&mut self, set_dirty: bool) {
        if set_dirty {
            self.dirty = true;
        }
    }
}

/// Re-parent `value` under `owner`
///
/// Collection values already owned by `owner` are returned unchanged. A
/// collection owned by any other pair is detached into an independent copy
/// and every nested collection is re-parented with it, so no proxy is ever
/// reachable from two owners. Scalars and references pass through.
pub fn prepare_value(owner: Option<&Owner>, value: Value) -> Value {
    if !value.is_collection() || value.owner() == owner {
        return value;
    }
    match value {
        Value::Sequence(mut l) => {
            l.adopt(owner);
            Value::Sequence(l)
        }
        Value::Mapping(mut d) => {
            d.adopt(owner);
            Value::Mapping(d)
        }
        Value::Tuple(mut t) => {
            t.adopt(owner);
            Value::Tuple(t)
        }
        Value::Set(mut s) => {
            s.adopt(owner);
            Value::Set(s)
        }
        other => other,
    }
}

fn adopt_all<'a>(values: impl Iterator<Item = &'a mut Value>, owner: Option<&Owner>) {
    for v in values {
        let taken = std::mem::take(v);
        *v = prepare_value(owner, taken);
    }
}

fn take_dirty_all<'a>(values: impl Iterator<Item = &'a mut Value>) -> bool {
    let mut dirty = false;
    for v in values {
        dirty |= v.take_dirty();
    }
    dirty
}

// ===== PersistentList =====

/// Ordered sequence proxy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersistentList {
    values: Vec<Value>,
    #[serde(skip)]
    tracking: Tracking,
}

impl PersistentList {
    /// Empty, unowned sequence
    pub fn new() -> Self {
        Self::default()
    }

    /// Unowned sequence over `values`
    pub fn from_values(values: Vec<Value>) -> Self {
        Self {
            values,
            tracking: Tracking::default(),
        }
    }

    /// Current owner
    pub fn owner(&self) -> Option<&Owner> {
        self.tracking.owner.as_ref()
    }

    /// True if mutated since the last `take_dirty`
    pub fn is_dirty(&self) -> bool {
        self.tracking.dirty
    }

    /// Clear and return the dirty flag, including nested proxies
    pub fn take_dirty(&mut self) -> bool {
        let own = std::mem::take(&mut self.tracking.dirty);
        take_dirty_all(self.values.iter_mut()) || own
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if there are no elements
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Element at `index`
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Iterate raw elements
    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.values.iter()
    }

    /// True if an element equals `value`
    pub fn contains(&self, value: &Value) -> bool {
        self.values.contains(value)
    }

    /// Iterate elements with references resolved; dangling ones become tombstones
    pub fn iter_resolved<'a>(
        &'a self,
        resolver: &'a dyn ItemResolver,
    ) -> impl Iterator<Item = Resolved<'a>> + 'a {
        self.values.iter().map(move |v| Resolved::resolve(v, resolver))
    }

    /// Append an element
    pub fn append(&mut self, value: impl Into<Value>, set_dirty: bool) {
        let value = prepare_value(self.owner(), value.into());
        self.values.push(value);
        self.tracking.touch(set_dirty);
    }

    /// Append every element of `values`
    pub fn extend<I, V>(&mut self, values: I, set_dirty: bool)
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        for v in values {
            self.append(v, false);
        }
        self.tracking.touch(set_dirty);
    }

    /// Insert before `index`; `index == len` appends
    pub fn insert(&mut self, index: usize, value: impl Into<Value>, set_dirty: bool) -> Result<()> {
        if index > self.values.len() {
            return Err(Error::IndexOutOfRange {
                index: index as i64,
                len: self.values.len(),
            });
        }
        let value = prepare_value(self.owner(), value.into());
        self.values.insert(index, value);
        self.tracking.touch(set_dirty);
        Ok(())
    }

    /// Replace the element at `index`, returning the previous one
    pub fn set(&mut self, index: usize, value: impl Into<Value>, set_dirty: bool) -> Result<Value> {
        let len = self.values.len();
        let value = prepare_value(self.owner(), value.into());
        let slot = self.values.get_mut(index).ok_or(Error::IndexOutOfRange {
            index: index as i64,
            len,
        })?;
        let old = std::mem::replace(slot, value);
        self.tracking.touch(set_dirty);
        Ok(old)
    }

    /// Remove the element at `index`
    pub fn remove(&mut self, index: usize, set_dirty: bool) -> Result<Value> {
        if index >= self.values.len() {
            return Err(Error::IndexOutOfRange {
                index: index as i64,
                len: self.values.len(),
            });
        }
        let old = self.values.remove(index);
        self.tracking.touch(set_dirty);
        Ok(old)
    }

    /// Remove the first element equal to `value`
    pub fn remove_value(&mut self, value: &Value, set_dirty: bool) -> bool {
        match self.values.iter().position(|v| v == value) {
            Some(i) => {
                self.values.remove(i);
                self.tracking.touch(set_dirty);
                true
            }
            None => false,
        }
    }

    /// Remove every element
    pub fn clear(&mut self, set_dirty: bool) {
        if !self.values.is_empty() {
            self.values.clear();
            self.tracking.touch(set_dirty);
        }
    }

    /// Independent copy for `owner` honoring `policy`
    pub fn copy(
        &self,
        owner: Option<&Owner>,
        policy: CopyPolicy,
        copier: &mut dyn FnMut(ItemId) -> ItemId,
    ) -> Self {
        let values = self
            .values
            .iter()
            .filter_map(|v| v.copy_with(owner, policy, copier))
            .collect();
        let mut copy = Self::from_values(values);
        copy.adopt(owner);
        copy
    }

    pub(crate) fn adopt(&mut self, owner: Option<&Owner>) {
        self.tracking = Tracking::owned_by(owner);
        adopt_all(self.values.iter_mut(), owner);
    }

    pub(crate) fn remove_ref(&mut self, id: ItemId) -> bool {
        let before = self.values.len();
        self.values.retain(|v| v.as_ref_id() != Some(id));
        let mut changed = self.values.len() != before;
        for v in self.values.iter_mut() {
            changed |= v.is_collection() && v.remove_ref(id);
        }
        self.tracking.touch(changed);
        changed
    }
}

impl PartialEq for PersistentList {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl<'a> IntoIterator for &'a PersistentList {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

// ===== PersistentDict =====

/// Keyed mapping proxy (string keys, ordered by key)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersistentDict {
    entries: BTreeMap<String, Value>,
    #[serde(skip)]
    tracking: Tracking,
}

impl PersistentDict {
    /// Empty, unowned mapping
    pub fn new() -> Self {
        Self::default()
    }

    /// Unowned mapping over `entries`
    pub fn from_entries(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
            tracking: Tracking::default(),
        }
    }

    /// Current owner
    pub fn owner(&self) -> Option<&Owner> {
        self.tracking.owner.as_ref()
    }

    /// True if mutated since the last `take_dirty`
    pub fn is_dirty(&self) -> bool {
        self.tracking.dirty
    }

    /// Clear and return the dirty flag, including nested proxies
    pub fn take_dirty(&mut self) -> bool {
        let own = std::mem::take(&mut self.tracking.dirty);
        take_dirty_all(self.entries.values_mut()) || own
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if there are no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Value under `key`
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// True if `key` is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Iterate keys in order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Iterate values in key order
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.values()
    }

    /// Iterate entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterate entries with references resolved
    pub fn iter_resolved<'a>(
        &'a self,
        resolver: &'a dyn ItemResolver,
    ) -> impl Iterator<Item = (&'a str, Resolved<'a>)> + 'a {
        self.entries
            .iter()
            .map(move |(k, v)| (k.as_str(), Resolved::resolve(v, resolver)))
    }

    /// Insert or replace, returning the previous value
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
        set_dirty: bool,
    ) -> Option<Value> {
        let value = prepare_value(self.owner(), value.into());
        let old = self.entries.insert(key.into(), value);
        self.tracking.touch(set_dirty);
        old
    }

    /// Remove the entry under `key`
    pub fn remove(&mut self, key: &str, set_dirty: bool) -> Option<Value> {
        let old = self.entries.remove(key);
        if old.is_some() {
            self.tracking.touch(set_dirty);
        }
        old
    }

    /// Remove every entry
    pub fn clear(&mut self, set_dirty: bool) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.tracking.touch(set_dirty);
        }
    }

    /// Independent copy for `owner` honoring `policy`
    pub fn copy(
        &self,
        owner: Option<&Owner>,
        policy: CopyPolicy,
        copier: &mut dyn FnMut(ItemId) -> ItemId,
    ) -> Self {
        let entries: Vec<(String, Value)> = self
            .entries
            .iter()
            .filter_map(|(k, v)| v.copy_with(owner, policy, copier).map(|v| (k.clone(), v)))
            .collect();
        let mut copy = Self::from_entries(entries);
        copy.adopt(owner);
        copy
    }

    pub(crate) fn adopt(&mut self, owner: Option<&Owner>) {
        self.tracking = Tracking::owned_by(owner);
        adopt_all(self.entries.values_mut(), owner);
    }

    pub(crate) fn remove_ref(&mut self, id: ItemId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|_, v| v.as_ref_id() != Some(id));
        let mut changed = self.entries.len() != before;
        for v in self.entries.values_mut() {
            changed |= v.is_collection() && v.remove_ref(id);
        }
        self.tracking.touch(changed);
        changed
    }
}

impl PartialEq for PersistentDict {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

// ===== PersistentTuple =====

/// Fixed-arity tuple proxy; slots can be replaced but never added or removed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersistentTuple {
    values: Vec<Value>,
    #[serde(skip)]
    tracking: Tracking,
}

impl PersistentTuple {
    /// Unowned tuple over `values`
    pub fn from_values(values: Vec<Value>) -> Self {
        Self {
            values,
            tracking: Tracking::default(),
        }
    }

    /// Current owner
    pub fn owner(&self) -> Option<&Owner> {
        self.tracking.owner.as_ref()
    }

    /// True if mutated since the last `take_dirty`
    pub fn is_dirty(&self) -> bool {
        self.tracking.dirty
    }

    /// Clear and return the dirty flag, including nested proxies
    pub fn take_dirty(&mut self) -> bool {
        let own = std::mem::take(&mut self.tracking.dirty);
        take_dirty_all(self.values.iter_mut()) || own
    }

    /// Arity
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True for the empty tuple
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Slot at `index`
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Iterate slots
    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.values.iter()
    }

    /// Iterate slots with references resolved
    pub fn iter_resolved<'a>(
        &'a self,
        resolver: &'a dyn ItemResolver,
    ) -> impl Iterator<Item = Resolved<'a>> + 'a {
        self.values.iter().map(move |v| Resolved::resolve(v, resolver))
    }

    /// Replace the slot at `index`, returning the previous value
    pub fn set(&mut self, index: usize, value: impl Into<Value>, set_dirty: bool) -> Result<Value> {
        let len = self.values.len();
        let value = prepare_value(self.owner(), value.into());
        let slot = self.values.get_mut(index).ok_or(Error::IndexOutOfRange {
            index: index as i64,
            len,
        })?;
        let old = std::mem::replace(slot, value);
        self.tracking.touch(set_dirty);
        Ok(old)
    }

    /// Independent copy for `owner`; dropped references leave null slots
    pub fn copy(
        &self,
        owner: Option<&Owner>,
        policy: CopyPolicy,
        copier: &mut dyn FnMut(ItemId) -> ItemId,
    ) -> Self {
        let values = self
            .values
            .iter()
            .map(|v| v.copy_with(owner, policy, copier).unwrap_or_default())
            .collect();
        let mut copy = Self::from_values(values);
        copy.adopt(owner);
        copy
    }

    pub(crate) fn adopt(&mut self, owner: Option<&Owner>) {
        self.tracking = Tracking::owned_by(owner);
        adopt_all(self.values.iter_mut(), owner);
    }

    pub(crate) fn remove_ref(&mut self, id: ItemId) -> bool {
        let mut changed = false;
        for v in self.values.iter_mut() {
            changed |= v.remove_ref(id);
        }
        self.tracking.touch(changed);
        changed
    }
}

impl PartialEq for PersistentTuple {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

// ===== PersistentSet =====

/// Unordered set proxy
///
/// Membership uses `Value` equality; insertion order is kept for stable
/// iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersistentSet {
    values: Vec<Value>,
    #[serde(skip)]
    tracking: Tracking,
}

impl PersistentSet {
    /// Empty, unowned set
    pub fn new() -> Self {
        Self::default()
    }

    /// Unowned set over `values`, duplicates dropped
    pub fn from_values(values: Vec<Value>) -> Self {
        let mut set = Self::new();
        for v in values {
            if !set.values.contains(&v) {
                set.values.push(v);
            }
        }
        set
    }

    /// Current owner
    pub fn owner(&self) -> Option<&Owner> {
        self.tracking.owner.as_ref()
    }

    /// True if mutated since the last `take_dirty`
    pub fn is_dirty(&self) -> bool {
        self.tracking.dirty
    }

    /// Clear and return the dirty flag, including nested proxies
    pub fn take_dirty(&mut self) -> bool {
        let own = std::mem::take(&mut self.tracking.dirty);
        take_dirty_all(self.values.iter_mut()) || own
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if there are no members
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True if `value` is a member
    pub fn contains(&self, value: &Value) -> bool {
        self.values.contains(value)
    }

    /// Iterate members
    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.values.iter()
    }

    /// Iterate members with references resolved
    pub fn iter_resolved<'a>(
        &'a self,
        resolver: &'a dyn ItemResolver,
    ) -> impl Iterator<Item = Resolved<'a>> + 'a {
        self.values.iter().map(move |v| Resolved::resolve(v, resolver))
    }

    /// Add a member; returns false if it was already present
    pub fn add(&mut self, value: impl Into<Value>, set_dirty: bool) -> bool {
        let value = value.into();
        if self.values.contains(&value) {
            return false;
        }
        let value = prepare_value(self.owner(), value);
        self.values.push(value);
        self.tracking.touch(set_dirty);
        true
    }

    /// Remove a member; returns false if it was absent
    pub fn remove(&mut self, value: &Value, set_dirty: bool) -> bool {
        match self.values.iter().position(|v| v == value) {
            Some(i) => {
                self.values.swap_remove(i);
                self.tracking.touch(set_dirty);
                true
            }
            None => false,
        }
    }

    /// Remove every member
    pub fn clear(&mut self, set_dirty: bool) {
        if !self.values.is_empty() {
            self.values.clear();
            self.tracking.touch(set_dirty);
        }
    }

    /// Independent copy for `owner` honoring `policy`
    pub fn copy(
        &self,
        owner: Option<&Owner>,
        policy: CopyPolicy,
        copier: &mut dyn FnMut(ItemId) -> ItemId,
    ) -> Self {
        let values = self
            .values
            .iter()
            .filter_map(|v| v.copy_with(owner, policy, copier))
            .collect();
        let mut copy = Self::from_values(values);
        copy.adopt(owner);
        copy
    }

    pub(crate) fn adopt(&mut self, owner: Option<&Owner>) {
        self.tracking = Tracking::owned_by(owner);
        adopt_all(self.values.iter_mut(), owner);
    }

    pub(crate) fn remove_ref(&mut self, id: ItemId) -> bool {
        let before = self.values.len();
        self.values.retain(|v| v.as_ref_id() != Some(id));
        let mut changed = self.values.len() != before;
        for v in self.values.iter_mut() {
            changed |= v.is_collection() && v.remove_ref(id);
        }
        self.tracking.touch(changed);
        changed
    }
}

impl PartialEq for PersistentSet {
    fn eq(&self, other: &Self) -> bool {
        self.values.len() == other.values.len()
            && self.values.iter().all(|v| other.values.contains(v))
    }
}
