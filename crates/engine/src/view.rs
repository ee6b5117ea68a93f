//! Repository views
//!
//! A `RepositoryView` is a private, versioned window onto a repository.
//! Items are loaded lazily at the view's version and cached; changes stay in
//! the view until [`commit`](RepositoryView::commit).
//!
//! ## Commit protocol
//!
//! 1. Take the repository commit lock
//! 2. Merge versions committed since the view's base; abort on conflict
//! 3. Check required attributes
//! 4. Queue records, kind index entries and the commit record in one batch
//! 5. Apply the batch (retried on deadlock), publish the new version
//! 6. Write the buffered full-text segment
//!
//! ## Merging
//!
//! Changes committed by other views are adopted attribute by attribute. An
//! attribute dirty here and changed elsewhere conflicts, except set
//! attributes and children lists: for those the additions and removals made
//! in this view are replayed over the newer committed value.

use crate::repository::{RepoInner, Repository};
use crate::sets::{ItemFacts, SetEvent, SetId, SetRegistry, SetSource, SetStats, Touch, WatchId};
use cairn_core::{
    Attribute, Cardinality, CopyPolicy, DeletePolicy, Error, ItemId, ItemResolver, Owner, Resolved,
    Result, Schema, Value, Version, WriteBatch,
};
use cairn_search::{Hit, IndexWriter, SearchResults};
use cairn_storage::{retry_on_deadlock, CommitRecord, ItemChange, ItemRecord};
use chrono::Utc;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Kind of the synthesized root of the namespace tree
pub const ROOT_KIND: &str = "cairn.root";

/// Reported as the conflicting attribute when one side deleted the item
const DELETED_MARKER: &str = "(deleted)";

/// View lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewStatus {
    /// Accepting reads and writes
    Open,
    /// Inside `commit`
    Committing,
    /// Closed; every call fails with `ViewClosed`
    Closed,
}

/// Summary of one item as seen by a view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInfo {
    /// Item id
    pub id: ItemId,
    /// Kind name
    pub kind: String,
    /// Parent in the namespace tree
    pub parent: Option<ItemId>,
    /// Name among its siblings
    pub name: Option<String>,
    /// Version of the committed record the view holds, 0 for new items
    pub version: Version,
}

#[derive(Debug, Clone)]
struct ItemState {
    kind: String,
    parent: Option<ItemId>,
    name: Option<String>,
    values: BTreeMap<String, Value>,
    children: Vec<ItemId>,
    deleted: bool,
    base: Version,
    is_new: bool,
    deleted_here: bool,
    dirty: BTreeSet<String>,
    children_dirty: bool,
    last_access: u64,
}

impl ItemState {
    fn new(kind: &str, parent: Option<ItemId>, name: Option<&str>) -> Self {
        Self {
            kind: kind.to_string(),
            parent,
            name: name.map(str::to_string),
            values: BTreeMap::new(),
            children: Vec::new(),
            deleted: false,
            base: 0,
            is_new: true,
            deleted_here: false,
            dirty: BTreeSet::new(),
            children_dirty: false,
            last_access: 0,
        }
    }

    fn root() -> Self {
        Self {
            is_new: false,
            ..Self::new(ROOT_KIND, None, None)
        }
    }

    fn from_record(id: ItemId, base: Version, record: ItemRecord) -> Self {
        let values = record
            .values
            .into_iter()
            .map(|(attribute, value)| {
                let owner = Owner::new(id, attribute.clone());
                (attribute, value.prepared(&owner))
            })
            .collect();
        Self {
            kind: record.kind,
            parent: record.parent,
            name: record.name,
            values,
            children: record.children,
            deleted: record.deleted,
            base,
            is_new: false,
            deleted_here: false,
            dirty: BTreeSet::new(),
            children_dirty: false,
            last_access: 0,
        }
    }

    fn is_dirty(&self) -> bool {
        self.is_new || self.deleted_here || self.children_dirty || !self.dirty.is_empty()
    }

    fn mark_clean(&mut self, version: Version) {
        self.dirty.clear();
        self.children_dirty = false;
        self.is_new = false;
        self.deleted_here = false;
        self.base = version;
    }

    fn to_record(&self) -> ItemRecord {
        ItemRecord {
            kind: self.kind.clone(),
            parent: self.parent,
            name: self.name.clone(),
            values: self.values.clone(),
            children: self.children.clone(),
            deleted: self.deleted,
        }
    }

    fn change(&self, id: ItemId) -> ItemChange {
        ItemChange {
            item: id,
            kind: self.kind.clone(),
            attributes: self.dirty.iter().cloned().collect(),
            created: self.is_new,
            deleted: self.deleted_here,
            children_changed: self.children_dirty,
        }
    }

    fn info(&self, id: ItemId) -> ItemInfo {
        ItemInfo {
            id,
            kind: self.kind.clone(),
            parent: self.parent,
            name: self.name.clone(),
            version: self.base,
        }
    }

    fn conflicts_with(&self, incoming: &Incoming, schema: &Schema) -> Vec<String> {
        if incoming.deleted || self.deleted_here {
            if incoming.deleted && self.deleted_here {
                return Vec::new();
            }
            return vec![DELETED_MARKER.to_string()];
        }
        self.dirty
            .intersection(&incoming.attributes)
            .filter(|attribute| {
                !schema
                    .attribute(&self.kind, attribute)
                    .map_or(false, Attribute::is_mergeable)
            })
            .cloned()
            .collect()
    }
}

/// Aggregated changes other views committed to one item
#[derive(Debug)]
struct Incoming {
    first: Version,
    attributes: BTreeSet<String>,
    children: bool,
    deleted: bool,
}

impl Incoming {
    fn new(first: Version) -> Self {
        Self {
            first,
            attributes: BTreeSet::new(),
            children: false,
            deleted: false,
        }
    }
}

fn set_elements(value: Option<&Value>) -> Vec<Value> {
    value
        .map(|v| v.elements().cloned().collect())
        .unwrap_or_default()
}

/// Replay `mine - base` additions and `base - mine` removals over `theirs`
fn merge_elements<T: PartialEq + Clone>(base: &[T], mine: &[T], theirs: Vec<T>) -> Vec<T> {
    let mut out = theirs;
    out.retain(|x| !(base.contains(x) && !mine.contains(x)));
    for x in mine {
        if !base.contains(x) && !out.contains(x) {
            out.push(x.clone());
        }
    }
    out
}

fn indexable_text(value: &Value) -> Option<String> {
    let parts: Vec<&str> = value.elements().filter_map(Value::as_text).collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

/// An isolated, versioned read/write window onto a repository
///
/// Reads observe the view's version until [`refresh`](Self::refresh) or
/// [`commit`](Self::commit). Writes are buffered in the view.
pub struct RepositoryView {
    repo: Repository,
    id: u64,
    name: String,
    version: Version,
    status: ViewStatus,
    items: FxHashMap<ItemId, ItemState>,
    clock: u64,
    sets: SetRegistry,
}

impl std::fmt::Debug for RepositoryView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryView")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("status", &self.status)
            .field("items", &self.items.len())
            .field("sets", &self.sets)
            .finish()
    }
}

impl Drop for RepositoryView {
    fn drop(&mut self) {
        if self.status != ViewStatus::Closed {
            self.repo.inner.unregister_view(self.id);
        }
    }
}

impl ItemResolver for RepositoryView {
    fn is_live(&self, id: ItemId) -> bool {
        if let Some(state) = self.items.get(&id) {
            return !state.deleted;
        }
        matches!(
            self.repo.inner.items.load(id, self.version),
            Ok(Some((_, record))) if !record.deleted
        )
    }
}

impl RepositoryView {
    pub(crate) fn new(repo: Repository, name: String, version: Version) -> Self {
        let id = repo.inner.register_view(&name);
        debug!(view = %name, version, "Opened view");
        Self {
            repo,
            id,
            name,
            version,
            status: ViewStatus::Open,
            items: FxHashMap::default(),
            clock: 0,
            sets: SetRegistry::default(),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// View name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Version reads observe
    pub fn version(&self) -> Version {
        self.version
    }

    /// Lifecycle state
    pub fn status(&self) -> ViewStatus {
        self.status
    }

    /// Repository this view belongs to
    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    /// True if the view holds uncommitted changes
    pub fn is_dirty(&self) -> bool {
        self.items.values().any(ItemState::is_dirty)
    }

    /// Items currently cached
    pub fn cached_items(&self) -> usize {
        self.items.len()
    }

    /// Close the view, dropping its cache, sets and unsaved changes
    pub fn close_view(&mut self) {
        if self.status == ViewStatus::Closed {
            return;
        }
        let discarded = self.items.values().filter(|s| s.is_dirty()).count();
        self.items.clear();
        self.sets = SetRegistry::default();
        self.status = ViewStatus::Closed;
        self.repo.inner.unregister_view(self.id);
        info!(view = %self.name, version = self.version, discarded, "Closed view");
    }

    /// Reopen a closed view at the latest committed version
    pub fn open_view(&mut self) -> Result<()> {
        self.repo.inner.check_open()?;
        if self.status != ViewStatus::Closed {
            return Ok(());
        }
        self.version = self.repo.inner.latest();
        self.id = self.repo.inner.register_view(&self.name);
        self.status = ViewStatus::Open;
        debug!(view = %self.name, version = self.version, "Reopened view");
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        self.repo.inner.check_open()?;
        match self.status {
            ViewStatus::Closed => Err(Error::ViewClosed(self.name.clone())),
            _ => Ok(()),
        }
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.repo.inner.schema)
    }

    // ========================================================================
    // Item cache
    // ========================================================================

    fn load(&mut self, id: ItemId) -> Result<&mut ItemState> {
        self.clock += 1;
        let clock = self.clock;
        if !self.items.contains_key(&id) {
            let state = match self.repo.inner.items.load(id, self.version)? {
                Some((base, record)) => ItemState::from_record(id, base, record),
                None if id.is_root() => ItemState::root(),
                None => return Err(Error::ItemNotFound(id)),
            };
            debug!(view = %self.name, item = %id, version = state.base, "Loaded item");
            self.items.insert(id, state);
        }
        let state = self
            .items
            .get_mut(&id)
            .ok_or_else(|| Error::corruption(format!("item {} vanished from the view cache", id)))?;
        state.last_access = clock;
        Ok(state)
    }

    fn live(&mut self, id: ItemId) -> Result<&mut ItemState> {
        let state = self.load(id)?;
        if state.deleted {
            return Err(Error::ItemDeleted(id));
        }
        Ok(state)
    }

    fn live_or_missing(&mut self, id: ItemId) -> Result<bool> {
        match self.load(id) {
            Ok(state) => Ok(!state.deleted),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn attribute_def(&mut self, id: ItemId, attribute: &str) -> Result<Attribute> {
        let schema = self.schema();
        let kind = self.live(id)?.kind.clone();
        schema.attribute(&kind, attribute).cloned()
    }

    /// Evict clean items until at most `size` remain, least recently used
    /// first. Returns the number evicted.
    pub fn prune(&mut self, size: usize) -> usize {
        if self.items.len() <= size {
            return 0;
        }
        let mut clean: Vec<(u64, ItemId)> = self
            .items
            .iter()
            .filter(|(_, s)| !s.is_dirty())
            .map(|(id, s)| (s.last_access, *id))
            .collect();
        clean.sort();
        let excess = self.items.len() - size;
        let mut evicted = 0;
        for (_, id) in clean.into_iter().take(excess) {
            self.items.remove(&id);
            evicted += 1;
        }
        debug!(view = %self.name, evicted, remaining = self.items.len(), "Pruned view cache");
        evicted
    }

    // ========================================================================
    // Items
    // ========================================================================

    /// Create an item of `kind` under `parent` (the root when `None`)
    pub fn create_item(
        &mut self,
        kind: &str,
        parent: Option<ItemId>,
        name: Option<&str>,
    ) -> Result<ItemId> {
        self.check_open()?;
        let id = ItemId::new();
        self.create_item_as(id, kind, parent, name)?;
        debug!(view = %self.name, item = %id, kind, "Created item");
        Ok(id)
    }

    fn create_item_as(
        &mut self,
        id: ItemId,
        kind: &str,
        parent: Option<ItemId>,
        name: Option<&str>,
    ) -> Result<()> {
        self.repo.inner.schema.kind(kind)?;
        let parent = parent.unwrap_or(ItemId::ROOT);
        let parent_state = self.live(parent)?;
        parent_state.children.push(id);
        parent_state.children_dirty = true;

        let mut state = ItemState::new(kind, Some(parent), name);
        self.clock += 1;
        state.last_access = self.clock;
        self.items.insert(id, state);
        self.notify(id, Touch::Created)
    }

    /// Live item `id`, or `None` if it does not exist at this view's version
    pub fn find(&mut self, id: ItemId) -> Result<Option<ItemInfo>> {
        self.check_open()?;
        match self.load(id) {
            Ok(state) if !state.deleted => Ok(Some(state.info(id))),
            Ok(_) => Ok(None),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// [`find`](Self::find) by the textual form of the id
    pub fn find_uuid(&mut self, uuid: &str) -> Result<Option<ItemInfo>> {
        match ItemId::from_string(uuid) {
            Some(id) => self.find(id),
            None => Ok(None),
        }
    }

    /// Resolve a path of item names such as `//projects/cairn`
    pub fn find_path(&mut self, path: &str) -> Result<Option<ItemId>> {
        self.check_open()?;
        let mut current = ItemId::ROOT;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let mut next = None;
            for child in self.children(current)? {
                if self.load(child)?.name.as_deref() == Some(segment) {
                    next = Some(child);
                    break;
                }
            }
            match next {
                Some(child) => current = child,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Live children of `id` in creation order
    pub fn children(&mut self, id: ItemId) -> Result<Vec<ItemId>> {
        self.check_open()?;
        let children = self.live(id)?.children.clone();
        let mut out = Vec::with_capacity(children.len());
        for child in children {
            if self.live_or_missing(child)? {
                out.push(child);
            }
        }
        Ok(out)
    }

    /// Top-level items
    pub fn roots(&mut self) -> Result<Vec<ItemId>> {
        self.children(ItemId::ROOT)
    }

    /// Kind name of `id`
    pub fn kind_of(&mut self, id: ItemId) -> Result<String> {
        self.check_open()?;
        Ok(self.live(id)?.kind.clone())
    }

    // ========================================================================
    // Values
    // ========================================================================

    /// Value of `attribute`, falling back to the schema default
    pub fn get_value(&mut self, id: ItemId, attribute: &str) -> Result<Option<Value>> {
        self.check_open()?;
        let schema = self.schema();
        let state = self.live(id)?;
        let def = schema.attribute(&state.kind, attribute)?;
        Ok(state
            .values
            .get(attribute)
            .cloned()
            .or_else(|| def.default.clone()))
    }

    /// True if `attribute` has a non-null value or default
    pub fn has_value(&mut self, id: ItemId, attribute: &str) -> Result<bool> {
        Ok(self
            .get_value(id, attribute)?
            .map_or(false, |v| !v.is_null()))
    }

    /// Names of the attributes `id` stores a value for
    pub fn attribute_names(&mut self, id: ItemId) -> Result<Vec<String>> {
        self.check_open()?;
        Ok(self.live(id)?.values.keys().cloned().collect())
    }

    /// Replace the value of `attribute`
    ///
    /// A collection owned elsewhere is copied; inverse attributes on the
    /// referenced items are updated.
    pub fn set_value(&mut self, id: ItemId, attribute: &str, value: impl Into<Value>) -> Result<()> {
        self.check_open()?;
        self.assign(id, attribute, Some(value.into()))
    }

    /// Add `value` to a list or set attribute, or set a single attribute
    pub fn add_value(&mut self, id: ItemId, attribute: &str, value: impl Into<Value>) -> Result<()> {
        self.check_open()?;
        let value = value.into();
        let cardinality = self.attribute_def(id, attribute)?.cardinality;
        match cardinality {
            Cardinality::Single => self.assign(id, attribute, Some(value)),
            Cardinality::List => self.with_collection(id, attribute, |c| {
                if let Some(list) = c.as_list_mut() {
                    list.append(value, true);
                }
            }),
            Cardinality::Set => self.with_collection(id, attribute, |c| {
                if let Some(set) = c.as_set_mut() {
                    set.add(value, true);
                }
            }),
            Cardinality::Dict | Cardinality::Tuple => Err(Error::TypeMismatch {
                attribute: attribute.to_string(),
                expected: "List or Set".to_string(),
                actual: format!("{:?}", cardinality),
            }),
        }
    }

    /// Remove `value` from `attribute`, or clear it when `value` is `None`
    ///
    /// For mapping attributes `value` is the key. Returns false if nothing
    /// was removed.
    pub fn remove_value(
        &mut self,
        id: ItemId,
        attribute: &str,
        value: Option<&Value>,
    ) -> Result<bool> {
        self.check_open()?;
        let def = self.attribute_def(id, attribute)?;
        let value = match value {
            Some(v) => v,
            None => {
                let present = self
                    .live(id)?
                    .values
                    .get(attribute)
                    .map_or(false, |v| !v.is_null());
                if present {
                    self.assign(id, attribute, None)?;
                }
                return Ok(present);
            }
        };
        match def.cardinality {
            Cardinality::Single => {
                let matches = self.live(id)?.values.get(attribute) == Some(value);
                if matches {
                    self.assign(id, attribute, None)?;
                }
                Ok(matches)
            }
            Cardinality::List => self.with_collection(id, attribute, |c| {
                c.as_list_mut()
                    .map_or(false, |list| list.remove_value(value, true))
            }),
            Cardinality::Set => self.with_collection(id, attribute, |c| {
                c.as_set_mut().map_or(false, |set| set.remove(value, true))
            }),
            Cardinality::Dict => match value.as_text() {
                Some(key) => self.with_collection(id, attribute, |c| {
                    c.as_dict_mut()
                        .and_then(|dict| dict.remove(key, true))
                        .is_some()
                }),
                None => Ok(false),
            },
            Cardinality::Tuple => Err(Error::TypeMismatch {
                attribute: attribute.to_string(),
                expected: "List, Set or Dict".to_string(),
                actual: "Tuple".to_string(),
            }),
        }
    }

    /// Mutate a collection attribute in place
    ///
    /// `f` receives the current value, or an empty collection of the
    /// attribute's cardinality. The result is type-checked and recorded as a
    /// change only if it differs from what `f` was given.
    pub fn with_collection<R>(
        &mut self,
        id: ItemId,
        attribute: &str,
        f: impl FnOnce(&mut Value) -> R,
    ) -> Result<R> {
        self.check_open()?;
        let def = self.attribute_def(id, attribute)?;
        let owner = Owner::new(id, attribute);
        let current = self.live(id)?.values.get(attribute).cloned();
        let mut working = match current {
            Some(v) if !v.is_null() => v,
            _ => def
                .default
                .clone()
                .filter(|d| !d.is_null())
                .unwrap_or_else(|| def.empty_value()),
        }
        .prepared(&owner);
        let start = working.clone();

        let result = f(&mut working);
        let mut working = working.prepared(&owner);
        working.take_dirty();
        if working != start {
            self.assign(id, attribute, Some(working))?;
        }
        Ok(result)
    }

    /// Elements of `attribute` with references resolved against this view
    pub fn iter_values(&mut self, id: ItemId, attribute: &str) -> Result<Vec<Resolved<'_>>> {
        self.check_open()?;
        self.attribute_def(id, attribute)?;
        let view: &Self = self;
        let value = match view.items.get(&id).and_then(|s| s.values.get(attribute)) {
            Some(v) => v,
            None => return Ok(Vec::new()),
        };
        Ok(value
            .elements()
            .map(|v| match v {
                Value::Ref(r) if view.is_live(*r) => Resolved::Item(*r),
                Value::Ref(r) => Resolved::Tombstone(*r),
                other => Resolved::Value(other),
            })
            .collect())
    }

    fn assign(&mut self, id: ItemId, attribute: &str, value: Option<Value>) -> Result<()> {
        let schema = self.schema();
        let kind = self.live(id)?.kind.clone();
        let def = schema.attribute(&kind, attribute)?;
        let value = match value {
            Some(v) => {
                def.check(&v)?;
                Some(v.prepared(&Owner::new(id, attribute)))
            }
            None => None,
        };

        let old_refs = self
            .live(id)?
            .values
            .get(attribute)
            .map(Value::refs)
            .unwrap_or_default();
        let new_refs = value.as_ref().map(Value::refs).unwrap_or_default();
        let added: Vec<ItemId> = new_refs
            .iter()
            .filter(|r| !old_refs.contains(r))
            .copied()
            .collect();
        let removed: Vec<ItemId> = old_refs
            .iter()
            .filter(|r| !new_refs.contains(r))
            .copied()
            .collect();
        if let Some(inverse) = &def.inverse {
            self.check_link_targets(&added, inverse)?;
        }

        let state = self.live(id)?;
        match value {
            Some(v) => {
                state.values.insert(attribute.to_string(), v);
            }
            None => {
                state.values.remove(attribute);
            }
        }
        state.dirty.insert(attribute.to_string());

        if let Some(inverse) = &def.inverse {
            for target in removed {
                self.unlink(target, inverse, id)?;
            }
            for target in added {
                self.link(target, inverse, id, attribute)?;
            }
        }
        self.attribute_changed(id, attribute)
    }

    fn check_link_targets(&mut self, targets: &[ItemId], inverse: &str) -> Result<()> {
        let schema = self.schema();
        for target in targets {
            let kind = self.live(*target)?.kind.clone();
            let def = schema.attribute(&kind, inverse)?;
            if def.cardinality == Cardinality::Tuple {
                return Err(Error::TypeMismatch {
                    attribute: inverse.to_string(),
                    expected: "Single, List, Dict or Set".to_string(),
                    actual: "Tuple".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Record `source` in `target.inverse`; a single-valued inverse that
    /// pointed elsewhere drops `target` from the displaced item's `forward`
    fn link(&mut self, target: ItemId, inverse: &str, source: ItemId, forward: &str) -> Result<()> {
        let def = self.attribute_def(target, inverse)?;
        let owner = Owner::new(target, inverse);
        let mut displaced = None;
        let state = self.live(target)?;
        let slot = state
            .values
            .entry(inverse.to_string())
            .or_insert_with(Value::null);
        if slot.is_null() {
            *slot = def.empty_value().prepared(&owner);
        }
        let changed = match def.cardinality {
            Cardinality::Single => match slot.as_ref_id() {
                Some(previous) if previous == source => false,
                previous => {
                    displaced = previous;
                    *slot = Value::Ref(source);
                    true
                }
            },
            Cardinality::List => slot.as_list_mut().map_or(false, |list| {
                if list.contains(&Value::Ref(source)) {
                    false
                } else {
                    list.append(source, true);
                    true
                }
            }),
            Cardinality::Set => slot.as_set_mut().map_or(false, |set| set.add(source, true)),
            Cardinality::Dict => slot.as_dict_mut().map_or(false, |dict| {
                dict.insert(source.to_string(), source, true) != Some(Value::Ref(source))
            }),
            Cardinality::Tuple => false,
        };
        if !changed {
            return Ok(());
        }
        state.dirty.insert(inverse.to_string());
        if let Some(previous) = displaced {
            self.unlink(previous, forward, target)?;
        }
        self.attribute_changed(target, inverse)
    }

    /// Drop `source` from `target.inverse`; missing or deleted targets are skipped
    fn unlink(&mut self, target: ItemId, inverse: &str, source: ItemId) -> Result<()> {
        let changed = match self.load(target) {
            Ok(state) if !state.deleted => {
                let removed = state
                    .values
                    .get_mut(inverse)
                    .map_or(false, |v| v.remove_ref(source));
                if removed {
                    state.dirty.insert(inverse.to_string());
                }
                removed
            }
            Ok(_) => false,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        };
        if changed {
            self.attribute_changed(target, inverse)?;
        }
        Ok(())
    }

    // ========================================================================
    // Delete and copy
    // ========================================================================

    /// Delete `id` and its children
    ///
    /// References the item held are nulled on their inverse side, and
    /// attributes with the `Cascade` policy delete what they reference.
    pub fn delete_item(&mut self, id: ItemId) -> Result<()> {
        self.check_open()?;
        if id.is_root() {
            return Err(Error::invalid_state("the root item cannot be deleted"));
        }
        self.live(id)?;
        self.delete_recursive(id)?;
        debug!(view = %self.name, item = %id, "Deleted item");
        Ok(())
    }

    fn delete_recursive(&mut self, id: ItemId) -> Result<()> {
        let schema = self.schema();
        let state = self.live(id)?;
        state.deleted = true;
        state.deleted_here = true;
        let kind = state.kind.clone();
        let parent = state.parent;
        let children = state.children.clone();
        let values = std::mem::take(&mut state.values);
        state.dirty.extend(values.keys().cloned());

        for child in children {
            if self.live_or_missing(child)? {
                self.delete_recursive(child)?;
            }
        }

        for (attribute, value) in &values {
            let def = match schema.attribute(&kind, attribute) {
                Ok(def) => def,
                Err(_) => continue,
            };
            for target in value.refs() {
                if let Some(inverse) = &def.inverse {
                    self.unlink(target, inverse, id)?;
                }
                if def.delete_policy == DeletePolicy::Cascade
                    && !target.is_root()
                    && self.live_or_missing(target)?
                {
                    self.delete_recursive(target)?;
                }
            }
        }

        if let Some(parent) = parent {
            if let Ok(parent_state) = self.load(parent) {
                if let Some(pos) = parent_state.children.iter().position(|c| *c == id) {
                    parent_state.children.remove(pos);
                    parent_state.children_dirty = true;
                }
            }
        }

        self.notify(id, Touch::Deleted)?;
        for attribute in self.sets.watched_attributes(id) {
            self.sync_attribute_set(id, &attribute)?;
        }
        Ok(())
    }

    /// Copy `id` under `parent` (its own parent when `None`)
    ///
    /// References follow each attribute's copy policy: `Link` keeps them,
    /// `Copy` copies the referenced item too, `Remove` drops them.
    pub fn copy_item(
        &mut self,
        id: ItemId,
        parent: Option<ItemId>,
        name: Option<&str>,
    ) -> Result<ItemId> {
        self.check_open()?;
        let schema = self.schema();
        let copy = ItemId::new();
        let mut copies: BTreeMap<ItemId, ItemId> = BTreeMap::new();
        copies.insert(id, copy);
        let mut queue = vec![(id, copy)];
        let mut planned: Vec<(ItemId, Vec<(String, Value)>)> = Vec::new();
        let mut unreachable: BTreeSet<ItemId> = BTreeSet::new();

        // Allocate every copy first so references between copies resolve
        while let Some((source, target)) = queue.pop() {
            let (kind, source_parent, source_name, values) = match self.live(source) {
                Ok(s) => (s.kind.clone(), s.parent, s.name.clone(), s.values.clone()),
                Err(e) if source != id && (e.is_not_found() || matches!(e, Error::ItemDeleted(_))) => {
                    unreachable.insert(target);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let (new_parent, new_name) = if source == id {
                (parent.or(source_parent), name.map(str::to_string).or(source_name))
            } else {
                (source_parent, source_name)
            };
            self.create_item_as(target, &kind, new_parent, new_name.as_deref())?;

            let mut discovered = Vec::new();
            let mut copied = Vec::new();
            for (attribute, value) in values {
                let policy = schema
                    .attribute(&kind, &attribute)
                    .map(|a| a.copy_policy)
                    .unwrap_or(CopyPolicy::Link);
                let owner = Owner::new(target, attribute.clone());
                let mut copier = |r: ItemId| {
                    *copies.entry(r).or_insert_with(|| {
                        let fresh = ItemId::new();
                        discovered.push((r, fresh));
                        fresh
                    })
                };
                if let Some(v) = value.copy_with(Some(&owner), policy, &mut copier) {
                    copied.push((attribute, v));
                }
            }
            queue.extend(discovered);
            planned.push((target, copied));
        }

        for (target, values) in planned {
            for (attribute, mut value) in values {
                for gone in &unreachable {
                    value.remove_ref(*gone);
                }
                if value.is_null() {
                    continue;
                }
                self.assign(target, &attribute, Some(value))?;
            }
        }
        debug!(view = %self.name, item = %id, copy = %copy, items = copies.len(), "Copied item");
        Ok(copy)
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Discard every unsaved change
    pub fn cancel(&mut self) -> Result<()> {
        self.check_open()?;
        let dirty: Vec<ItemId> = self
            .items
            .iter()
            .filter(|(_, s)| s.is_dirty())
            .map(|(id, _)| *id)
            .collect();
        for id in &dirty {
            self.items.remove(id);
        }
        if !self.sets.is_empty() {
            for id in &dirty {
                self.reload_sets(*id)?;
            }
        }
        info!(view = %self.name, items = dirty.len(), "Cancelled view changes");
        Ok(())
    }

    /// Move the view to the latest committed version, merging its changes
    ///
    /// # Errors
    ///
    /// `Error::VersionConflict` if an attribute changed here was also
    /// changed by a newer commit; the view is left untouched.
    pub fn refresh(&mut self) -> Result<Version> {
        self.check_open()?;
        let latest = self.repo.inner.latest();
        self.merge_to(latest)?;
        Ok(self.version)
    }

    fn merge_to(&mut self, latest: Version) -> Result<()> {
        if latest <= self.version {
            return Ok(());
        }
        let schema = self.schema();
        let records = self.repo.inner.log.range(self.version + 1, latest)?;
        let mut incoming: BTreeMap<ItemId, Incoming> = BTreeMap::new();
        for record in &records {
            for change in &record.changes {
                let entry = incoming
                    .entry(change.item)
                    .or_insert_with(|| Incoming::new(record.version));
                entry.attributes.extend(change.attributes.iter().cloned());
                entry.children |= change.children_changed;
                entry.deleted |= change.deleted;
            }
        }

        for (id, theirs) in &incoming {
            let state = match self.items.get(id) {
                Some(state) if state.is_dirty() => state,
                _ => continue,
            };
            let conflicts = state.conflicts_with(theirs, &schema);
            if !conflicts.is_empty() {
                debug!(view = %self.name, item = %id, version = theirs.first, ?conflicts, "Merge conflict");
                return Err(Error::VersionConflict {
                    item: *id,
                    attributes: conflicts,
                    version: theirs.first,
                });
            }
        }

        let base = self.version;
        self.version = latest;
        let mut merged = 0;
        for (id, theirs) in &incoming {
            match self.items.get(id).map(ItemState::is_dirty) {
                Some(true) => {
                    self.merge_item(*id, theirs, base, latest)?;
                    merged += 1;
                }
                Some(false) => {
                    self.items.remove(id);
                }
                None => {}
            }
            if !self.sets.is_empty() {
                self.reload_sets(*id)?;
            }
        }
        info!(
            view = %self.name,
            from = base,
            to = latest,
            items = incoming.len(),
            merged,
            "Refreshed view"
        );
        Ok(())
    }

    fn merge_item(&mut self, id: ItemId, theirs: &Incoming, base: Version, latest: Version) -> Result<()> {
        let (version, current) = self
            .repo
            .inner
            .items
            .load(id, latest)?
            .ok_or_else(|| Error::corruption(format!("committed item {} has no record", id)))?;
        let ancestor = self
            .repo
            .inner
            .items
            .load(id, base)?
            .map(|(_, record)| record)
            .unwrap_or_default();
        let state = self
            .items
            .get_mut(&id)
            .ok_or_else(|| Error::corruption(format!("item {} vanished from the view cache", id)))?;
        state.base = version;
        if theirs.deleted {
            state.deleted = true;
            return Ok(());
        }

        for attribute in &theirs.attributes {
            let value = if state.dirty.contains(attribute) {
                let mine = set_elements(state.values.get(attribute));
                Some(Value::set(merge_elements(
                    &set_elements(ancestor.values.get(attribute)),
                    &mine,
                    set_elements(current.values.get(attribute)),
                )))
            } else {
                current.values.get(attribute).cloned()
            };
            match value {
                Some(v) => {
                    let owner = Owner::new(id, attribute.clone());
                    state.values.insert(attribute.clone(), v.prepared(&owner));
                }
                None => {
                    state.values.remove(attribute);
                }
            }
        }
        if theirs.children {
            state.children = if state.children_dirty {
                merge_elements(&ancestor.children, &state.children, current.children.clone())
            } else {
                current.children.clone()
            };
        }
        debug!(view = %self.name, item = %id, version, "Merged item");
        Ok(())
    }

    /// Commit every change in the view and return the new version
    ///
    /// A view without changes returns its current version after merging
    /// newer commits.
    ///
    /// # Errors
    ///
    /// - `Error::VersionConflict` if a newer commit changed an attribute
    ///   changed here; nothing is written
    /// - `Error::InvalidState` if a required attribute has no value
    /// - `Error::Deadlock` once container retries are exhausted
    pub fn commit(&mut self) -> Result<Version> {
        self.check_open()?;
        let inner = Arc::clone(&self.repo.inner);
        let _guard = inner.commit_lock.lock();
        self.merge_to(inner.latest())?;

        let mut dirty: Vec<ItemId> = Vec::new();
        let mut discarded: Vec<ItemId> = Vec::new();
        for (id, state) in &self.items {
            if state.is_new && state.deleted {
                discarded.push(*id);
            } else if state.is_dirty() {
                dirty.push(*id);
            }
        }
        dirty.sort();
        for id in &discarded {
            self.items.remove(id);
        }
        if dirty.is_empty() {
            return Ok(self.version);
        }
        self.check_required(&dirty)?;

        let version = inner.latest() + 1;
        let writer = self.index_writer(&inner, &dirty, version);
        self.status = ViewStatus::Committing;
        let written = self.write_commit(&inner, &dirty, version);
        self.status = ViewStatus::Open;
        if let Err(e) = written {
            if let (Some(index), Some(writer)) = (&inner.full_text, writer) {
                index.abort_writer(writer);
            }
            error!(view = %self.name, version, error = %e, "Commit aborted");
            return Err(e);
        }
        inner.version.store(version, Ordering::Release);

        if let (Some(index), Some(writer)) = (&inner.full_text, writer) {
            for id in &dirty {
                if self.items.get(id).map_or(false, |s| s.deleted_here) {
                    if let Err(e) = index.purge_documents(*id, None, |_| false) {
                        warn!(item = %id, error = %e, "Failed to purge full-text documents");
                    }
                }
            }
            if let Err(e) = index.commit_writer(writer, version) {
                warn!(version, error = %e, "Full-text indexing failed; the commit stands");
            }
        }

        for id in &dirty {
            if let Some(state) = self.items.get_mut(id) {
                state.mark_clean(version);
            }
        }
        self.version = version;
        info!(view = %self.name, version, items = dirty.len(), "Committed view");
        Ok(version)
    }

    fn check_required(&self, dirty: &[ItemId]) -> Result<()> {
        let schema = self.schema();
        for id in dirty {
            let state = match self.items.get(id) {
                Some(state) if !state.deleted && !id.is_root() => state,
                _ => continue,
            };
            for def in schema.kind(&state.kind)?.attributes() {
                if !def.required {
                    continue;
                }
                let present = state.values.get(&def.name).map_or(false, |v| !v.is_null())
                    || def.default.as_ref().map_or(false, |d| !d.is_null());
                if !present {
                    return Err(Error::invalid_state(format!(
                        "item {} of kind '{}' has no value for required attribute '{}'",
                        id, state.kind, def.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn index_writer(&self, inner: &RepoInner, dirty: &[ItemId], version: Version) -> Option<IndexWriter> {
        let index = inner.full_text.as_ref()?;
        let mut writer = index.writer();
        for id in dirty {
            let state = match self.items.get(id) {
                Some(state) if !state.deleted => state,
                _ => continue,
            };
            for attribute in &state.dirty {
                let indexed = inner
                    .schema
                    .attribute(&state.kind, attribute)
                    .map_or(false, |a| a.indexed);
                if !indexed {
                    continue;
                }
                if let Some(text) = state.values.get(attribute).and_then(indexable_text) {
                    writer.index_value(*id, attribute, &text, version);
                }
            }
        }
        Some(writer)
    }

    fn write_commit(&self, inner: &RepoInner, dirty: &[ItemId], version: Version) -> Result<()> {
        let mut batch = WriteBatch::new();
        let mut changes = Vec::with_capacity(dirty.len());
        for id in dirty {
            let state = self
                .items
                .get(id)
                .ok_or_else(|| Error::corruption(format!("dirty item {} left the view cache", id)))?;
            inner.items.save_in(&mut batch, *id, version, &state.to_record())?;
            if state.is_new && !id.is_root() {
                inner.items.index_kind_in(&mut batch, &state.kind, *id, version);
            }
            changes.push(state.change(*id));
        }
        let record = CommitRecord {
            version,
            timestamp: Utc::now(),
            view_name: self.name.clone(),
            view_size: self.items.len(),
            count: dirty.len(),
            changes,
        };
        inner.log.record_in(&mut batch, &record)?;
        retry_on_deadlock(&inner.config.retry, "commit", || {
            inner.container.apply_batch(&batch)
        })
    }

    /// Call `f` with each unsaved item change, in item order
    pub fn map_changes(&self, mut f: impl FnMut(&ItemChange)) {
        let mut dirty: Vec<(&ItemId, &ItemState)> =
            self.items.iter().filter(|(_, s)| s.is_dirty()).collect();
        dirty.sort_by_key(|(id, _)| **id);
        for (id, state) in dirty {
            f(&state.change(*id));
        }
    }

    /// Call `f` with each commit record in `from..=to`
    pub fn map_history(
        &self,
        from: Version,
        to: Version,
        mut f: impl FnMut(&CommitRecord),
    ) -> Result<()> {
        self.check_open()?;
        for record in self.repo.inner.log.range(from, to)? {
            f(&record);
        }
        Ok(())
    }

    // ========================================================================
    // Full-text search
    // ========================================================================

    /// Search indexed attributes as of this view's version
    ///
    /// Hits whose value has since been superseded, or whose item is
    /// deleted, are filtered out as results are pulled.
    pub fn search<'a>(
        &'a self,
        query: &str,
        attribute: Option<&str>,
    ) -> Result<SearchResults<impl Fn(&Hit) -> bool + 'a>> {
        self.check_open()?;
        let index = self
            .repo
            .inner
            .full_text
            .as_ref()
            .ok_or_else(|| Error::invalid_state("the full-text index is disabled"))?;
        Ok(index.search_documents(self.version, Some(query), attribute, move |hit: &Hit| {
            self.hit_is_current(hit)
        }))
    }

    fn hit_is_current(&self, hit: &Hit) -> bool {
        if let Some(state) = self.items.get(&hit.item) {
            if state.deleted || state.dirty.contains(&hit.attribute) {
                return false;
            }
        }
        if !self.is_live(hit.item) {
            return false;
        }
        matches!(
            self.repo.inner.items.last_change(hit.item, &hit.attribute, self.version),
            Ok(Some(v)) if v == hit.version
        )
    }

    // ========================================================================
    // Derived sets
    // ========================================================================

    fn notify(&mut self, id: ItemId, touch: Touch<'_>) -> Result<()> {
        if self.sets.is_empty() {
            return Ok(());
        }
        let schema = self.schema();
        let gone = BTreeMap::new();
        let facts = match self.items.get(&id) {
            Some(state) => ItemFacts::new(id, &state.kind, state.deleted, &state.values),
            None => ItemFacts::new(id, "", true, &gone),
        };
        let events = self.sets.item_changed(&facts, touch, &schema)?;
        self.sets
            .dispatch(&events, self.repo.inner.config.notification_warn_ms);
        Ok(())
    }

    fn attribute_changed(&mut self, id: ItemId, attribute: &str) -> Result<()> {
        let changed = [attribute.to_string()];
        self.notify(id, Touch::Attributes(&changed))?;
        self.sync_attribute_set(id, attribute)
    }

    fn sync_attribute_set(&mut self, id: ItemId, attribute: &str) -> Result<()> {
        if !self.sets.watches_attribute(id, attribute) {
            return Ok(());
        }
        let refs = self
            .items
            .get(&id)
            .filter(|s| !s.deleted)
            .and_then(|s| s.values.get(attribute))
            .map(Value::refs)
            .unwrap_or_default();
        for target in self.sets.update_refs(id, attribute, &refs) {
            if self.live_or_missing(target)? || self.items.contains_key(&target) {
                self.notify(target, Touch::Referenced)?;
            }
        }
        Ok(())
    }

    fn reload_sets(&mut self, id: ItemId) -> Result<()> {
        self.live_or_missing(id)?;
        self.notify(id, Touch::Reloaded)?;
        for attribute in self.sets.watched_attributes(id) {
            self.sync_attribute_set(id, &attribute)?;
        }
        Ok(())
    }

    /// Set of the live items of `kind`, and of its sub-kinds when `recursive`
    pub fn kind_set(&mut self, kind: &str, recursive: bool) -> Result<SetId> {
        self.check_open()?;
        let schema = self.schema();
        schema.kind(kind)?;
        let kinds: Vec<String> = if recursive {
            schema.subkinds(kind).into_iter().map(str::to_string).collect()
        } else {
            vec![kind.to_string()]
        };
        let mut candidates = BTreeSet::new();
        for k in &kinds {
            candidates.extend(self.repo.inner.items.items_of_kind(k, self.version)?);
        }
        candidates.extend(
            self.items
                .iter()
                .filter(|(_, s)| kinds.contains(&s.kind))
                .map(|(id, _)| *id),
        );
        let members: BTreeSet<ItemId> = candidates
            .into_iter()
            .filter(|id| self.is_live(*id))
            .collect();
        Ok(self.sets.register(
            SetSource::Kind {
                kind: kind.to_string(),
                recursive,
            },
            None,
            BTreeSet::new(),
            members,
        ))
    }

    /// Set of the live items referenced by `item.attribute`
    pub fn attribute_set(&mut self, item: ItemId, attribute: &str) -> Result<SetId> {
        self.check_open()?;
        self.attribute_def(item, attribute)?;
        let refs: BTreeSet<ItemId> = self
            .live(item)?
            .values
            .get(attribute)
            .map(Value::refs)
            .unwrap_or_default()
            .into_iter()
            .collect();
        let mut members = BTreeSet::new();
        for target in &refs {
            if self.live_or_missing(*target)? {
                members.insert(*target);
            }
        }
        Ok(self.sets.register(
            SetSource::Attribute {
                item,
                attribute: attribute.to_string(),
            },
            None,
            refs,
            members,
        ))
    }

    fn algebra_set(&mut self, source: SetSource) -> Result<SetId> {
        self.check_open()?;
        self.sets.check_sources(&source)?;
        let members = self.sets.algebra_members(&source)?;
        Ok(self.sets.register(source, None, BTreeSet::new(), members))
    }

    /// Members of any of `sources`
    pub fn union_set(&mut self, sources: &[SetId]) -> Result<SetId> {
        self.algebra_set(SetSource::Union(sources.to_vec()))
    }

    /// Members of every one of `sources`
    pub fn intersection_set(&mut self, sources: &[SetId]) -> Result<SetId> {
        self.algebra_set(SetSource::Intersection(sources.to_vec()))
    }

    /// Members of `first` absent from all of `rest`
    pub fn difference_set(&mut self, first: SetId, rest: &[SetId]) -> Result<SetId> {
        self.algebra_set(SetSource::Difference(first, rest.to_vec()))
    }

    /// Members of `source` accepted by `predicate`
    ///
    /// The predicate is re-run for an existing member only when one of
    /// `attributes` changes.
    pub fn filter_set<P>(&mut self, source: SetId, attributes: &[&str], predicate: P) -> Result<SetId>
    where
        P: Fn(&ItemFacts<'_>) -> bool + Send + 'static,
    {
        self.check_open()?;
        let definition = SetSource::Filter {
            source,
            attributes: attributes.iter().map(|a| a.to_string()).collect(),
        };
        self.sets.check_sources(&definition)?;
        let mut members = BTreeSet::new();
        for id in self.sets.members(source)? {
            if !self.live_or_missing(id)? {
                continue;
            }
            if let Some(state) = self.items.get(&id) {
                if predicate(&ItemFacts::new(id, &state.kind, state.deleted, &state.values)) {
                    members.insert(id);
                }
            }
        }
        Ok(self
            .sets
            .register(definition, Some(Box::new(predicate)), BTreeSet::new(), members))
    }

    /// True if `item` is a member of `set`
    pub fn set_contains(&self, set: SetId, item: ItemId) -> Result<bool> {
        self.sets.contains(set, item)
    }

    /// Number of members of `set`
    pub fn set_len(&self, set: SetId) -> Result<usize> {
        self.sets.len(set)
    }

    /// Members of `set`; positional order once indexed
    pub fn set_items(&self, set: SetId) -> Result<Vec<ItemId>> {
        self.sets.members(set)
    }

    /// What `set` is computed from
    pub fn set_source(&self, set: SetId) -> Result<SetSource> {
        self.sets.source(set).cloned()
    }

    /// Install a positional index over `set`
    pub fn add_index(&mut self, set: SetId) -> Result<()> {
        self.sets.add_index(set)
    }

    /// Member at `position`; negative positions count from the end
    pub fn set_at(&self, set: SetId, position: i64) -> Result<ItemId> {
        self.sets.at(set, position)
    }

    /// Position of `item` within `set`
    pub fn set_position(&self, set: SetId, item: ItemId) -> Result<usize> {
        self.sets.position(set, item)
    }

    /// Notification counters of `set`
    pub fn set_stats(&self, set: SetId) -> Result<SetStats> {
        self.sets.stats(set)
    }

    /// Call `listener` for every event of `set`
    pub fn watch<F>(&mut self, set: SetId, listener: F) -> Result<WatchId>
    where
        F: FnMut(&SetEvent) + Send + 'static,
    {
        self.sets.watch(set, Box::new(listener))
    }

    /// Remove a listener; false if it was not registered
    pub fn unwatch(&mut self, watch: WatchId) -> bool {
        self.sets.unwatch(watch)
    }
}
