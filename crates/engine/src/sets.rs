//! Live derived collections
//!
//! A view keeps a registry of sets computed from its items:
//! - `Kind`: items of a kind, optionally including sub-kinds
//! - `Attribute`: the live items referenced by one `(item, attribute)` pair
//! - `Union`, `Intersection`, `Difference`: N-ary set algebra over other sets
//! - `Filter`: members of a source set accepted by a predicate
//!
//! Sets only ever reference sets created before them, so the registry is
//! already in topological order. When one item changes, every set
//! re-evaluates that single item against its direct sources in id order and
//! emits `Add`/`Remove`/`Changed` for its own delta. No set ever rescans a
//! source after its initial population. An item reachable through several
//! paths is evaluated once per set, so diamonds never double-count.

use cairn_core::{Error, ItemId, Result, Schema, Value};
use cairn_index::{FxNodeMap, SkipList};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Instant;
use tracing::{debug, warn};

/// Handle to a set registered in a view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SetId(u32);

impl SetId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "set#{}", self.0)
    }
}

/// Handle to a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

/// Kind of membership notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    /// Item entered the set
    Add,
    /// Item left the set
    Remove,
    /// A member's attributes changed without a membership change
    Changed,
}

/// Notification delivered to set listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetEvent {
    /// What happened
    pub op: SetOp,
    /// Item concerned
    pub item: ItemId,
    /// Set that changed
    pub set: SetId,
}

/// Notification counters for one set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetStats {
    /// `Add` notifications emitted
    pub adds: u64,
    /// `Remove` notifications emitted
    pub removes: u64,
    /// `Changed` notifications emitted
    pub changes: u64,
    /// Full populations from sources (only at creation)
    pub rebuilds: u64,
}

/// What a set is computed from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetSource {
    /// Items of `kind`, plus items of its sub-kinds when `recursive`
    Kind {
        /// Kind name
        kind: String,
        /// Include sub-kinds
        recursive: bool,
    },
    /// Live items referenced by an attribute value
    Attribute {
        /// Owning item
        item: ItemId,
        /// Attribute holding the references
        attribute: String,
    },
    /// Members of any source
    Union(Vec<SetId>),
    /// Members of every source
    Intersection(Vec<SetId>),
    /// Members of the first set absent from all the others
    Difference(SetId, Vec<SetId>),
    /// Members of `source` accepted by the set's predicate
    Filter {
        /// Set being filtered
        source: SetId,
        /// Attributes the predicate reads
        attributes: Vec<String>,
    },
}

impl SetSource {
    fn sources(&self) -> Vec<SetId> {
        match self {
            SetSource::Kind { .. } | SetSource::Attribute { .. } => Vec::new(),
            SetSource::Union(s) | SetSource::Intersection(s) => s.clone(),
            SetSource::Difference(first, rest) => {
                let mut all = vec![*first];
                all.extend(rest.iter().copied());
                all
            }
            SetSource::Filter { source, .. } => vec![*source],
        }
    }
}

/// Read-only view of one item handed to filter predicates
#[derive(Debug, Clone, Copy)]
pub struct ItemFacts<'a> {
    /// Item id
    pub id: ItemId,
    /// Kind name
    pub kind: &'a str,
    /// Deleted in the view
    pub deleted: bool,
    values: &'a BTreeMap<String, Value>,
}

impl<'a> ItemFacts<'a> {
    /// Facts about an item with the given values
    pub fn new(id: ItemId, kind: &'a str, deleted: bool, values: &'a BTreeMap<String, Value>) -> Self {
        Self {
            id,
            kind,
            deleted,
            values,
        }
    }

    /// Stored value of `attribute`
    pub fn get(&self, attribute: &str) -> Option<&'a Value> {
        self.values.get(attribute)
    }
}

/// Filter predicate
pub type Predicate = Box<dyn Fn(&ItemFacts<'_>) -> bool + Send>;

/// Listener callback
pub type Listener = Box<dyn FnMut(&SetEvent) + Send>;

/// Why an item is being re-evaluated
#[derive(Debug, Clone, Copy)]
pub(crate) enum Touch<'a> {
    /// Item created in this view
    Created,
    /// Item deleted in this view
    Deleted,
    /// Attributes changed in this view
    Attributes(&'a [String]),
    /// Item reloaded after other views committed changes
    Reloaded,
    /// Item gained or lost a referencing attribute set
    Referenced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    None,
    Add,
    Remove,
    Changed,
}

struct PositionIndex {
    list: SkipList<ItemId>,
    nodes: FxNodeMap<ItemId>,
}

struct SetNode {
    source: SetSource,
    predicate: Option<Predicate>,
    refs: BTreeSet<ItemId>,
    members: BTreeSet<ItemId>,
    index: Option<PositionIndex>,
    stats: SetStats,
}

/// Sets registered in one view
#[derive(Default)]
pub(crate) struct SetRegistry {
    nodes: Vec<SetNode>,
    listeners: Vec<(WatchId, SetId, Listener)>,
    next_watch: u64,
}

impl fmt::Debug for SetRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetRegistry")
            .field("sets", &self.nodes.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl SetRegistry {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn node(&self, set: SetId) -> Result<&SetNode> {
        self.nodes
            .get(set.index())
            .ok_or_else(|| Error::KeyNotFound(set.to_string()))
    }

    fn node_mut(&mut self, set: SetId) -> Result<&mut SetNode> {
        self.nodes
            .get_mut(set.index())
            .ok_or_else(|| Error::KeyNotFound(set.to_string()))
    }

    /// Check that every source of `source` is registered
    pub fn check_sources(&self, source: &SetSource) -> Result<()> {
        for s in source.sources() {
            self.node(s)?;
        }
        if let SetSource::Union(s) | SetSource::Intersection(s) = source {
            if s.is_empty() {
                return Err(Error::invalid_state("set algebra needs at least one source"));
            }
        }
        Ok(())
    }

    /// Members computed from registered sources, for algebra sets
    pub fn algebra_members(&self, source: &SetSource) -> Result<BTreeSet<ItemId>> {
        match source {
            SetSource::Union(sources) => {
                let mut out = BTreeSet::new();
                for s in sources {
                    out.extend(self.node(*s)?.members.iter().copied());
                }
                Ok(out)
            }
            SetSource::Intersection(sources) => {
                let (first, rest) = sources
                    .split_first()
                    .ok_or_else(|| Error::invalid_state("set algebra needs at least one source"))?;
                let mut out = self.node(*first)?.members.clone();
                for s in rest {
                    let other = &self.node(*s)?.members;
                    out.retain(|id| other.contains(id));
                }
                Ok(out)
            }
            SetSource::Difference(first, rest) => {
                let mut out = self.node(*first)?.members.clone();
                for s in rest {
                    let other = &self.node(*s)?.members;
                    out.retain(|id| !other.contains(id));
                }
                Ok(out)
            }
            _ => Err(Error::invalid_state("not a set algebra source")),
        }
    }

    /// Register a set with its initial membership
    pub fn register(
        &mut self,
        source: SetSource,
        predicate: Option<Predicate>,
        refs: BTreeSet<ItemId>,
        members: BTreeSet<ItemId>,
    ) -> SetId {
        let id = SetId(self.nodes.len() as u32);
        debug!(set = %id, members = members.len(), source = ?source, "Registered set");
        self.nodes.push(SetNode {
            source,
            predicate,
            refs,
            members,
            index: None,
            stats: SetStats {
                rebuilds: 1,
                ..Default::default()
            },
        });
        id
    }

    /// Members of `set`, index order when indexed
    pub fn members(&self, set: SetId) -> Result<Vec<ItemId>> {
        let node = self.node(set)?;
        match &node.index {
            Some(index) => index.list.keys(&index.nodes),
            None => Ok(node.members.iter().copied().collect()),
        }
    }

    pub fn contains(&self, set: SetId, item: ItemId) -> Result<bool> {
        Ok(self.node(set)?.members.contains(&item))
    }

    pub fn len(&self, set: SetId) -> Result<usize> {
        Ok(self.node(set)?.members.len())
    }

    pub fn stats(&self, set: SetId) -> Result<SetStats> {
        Ok(self.node(set)?.stats)
    }

    pub fn source(&self, set: SetId) -> Result<&SetSource> {
        Ok(&self.node(set)?.source)
    }

    /// Install a positional index over `set`
    pub fn add_index(&mut self, set: SetId) -> Result<()> {
        let node = self.node_mut(set)?;
        if node.index.is_some() {
            return Ok(());
        }
        let mut index = PositionIndex {
            list: SkipList::new(),
            nodes: FxNodeMap::default(),
        };
        let mut last: Option<ItemId> = None;
        for id in &node.members {
            index.list.insert(&mut index.nodes, *id, last.as_ref())?;
            last = Some(*id);
        }
        node.index = Some(index);
        Ok(())
    }

    /// Member at `position`; negative positions count from the end
    pub fn at(&self, set: SetId, position: i64) -> Result<ItemId> {
        let node = self.node(set)?;
        if let Some(index) = &node.index {
            return index.list.access(&index.nodes, position);
        }
        let len = node.members.len();
        let resolved = if position < 0 {
            len as i64 + position
        } else {
            position
        };
        if resolved < 0 || resolved >= len as i64 {
            return Err(Error::IndexOutOfRange {
                index: position,
                len,
            });
        }
        node.members
            .iter()
            .nth(resolved as usize)
            .copied()
            .ok_or_else(|| Error::corruption("set membership shorter than its length"))
    }

    /// Position of `item` in `set`
    pub fn position(&self, set: SetId, item: ItemId) -> Result<usize> {
        let node = self.node(set)?;
        if !node.members.contains(&item) {
            return Err(Error::KeyNotFound(item.to_string()));
        }
        if let Some(index) = &node.index {
            return index.list.position(&index.nodes, &item);
        }
        node.members
            .iter()
            .position(|id| *id == item)
            .ok_or_else(|| Error::KeyNotFound(item.to_string()))
    }

    /// Attribute sets watching `(item, attribute)`
    pub fn watches_attribute(&self, item: ItemId, attribute: &str) -> bool {
        self.nodes.iter().any(|n| {
            matches!(&n.source, SetSource::Attribute { item: i, attribute: a } if *i == item && a == attribute)
        })
    }

    /// Attributes of `item` watched by attribute sets
    pub fn watched_attributes(&self, item: ItemId) -> Vec<String> {
        let mut out: Vec<String> = self
            .nodes
            .iter()
            .filter_map(|n| match &n.source {
                SetSource::Attribute { item: i, attribute } if *i == item => Some(attribute.clone()),
                _ => None,
            })
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Replace the references seen by attribute sets over `(item, attribute)`
    ///
    /// Returns the items whose membership may have changed.
    pub fn update_refs(&mut self, item: ItemId, attribute: &str, refs: &[ItemId]) -> BTreeSet<ItemId> {
        let refs: BTreeSet<ItemId> = refs.iter().copied().collect();
        let mut touched = BTreeSet::new();
        for node in &mut self.nodes {
            if let SetSource::Attribute { item: i, attribute: a } = &node.source {
                if *i == item && a == attribute {
                    touched.extend(node.refs.symmetric_difference(&refs).copied());
                    node.refs = refs.clone();
                }
            }
        }
        touched
    }

    /// Re-evaluate one item in every set, in dependency order
    pub fn item_changed(
        &mut self,
        facts: &ItemFacts<'_>,
        touch: Touch<'_>,
        schema: &Schema,
    ) -> Result<Vec<SetEvent>> {
        let item = facts.id;
        let mut outcomes = Vec::with_capacity(self.nodes.len());
        let mut events = Vec::new();

        for i in 0..self.nodes.len() {
            let node = &self.nodes[i];
            let was = node.members.contains(&item);
            let now = if facts.deleted {
                false
            } else {
                match &node.source {
                    SetSource::Kind { kind, recursive } => {
                        facts.kind == kind || (*recursive && schema.is_subkind(facts.kind, kind))
                    }
                    SetSource::Attribute { .. } => node.refs.contains(&item),
                    SetSource::Union(sources) => sources
                        .iter()
                        .any(|s| self.nodes[s.index()].members.contains(&item)),
                    SetSource::Intersection(sources) => sources
                        .iter()
                        .all(|s| self.nodes[s.index()].members.contains(&item)),
                    SetSource::Difference(first, rest) => {
                        self.nodes[first.index()].members.contains(&item)
                            && !rest
                                .iter()
                                .any(|s| self.nodes[s.index()].members.contains(&item))
                    }
                    SetSource::Filter { source, attributes } => {
                        let in_source = self.nodes[source.index()].members.contains(&item);
                        let source_added = outcomes.get(source.index()) == Some(&Outcome::Add);
                        let reevaluate = !was
                            || source_added
                            || match touch {
                                Touch::Created | Touch::Reloaded => true,
                                Touch::Attributes(changed) => {
                                    changed.iter().any(|c| attributes.contains(c))
                                }
                                Touch::Deleted | Touch::Referenced => false,
                            };
                        in_source
                            && if reevaluate {
                                node.predicate.as_ref().map_or(true, |p| p(facts))
                            } else {
                                was
                            }
                    }
                }
            };

            let outcome = match (was, now) {
                (false, true) => Outcome::Add,
                (true, false) => Outcome::Remove,
                (true, true) => match touch {
                    Touch::Attributes(changed) if !changed.is_empty() => Outcome::Changed,
                    Touch::Reloaded => Outcome::Changed,
                    _ => Outcome::None,
                },
                (false, false) => Outcome::None,
            };
            outcomes.push(outcome);

            let set = SetId(i as u32);
            let node = &mut self.nodes[i];
            let op = match outcome {
                Outcome::None => continue,
                Outcome::Add => {
                    node.members.insert(item);
                    if let Some(index) = &mut node.index {
                        let last = index.list.last(0);
                        index.list.insert(&mut index.nodes, item, last.as_ref())?;
                    }
                    node.stats.adds += 1;
                    SetOp::Add
                }
                Outcome::Remove => {
                    node.members.remove(&item);
                    if let Some(index) = &mut node.index {
                        index.list.remove(&mut index.nodes, &item)?;
                    }
                    node.stats.removes += 1;
                    SetOp::Remove
                }
                Outcome::Changed => {
                    node.stats.changes += 1;
                    SetOp::Changed
                }
            };
            events.push(SetEvent { op, item, set });
        }
        Ok(events)
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    pub fn watch(&mut self, set: SetId, listener: Listener) -> Result<WatchId> {
        self.node(set)?;
        let id = WatchId(self.next_watch);
        self.next_watch += 1;
        self.listeners.push((id, set, listener));
        Ok(id)
    }

    pub fn unwatch(&mut self, watch: WatchId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(id, _, _)| *id != watch);
        self.listeners.len() != before
    }

    /// Deliver events to listeners
    pub fn dispatch(&mut self, events: &[SetEvent], warn_ms: u64) {
        if events.is_empty() || self.listeners.is_empty() {
            return;
        }
        let start = Instant::now();
        for event in events {
            for (_, set, listener) in self.listeners.iter_mut() {
                if *set == event.set {
                    listener(event);
                }
            }
        }
        let elapsed = start.elapsed().as_millis() as u64;
        if elapsed > warn_ms {
            warn!(
                events = events.len(),
                elapsed_ms = elapsed,
                "Slow set notification dispatch"
            );
        }
    }
}
