//! Doubly linked skip list with positional access
//!
//! Pugh's skip list, extended so that every forward link also records how
//! many base-level steps it spans. Positions are never stored: `position`
//! climbs backwards summing distances and `access` descends from the head,
//! both in expected O(log n).
//!
//! Ranks used internally are 1-based: the head sentinel has rank 0, the
//! element at position `p` has rank `p + 1` and the tail has rank `n + 1`.
//!
//! # Example
//!
//! ```
//! use cairn_index::{FxNodeMap, SkipList};
//!
//! let mut map = FxNodeMap::default();
//! let mut list = SkipList::with_seed(7);
//! list.insert(&mut map, "b", None).unwrap();
//! list.insert(&mut map, "a", None).unwrap();
//! list.insert(&mut map, "c", Some(&"b")).unwrap();
//!
//! assert_eq!(list.keys(&map).unwrap(), vec!["a", "b", "c"]);
//! assert_eq!(list.position(&map, &"c").unwrap(), 2);
//! assert_eq!(list.access(&map, -1).unwrap(), "c");
//! ```

use cairn_core::{Error, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{BuildHasher, Hash};

/// Promotion probability
pub const P: f64 = 0.25;

/// Maximum number of levels
pub const MAX_LEVEL: usize = 16;

/// One level of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Point<K> {
    /// Previous key at this level (`None` is the head)
    pub prev: Option<K>,
    /// Next key at this level (`None` is the tail)
    pub next: Option<K>,
    /// Base-level steps from this node to `next`
    pub dist: usize,
}

impl<K> Point<K> {
    fn detached(dist: usize) -> Self {
        Self {
            prev: None,
            next: None,
            dist,
        }
    }
}

/// Per-key skip list node, stored in the caller's map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node<K> {
    levels: SmallVec<[Point<K>; 4]>,
}

impl<K> Node<K> {
    /// Number of levels
    pub fn height(&self) -> usize {
        self.levels.len()
    }

    /// Level `level` (0 is the base list)
    pub fn point(&self, level: usize) -> Option<&Point<K>> {
        self.levels.get(level)
    }
}

/// Storage for skip list nodes
pub trait NodeMap<K> {
    /// Node of `key`
    fn node(&self, key: &K) -> Option<&Node<K>>;
    /// Mutable node of `key`
    fn node_mut(&mut self, key: &K) -> Option<&mut Node<K>>;
    /// Store the node of `key`
    fn insert_node(&mut self, key: K, node: Node<K>);
    /// Remove the node of `key`
    fn remove_node(&mut self, key: &K) -> Option<Node<K>>;
    /// Number of nodes
    fn node_count(&self) -> usize;
}

impl<K: Eq + Hash, S: BuildHasher> NodeMap<K> for HashMap<K, Node<K>, S> {
    fn node(&self, key: &K) -> Option<&Node<K>> {
        self.get(key)
    }

    fn node_mut(&mut self, key: &K) -> Option<&mut Node<K>> {
        self.get_mut(key)
    }

    fn insert_node(&mut self, key: K, node: Node<K>) {
        self.insert(key, node);
    }

    fn remove_node(&mut self, key: &K) -> Option<Node<K>> {
        self.remove(key)
    }

    fn node_count(&self) -> usize {
        self.len()
    }
}

impl<K: Ord> NodeMap<K> for BTreeMap<K, Node<K>> {
    fn node(&self, key: &K) -> Option<&Node<K>> {
        self.get(key)
    }

    fn node_mut(&mut self, key: &K) -> Option<&mut Node<K>> {
        self.get_mut(key)
    }

    fn insert_node(&mut self, key: K, node: Node<K>) {
        self.insert(key, node);
    }

    fn remove_node(&mut self, key: &K) -> Option<Node<K>> {
        self.remove(key)
    }

    fn node_count(&self) -> usize {
        self.len()
    }
}

/// Node map keyed with the Fx hasher
pub type FxNodeMap<K> = FxHashMap<K, Node<K>>;

fn not_found<K: fmt::Debug>(key: &K) -> Error {
    Error::KeyNotFound(format!("{:?}", key))
}

fn dangling<K: fmt::Debug>(key: &K) -> Error {
    Error::corruption(format!("skip list links to missing node {:?}", key))
}

fn missing_level<K: fmt::Debug>(key: Option<&K>, level: usize) -> Error {
    match key {
        Some(k) => Error::corruption(format!("node {:?} has no level {}", k, level)),
        None => Error::corruption(format!("sentinel has no level {}", level)),
    }
}

/// Forward link of `at` (or the head) at `level`
fn forward_mut<'a, K: fmt::Debug, M: NodeMap<K>>(
    head: &'a mut Node<K>,
    map: &'a mut M,
    at: Option<&K>,
    level: usize,
) -> Result<&'a mut Point<K>> {
    let node = match at {
        None => head,
        Some(k) => map.node_mut(k).ok_or_else(|| dangling(k))?,
    };
    node.levels
        .get_mut(level)
        .ok_or_else(|| missing_level(at, level))
}

/// Backward link of `at` (or the tail) at `level`
fn backward_mut<'a, K: fmt::Debug, M: NodeMap<K>>(
    tail: &'a mut Node<K>,
    map: &'a mut M,
    at: Option<&K>,
    level: usize,
) -> Result<&'a mut Point<K>> {
    forward_mut(tail, map, at, level)
}

/// Positional skip list over an external node map
///
/// The map passed to every call must hold exactly the nodes of this list.
#[derive(Debug, Clone)]
pub struct SkipList<K> {
    head: Node<K>,
    tail: Node<K>,
    level: usize,
    rng: StdRng,
}

impl<K: Clone + Eq + fmt::Debug> Default for SkipList<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Eq + fmt::Debug> SkipList<K> {
    /// Empty skip list with an entropy-seeded level generator
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Empty skip list with a deterministic level generator
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        let mut head = Node {
            levels: SmallVec::new(),
        };
        head.levels.push(Point::detached(1));
        let mut tail = Node {
            levels: SmallVec::new(),
        };
        tail.levels.push(Point::detached(0));
        Self {
            head,
            tail,
            level: 1,
            rng,
        }
    }

    /// Current number of levels
    pub fn level(&self) -> usize {
        self.level
    }

    fn random_level(&mut self) -> usize {
        let mut level = 1;
        while level < MAX_LEVEL && self.rng.gen::<f64>() < P {
            level += 1;
        }
        level
    }

    fn point<'a, M: NodeMap<K>>(
        &'a self,
        map: &'a M,
        at: Option<&K>,
        level: usize,
    ) -> Result<&'a Point<K>> {
        let node = match at {
            None => &self.head,
            Some(k) => map.node(k).ok_or_else(|| dangling(k))?,
        };
        node.levels
            .get(level)
            .ok_or_else(|| missing_level(at, level))
    }

    // ===== Mutation =====

    /// Insert `key` after `after` (`None` inserts first)
    ///
    /// A key already in the list is moved instead.
    pub fn insert<M: NodeMap<K>>(&mut self, map: &mut M, key: K, after: Option<&K>) -> Result<()> {
        if map.node(&key).is_some() {
            return self.move_key(map, &key, after);
        }
        if let Some(a) = after {
            if map.node(a).is_none() {
                return Err(not_found(a));
            }
        }
        let height = self.random_level();
        self.place(map, key, after, height)
    }

    /// Move `key` to just after `after` (`None` moves it first)
    ///
    /// A key not yet in the list is inserted instead.
    ///
    /// # Errors
    ///
    /// `Error::InvalidMove` if `after` is `key` itself.
    pub fn move_key<M: NodeMap<K>>(&mut self, map: &mut M, key: &K, after: Option<&K>) -> Result<()> {
        if after == Some(key) {
            return Err(Error::InvalidMove(format!("{:?} after itself", key)));
        }
        if map.node(key).is_none() {
            return self.insert(map, key.clone(), after);
        }
        if let Some(a) = after {
            if map.node(a).is_none() {
                return Err(not_found(a));
            }
        }
        let height = self.unlink(map, key)?;
        self.place(map, key.clone(), after, height)
    }

    /// Remove `key`
    pub fn remove<M: NodeMap<K>>(&mut self, map: &mut M, key: &K) -> Result<()> {
        self.unlink(map, key).map(|_| ())
    }

    fn place<M: NodeMap<K>>(
        &mut self,
        map: &mut M,
        key: K,
        after: Option<&K>,
        height: usize,
    ) -> Result<()> {
        let target = match after {
            None => 1,
            Some(a) => self.position(map, a)? + 2,
        };

        let count = map.node_count();
        while self.level < height {
            self.head.levels.push(Point::detached(count + 1));
            self.tail.levels.push(Point::detached(0));
            self.level += 1;
        }

        // Last node before the target rank at every level, with its rank
        let mut update: Vec<Option<K>> = vec![None; self.level];
        let mut rank = vec![0usize; self.level];
        let mut cur: Option<K> = None;
        let mut cur_rank = 0;
        for i in (0..self.level).rev() {
            loop {
                let p = self.point(map, cur.as_ref(), i)?;
                let step = match &p.next {
                    Some(next) if cur_rank + p.dist < target => Some((next.clone(), p.dist)),
                    _ => None,
                };
                match step {
                    Some((next, dist)) => {
                        cur_rank += dist;
                        cur = Some(next);
                    }
                    None => break,
                }
            }
            update[i] = cur.clone();
            rank[i] = cur_rank;
        }

        let mut node = Node {
            levels: SmallVec::with_capacity(height),
        };
        for i in 0..height {
            let before = forward_mut(&mut self.head, map, update[i].as_ref(), i)?;
            let next = before.next.replace(key.clone());
            let spanned = before.dist;
            before.dist = target - rank[i];
            node.levels.push(Point {
                prev: update[i].clone(),
                next: next.clone(),
                dist: spanned + rank[i] + 1 - target,
            });
            backward_mut(&mut self.tail, map, next.as_ref(), i)?.prev = Some(key.clone());
        }
        for i in height..self.level {
            forward_mut(&mut self.head, map, update[i].as_ref(), i)?.dist += 1;
        }
        map.insert_node(key, node);
        Ok(())
    }

    /// Detach `key` and return its height
    fn unlink<M: NodeMap<K>>(&mut self, map: &mut M, key: &K) -> Result<usize> {
        let node = map.remove_node(key).ok_or_else(|| not_found(key))?;
        let height = node.height();

        for (i, point) in node.levels.iter().enumerate() {
            let before = forward_mut(&mut self.head, map, point.prev.as_ref(), i)?;
            before.next = point.next.clone();
            before.dist = before.dist + point.dist - 1;
            backward_mut(&mut self.tail, map, point.next.as_ref(), i)?.prev = point.prev.clone();
        }

        // Links above the node's height span it; each shrinks by one
        let mut cur = node.levels.last().and_then(|p| p.prev.clone());
        for i in height..self.level {
            loop {
                let Some(c) = cur.as_ref() else { break };
                let n = map.node(c).ok_or_else(|| dangling(c))?;
                if n.height() > i {
                    break;
                }
                let up = n.levels.last().and_then(|p| p.prev.clone());
                cur = up;
            }
            forward_mut(&mut self.head, map, cur.as_ref(), i)?.dist -= 1;
        }
        Ok(height)
    }

    // ===== Queries =====

    /// Zero-based position of `key`
    pub fn position<M: NodeMap<K>>(&self, map: &M, key: &K) -> Result<usize> {
        let mut node = map.node(key).ok_or_else(|| not_found(key))?;
        let mut rank = 0usize;
        loop {
            let top = node
                .height()
                .checked_sub(1)
                .ok_or_else(|| Error::corruption("skip list node has no levels"))?;
            let prev = &node.levels[top].prev;
            match prev {
                None => {
                    rank += self.point(map, None, top)?.dist;
                    return rank
                        .checked_sub(1)
                        .ok_or_else(|| Error::corruption("zero distance from head"));
                }
                Some(p) => {
                    let prev_node = map.node(p).ok_or_else(|| dangling(p))?;
                    rank += prev_node
                        .levels
                        .get(top)
                        .ok_or_else(|| missing_level(Some(p), top))?
                        .dist;
                    node = prev_node;
                }
            }
        }
    }

    /// Key at `index`; negative indices count from the end
    ///
    /// # Errors
    ///
    /// `Error::IndexOutOfRange` unless `-len <= index < len`.
    pub fn access<M: NodeMap<K>>(&self, map: &M, index: i64) -> Result<K> {
        let len = map.node_count();
        let resolved = if index < 0 { len as i64 + index } else { index };
        if resolved < 0 || resolved >= len as i64 {
            return Err(Error::IndexOutOfRange { index, len });
        }
        let target = resolved as usize + 1;

        let mut cur: Option<K> = None;
        let mut cur_rank = 0;
        for i in (0..self.level).rev() {
            loop {
                let p = self.point(map, cur.as_ref(), i)?;
                let step = match &p.next {
                    Some(next) if cur_rank + p.dist <= target => Some((next.clone(), p.dist)),
                    _ => None,
                };
                match step {
                    Some((next, dist)) => {
                        cur_rank += dist;
                        cur = Some(next);
                    }
                    None => break,
                }
            }
            if cur_rank == target {
                return cur.ok_or_else(|| Error::corruption("position resolved to the head"));
            }
        }
        Err(Error::corruption(format!(
            "skip list distances never reach position {}",
            resolved
        )))
    }

    /// First key linked at `level`
    pub fn first(&self, level: usize) -> Option<K> {
        self.head.levels.get(level).and_then(|p| p.next.clone())
    }

    /// Last key linked at `level`
    pub fn last(&self, level: usize) -> Option<K> {
        self.tail.levels.get(level).and_then(|p| p.prev.clone())
    }

    /// Key after `key` at `level`; `None` at the end or above the node's height
    pub fn next<M: NodeMap<K>>(&self, map: &M, key: &K, level: usize) -> Result<Option<K>> {
        let node = map.node(key).ok_or_else(|| not_found(key))?;
        Ok(node.point(level).and_then(|p| p.next.clone()))
    }

    /// Key before `key` at `level`; `None` at the start or above the node's height
    pub fn previous<M: NodeMap<K>>(&self, map: &M, key: &K, level: usize) -> Result<Option<K>> {
        let node = map.node(key).ok_or_else(|| not_found(key))?;
        Ok(node.point(level).and_then(|p| p.prev.clone()))
    }

    /// All keys in order
    pub fn keys<M: NodeMap<K>>(&self, map: &M) -> Result<Vec<K>> {
        let mut keys = Vec::with_capacity(map.node_count());
        let mut cur = self.first(0);
        while let Some(key) = cur {
            let node = map.node(&key).ok_or_else(|| dangling(&key))?;
            cur = node.point(0).and_then(|p| p.next.clone());
            keys.push(key);
        }
        Ok(keys)
    }

    /// Check every link and distance against the base list
    ///
    /// # Errors
    ///
    /// `Error::Corruption` describing the first inconsistency found.
    pub fn validate<M: NodeMap<K>>(&self, map: &M) -> Result<()> {
        let keys = self.keys(map)?;
        if keys.len() != map.node_count() {
            return Err(Error::corruption(format!(
                "base list has {} keys but map holds {}",
                keys.len(),
                map.node_count()
            )));
        }
        let rank_of = |key: &Option<K>| -> Result<usize> {
            match key {
                None => Ok(0),
                Some(k) => keys
                    .iter()
                    .position(|x| x == k)
                    .map(|p| p + 1)
                    .ok_or_else(|| dangling(k)),
            }
        };

        for level in 0..self.level {
            let mut cur: Option<K> = None;
            let mut total = 0;
            loop {
                let p = self.point(map, cur.as_ref(), level)?;
                total += p.dist;
                match &p.next {
                    None => break,
                    Some(next) => {
                        let back = &self.point(map, Some(next), level)?.prev;
                        if back != &cur {
                            return Err(Error::corruption(format!(
                                "level {}: {:?} points back to {:?}, expected {:?}",
                                level, next, back, cur
                            )));
                        }
                        let next_rank = Some(next.clone());
                        if rank_of(&next_rank)? != rank_of(&cur)? + p.dist {
                            return Err(Error::corruption(format!(
                                "level {}: wrong distance to {:?}",
                                level, next
                            )));
                        }
                        cur = next_rank;
                    }
                }
            }
            if total != keys.len() + 1 {
                return Err(Error::corruption(format!(
                    "level {}: distances sum to {}, expected {}",
                    level,
                    total,
                    keys.len() + 1
                )));
            }
            if self.tail.levels[level].prev != cur {
                return Err(Error::corruption(format!(
                    "level {}: tail points back to {:?}, expected {:?}",
                    level, self.tail.levels[level].prev, cur
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(keys: &[u32]) -> (SkipList<u32>, FxNodeMap<u32>) {
        let mut map = FxNodeMap::default();
        let mut list = SkipList::with_seed(1);
        let mut after = None;
        for k in keys {
            list.insert(&mut map, *k, after.as_ref()).unwrap();
            after = Some(*k);
        }
        (list, map)
    }

    mod ordering {
        use super::*;

        #[test]
        fn test_insert_first_and_after() {
            let mut map = FxNodeMap::default();
            let mut list = SkipList::with_seed(3);
            list.insert(&mut map, 2, None).unwrap();
            list.insert(&mut map, 1, None).unwrap();
            list.insert(&mut map, 3, Some(&2)).unwrap();
            list.insert(&mut map, 4, Some(&1)).unwrap();
            assert_eq!(list.keys(&map).unwrap(), vec![1, 4, 2, 3]);
            list.validate(&map).unwrap();
        }

        #[test]
        fn test_insert_after_missing_key_fails() {
            let (mut list, mut map) = build(&[1]);
            assert!(matches!(
                list.insert(&mut map, 2, Some(&9)),
                Err(Error::KeyNotFound(_))
            ));
            assert_eq!(map.len(), 1);
        }

        #[test]
        fn test_insert_existing_key_moves_it() {
            let (mut list, mut map) = build(&[1, 2, 3]);
            list.insert(&mut map, 1, Some(&3)).unwrap();
            assert_eq!(list.keys(&map).unwrap(), vec![2, 3, 1]);
            list.validate(&map).unwrap();
        }

        #[test]
        fn test_move_after_itself_fails() {
            let (mut list, mut map) = build(&[1, 2]);
            assert!(matches!(
                list.move_key(&mut map, &1, Some(&1)),
                Err(Error::InvalidMove(_))
            ));
            assert_eq!(list.keys(&map).unwrap(), vec![1, 2]);
        }

        #[test]
        fn test_move_to_front() {
            let (mut list, mut map) = build(&[1, 2, 3, 4]);
            list.move_key(&mut map, &4, None).unwrap();
            assert_eq!(list.keys(&map).unwrap(), vec![4, 1, 2, 3]);
            list.validate(&map).unwrap();
        }

        #[test]
        fn test_navigation() {
            let (list, map) = build(&[10, 20, 30]);
            assert_eq!(list.first(0), Some(10));
            assert_eq!(list.last(0), Some(30));
            assert_eq!(list.next(&map, &10, 0).unwrap(), Some(20));
            assert_eq!(list.previous(&map, &10, 0).unwrap(), None);
            assert_eq!(list.next(&map, &30, 0).unwrap(), None);
            assert!(list.next(&map, &99, 0).is_err());
            assert_eq!(list.first(MAX_LEVEL), None);
        }
    }

    mod removal {
        use super::*;

        #[test]
        fn test_remove_only_element_resets_sentinels() {
            let (mut list, mut map) = build(&[1]);
            list.remove(&mut map, &1).unwrap();
            assert!(map.is_empty());
            for level in 0..list.level() {
                assert_eq!(list.head.levels[level], Point::detached(1));
                assert_eq!(list.tail.levels[level].prev, None);
            }
            assert_eq!(list.first(0), None);
            assert_eq!(list.last(0), None);

            list.insert(&mut map, 5, None).unwrap();
            assert_eq!(list.access(&map, 0).unwrap(), 5);
            list.validate(&map).unwrap();
        }

        #[test]
        fn test_remove_missing_key() {
            let (mut list, mut map) = build(&[1]);
            assert!(matches!(list.remove(&mut map, &2), Err(Error::KeyNotFound(_))));
        }

        #[test]
        fn test_remove_middle_keeps_distances() {
            let keys: Vec<u32> = (0..200).collect();
            let (mut list, mut map) = build(&keys);
            for k in (0..200).step_by(3) {
                list.remove(&mut map, &k).unwrap();
            }
            list.validate(&map).unwrap();
            let remaining: Vec<u32> = (0..200).filter(|k| k % 3 != 0).collect();
            assert_eq!(list.keys(&map).unwrap(), remaining);
        }
    }

    mod positions {
        use super::*;

        #[test]
        fn test_access_negative_and_out_of_range() {
            let (list, map) = build(&[1, 2, 3]);
            assert_eq!(list.access(&map, -1).unwrap(), 3);
            assert_eq!(list.access(&map, -3).unwrap(), 1);
            assert!(matches!(
                list.access(&map, 3),
                Err(Error::IndexOutOfRange { index: 3, len: 3 })
            ));
            assert!(matches!(
                list.access(&map, -4),
                Err(Error::IndexOutOfRange { index: -4, len: 3 })
            ));
        }

        #[test]
        fn test_access_empty() {
            let map: FxNodeMap<u32> = FxNodeMap::default();
            let list = SkipList::with_seed(1);
            assert!(list.access(&map, 0).is_err());
        }

        #[test]
        fn test_position_matches_order() {
            let keys: Vec<u32> = (0..500).collect();
            let (list, map) = build(&keys);
            assert!(list.level() > 1);
            for (i, k) in keys.iter().enumerate() {
                assert_eq!(list.position(&map, k).unwrap(), i);
                assert_eq!(list.access(&map, i as i64).unwrap(), *k);
            }
        }

        #[test]
        fn test_btree_node_map() {
            let mut map: BTreeMap<String, Node<String>> = BTreeMap::new();
            let mut list = SkipList::with_seed(9);
            list.insert(&mut map, "z".to_string(), None).unwrap();
            list.insert(&mut map, "a".to_string(), Some(&"z".to_string())).unwrap();
            assert_eq!(list.position(&map, &"a".to_string()).unwrap(), 1);
        }

        #[test]
        fn test_dangling_link_is_corruption() {
            let (list, mut map) = build(&[1, 2, 3]);
            map.remove(&2);
            assert!(list.keys(&map).unwrap_err().is_fatal());
        }
    }
}
