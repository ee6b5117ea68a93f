//! Ordered positional indexes for cairn
//!
//! The skip list here keeps its nodes in a map owned by the caller, so the
//! same structure can index an in-memory set or a persisted collection.
//! Only the head and tail sentinels and the current level live in the
//! [`SkipList`] value itself.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod skiplist;

pub use skiplist::{FxNodeMap, Node, NodeMap, Point, SkipList, MAX_LEVEL, P};
