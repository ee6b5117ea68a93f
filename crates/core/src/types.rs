//! Core identifier types
//!
//! This module defines the foundational identifiers:
//! - ItemId: identity of a persisted item (UUID v4)
//! - FileId: identity of a named file in the block file store
//! - Version: repository-wide commit counter

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Repository-wide commit version
///
/// Version 0 is the empty repository; every successful commit advances the
/// counter by exactly one.
pub type Version = u64;

/// Unique identifier for an item
///
/// Items refer to each other by id only, never by pointer, so reference
/// cycles (including inverse self-references) need no ownership tricks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(Uuid);

impl ItemId {
    /// The namespace root every top-level item is parented under
    pub const ROOT: ItemId = ItemId(Uuid::nil());

    /// Create a new random ItemId using UUID v4
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an ItemId from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parse an ItemId from a string representation
    ///
    /// Accepts standard UUID format (with or without hyphens).
    /// Returns None if the string is not a valid UUID.
    pub fn from_string(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Get the raw bytes of this ItemId
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// True for the namespace root
    pub fn is_root(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a file stored in the block file store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(Uuid);

impl FileId {
    /// Create a new random FileId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a FileId from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get the raw bytes of this FileId
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_id_unique() {
        let a = ItemId::new();
        let b = ItemId::new();
        assert_ne!(a, b);
        assert!(!a.is_root());
    }

    #[test]
    fn test_item_id_string_roundtrip() {
        let id = ItemId::new();
        let parsed = ItemId::from_string(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.as_bytes(), parsed.as_bytes());
    }

    #[test]
    fn test_item_id_rejects_garbage() {
        assert!(ItemId::from_string("not-a-uuid").is_none());
    }

    #[test]
    fn test_root() {
        assert!(ItemId::ROOT.is_root());
        assert_eq!(ItemId::from_bytes([0; 16]), ItemId::ROOT);
    }

    #[test]
    fn test_file_id_bytes() {
        let id = FileId::new();
        assert_eq!(FileId::from_bytes(*id.as_bytes()), id);
    }
}
