//! Attribute values
//!
//! `Value` is the closed tagged variant stored in every item attribute:
//! a scalar literal, a reference to another item, or one of the four
//! persistent collection proxies. Consumers match on it exhaustively.
//!
//! ## Equality
//!
//! `Value` uses IEEE-754 semantics for floats (`NaN != NaN`) and compares
//! collection proxies by content only; ownership and dirty state are ignored.

use crate::persistent::{
    prepare_value, Owner, PersistentDict, PersistentList, PersistentSet, PersistentTuple,
};
use crate::schema::CopyPolicy;
use crate::types::ItemId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scalar attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    /// Absent value
    Null,
    /// Boolean
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit float
    Float(f64),
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Point in time (UTC)
    Timestamp(DateTime<Utc>),
}

impl Literal {
    /// Type name used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Literal::Null => "null",
            Literal::Bool(_) => "bool",
            Literal::Int(_) => "int",
            Literal::Float(_) => "float",
            Literal::Text(_) => "text",
            Literal::Bytes(_) => "bytes",
            Literal::Timestamp(_) => "timestamp",
        }
    }
}

/// Attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Scalar literal
    Literal(Literal),
    /// Reference to another item, resolved lazily by the view
    Ref(ItemId),
    /// Ordered sequence
    Sequence(PersistentList),
    /// Keyed mapping
    Mapping(PersistentDict),
    /// Fixed-arity tuple
    Tuple(PersistentTuple),
    /// Unordered set
    Set(PersistentSet),
}

impl Default for Value {
    fn default() -> Self {
        Value::Literal(Literal::Null)
    }
}

impl Value {
    /// The null literal
    pub fn null() -> Self {
        Value::Literal(Literal::Null)
    }

    /// Build an unowned sequence
    pub fn sequence<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Value::Sequence(PersistentList::from_values(
            values.into_iter().map(Into::into).collect(),
        ))
    }

    /// Build an unowned unordered set (duplicates are dropped)
    pub fn set<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Value::Set(PersistentSet::from_values(
            values.into_iter().map(Into::into).collect(),
        ))
    }

    /// Build an unowned tuple
    pub fn tuple<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Value::Tuple(PersistentTuple::from_values(
            values.into_iter().map(Into::into).collect(),
        ))
    }

    /// Build an unowned mapping
    pub fn mapping<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Value::Mapping(PersistentDict::from_entries(
            entries.into_iter().map(|(k, v)| (k.into(), v.into())),
        ))
    }

    /// True for the null literal
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Literal(Literal::Null))
    }

    /// True for the four collection variants
    pub fn is_collection(&self) -> bool {
        matches!(
            self,
            Value::Sequence(_) | Value::Mapping(_) | Value::Tuple(_) | Value::Set(_)
        )
    }

    /// Type name used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Literal(l) => l.type_name(),
            Value::Ref(_) => "ref",
            Value::Sequence(_) => "sequence",
            Value::Mapping(_) => "mapping",
            Value::Tuple(_) => "tuple",
            Value::Set(_) => "set",
        }
    }

    /// Text content, if this is a text literal
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Literal(Literal::Text(s)) => Some(s),
            _ => None,
        }
    }

    /// Integer content, if this is an int literal
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Literal(Literal::Int(i)) => Some(*i),
            _ => None,
        }
    }

    /// Boolean content, if this is a bool literal
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Literal(Literal::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Referenced item, if this is a reference
    pub fn as_ref_id(&self) -> Option<ItemId> {
        match self {
            Value::Ref(id) => Some(*id),
            _ => None,
        }
    }

    /// Borrow as a sequence
    pub fn as_list(&self) -> Option<&PersistentList> {
        match self {
            Value::Sequence(l) => Some(l),
            _ => None,
        }
    }

    /// Mutably borrow as a sequence
    pub fn as_list_mut(&mut self) -> Option<&mut PersistentList> {
        match self {
            Value::Sequence(l) => Some(l),
            _ => None,
        }
    }

    /// Borrow as a mapping
    pub fn as_dict(&self) -> Option<&PersistentDict> {
        match self {
            Value::Mapping(d) => Some(d),
            _ => None,
        }
    }

    /// Mutably borrow as a mapping
    pub fn as_dict_mut(&mut self) -> Option<&mut PersistentDict> {
        match self {
            Value::Mapping(d) => Some(d),
            _ => None,
        }
    }

    /// Borrow as a tuple
    pub fn as_tuple(&self) -> Option<&PersistentTuple> {
        match self {
            Value::Tuple(t) => Some(t),
            _ => None,
        }
    }

    /// Borrow as an unordered set
    pub fn as_set(&self) -> Option<&PersistentSet> {
        match self {
            Value::Set(s) => Some(s),
            _ => None,
        }
    }

    /// Mutably borrow as an unordered set
    pub fn as_set_mut(&mut self) -> Option<&mut PersistentSet> {
        match self {
            Value::Set(s) => Some(s),
            _ => None,
        }
    }

    /// Owner of a collection value; None for scalars and unowned literals
    pub fn owner(&self) -> Option<&Owner> {
        match self {
            Value::Literal(_) | Value::Ref(_) => None,
            Value::Sequence(l) => l.owner(),
            Value::Mapping(d) => d.owner(),
            Value::Tuple(t) => t.owner(),
            Value::Set(s) => s.owner(),
        }
    }

    /// Iterate the elements of a collection (values for mappings)
    ///
    /// Scalars yield themselves, null yields nothing.
    pub fn elements(&self) -> Box<dyn Iterator<Item = &Value> + '_> {
        match self {
            Value::Literal(Literal::Null) => Box::new(std::iter::empty()),
            Value::Literal(_) | Value::Ref(_) => Box::new(std::iter::once(self)),
            Value::Sequence(l) => Box::new(l.iter()),
            Value::Mapping(d) => Box::new(d.values()),
            Value::Tuple(t) => Box::new(t.iter()),
            Value::Set(s) => Box::new(s.iter()),
        }
    }

    /// Every item referenced by this value, depth first, in storage order
    pub fn refs(&self) -> Vec<ItemId> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs(&self, out: &mut Vec<ItemId>) {
        match self {
            Value::Ref(id) => out.push(*id),
            Value::Literal(_) => {}
            _ => {
                for v in self.elements() {
                    v.collect_refs(out);
                }
            }
        }
    }

    /// Clear and return the dirty flag of this value and any nested proxy
    pub fn take_dirty(&mut self) -> bool {
        match self {
            Value::Literal(_) | Value::Ref(_) => false,
            Value::Sequence(l) => l.take_dirty(),
            Value::Mapping(d) => d.take_dirty(),
            Value::Tuple(t) => t.take_dirty(),
            Value::Set(s) => s.take_dirty(),
        }
    }

    /// Drop every reference to `id`
    ///
    /// A single reference becomes null, collection elements are removed
    /// (tuple slots become null). Returns true if anything changed.
    pub fn remove_ref(&mut self, id: ItemId) -> bool {
        match self {
            Value::Ref(r) if *r == id => {
                *self = Value::null();
                true
            }
            Value::Literal(_) | Value::Ref(_) => false,
            Value::Sequence(l) => l.remove_ref(id),
            Value::Mapping(d) => d.remove_ref(id),
            Value::Tuple(t) => t.remove_ref(id),
            Value::Set(s) => s.remove_ref(id),
        }
    }

    /// Produce an independent copy for `owner` honoring `policy`
    ///
    /// References are kept (`Link`), replaced by `copier(id)` (`Copy`) or
    /// dropped (`Remove`). Returns None when a bare reference is dropped.
    pub fn copy_with(
        &self,
        owner: Option<&Owner>,
        policy: CopyPolicy,
        copier: &mut dyn FnMut(ItemId) -> ItemId,
    ) -> Option<Value> {
        match self {
            Value::Literal(l) => Some(Value::Literal(l.clone())),
            Value::Ref(id) => match policy {
                CopyPolicy::Link => Some(Value::Ref(*id)),
                CopyPolicy::Copy => Some(Value::Ref(copier(*id))),
                CopyPolicy::Remove => None,
            },
            Value::Sequence(l) => Some(Value::Sequence(l.copy(owner, policy, copier))),
            Value::Mapping(d) => Some(Value::Mapping(d.copy(owner, policy, copier))),
            Value::Tuple(t) => Some(Value::Tuple(t.copy(owner, policy, copier))),
            Value::Set(s) => Some(Value::Set(s.copy(owner, policy, copier))),
        }
    }

    /// Re-parent this value under `owner`; see [`prepare_value`]
    pub fn prepared(self, owner: &Owner) -> Value {
        prepare_value(Some(owner), self)
    }
}

// ===== Conversions =====

impl From<Literal> for Value {
    fn from(l: Literal) -> Self {
        Value::Literal(l)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Literal(Literal::Bool(b))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Literal(Literal::Int(i))
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Literal(Literal::Int(i64::from(i)))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Literal(Literal::Float(f))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Literal(Literal::Text(s.to_string()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Literal(Literal::Text(s))
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Literal(Literal::Bytes(b))
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Value::Literal(Literal::Timestamp(t))
    }
}

impl From<ItemId> for Value {
    fn from(id: ItemId) -> Self {
        Value::Ref(id)
    }
}

impl From<PersistentList> for Value {
    fn from(l: PersistentList) -> Self {
        Value::Sequence(l)
    }
}

impl From<PersistentDict> for Value {
    fn from(d: PersistentDict) -> Self {
        Value::Mapping(d)
    }
}

impl From<PersistentTuple> for Value {
    fn from(t: PersistentTuple) -> Self {
        Value::Tuple(t)
    }
}

impl From<PersistentSet> for Value {
    fn from(s: PersistentSet) -> Self {
        Value::Set(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_ieee_equality() {
        assert_ne!(Value::from(f64::NAN), Value::from(f64::NAN));
        assert_eq!(Value::from(0.0), Value::from(-0.0));
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Value::null().type_name(), "null");
        assert_eq!(Value::from("x").type_name(), "text");
        assert_eq!(Value::from(ItemId::new()).type_name(), "ref");
        assert_eq!(Value::sequence(["a"]).type_name(), "sequence");
        assert_eq!(Value::mapping([("k", 1)]).type_name(), "mapping");
    }

    #[test]
    fn test_refs_nested() {
        let a = ItemId::new();
        let b = ItemId::new();
        let c = ItemId::new();
        let v = Value::sequence(vec![
            Value::Ref(a),
            Value::from("x"),
            Value::mapping([("k", Value::Ref(b))]),
            Value::set([Value::Ref(c)]),
        ]);
        assert_eq!(v.refs(), vec![a, b, c]);
    }

    #[test]
    fn test_remove_ref_single_and_collection() {
        let a = ItemId::new();
        let mut single = Value::Ref(a);
        assert!(single.remove_ref(a));
        assert!(single.is_null());

        let mut list = Value::sequence([Value::Ref(a), Value::from(1), Value::Ref(a)]);
        assert!(list.remove_ref(a));
        assert_eq!(list, Value::sequence([1]));
        assert!(!list.remove_ref(a));
    }

    #[test]
    fn test_copy_with_policies() {
        let a = ItemId::new();
        let replacement = ItemId::new();
        let v = Value::Ref(a);

        let linked = v.copy_with(None, CopyPolicy::Link, &mut |id| id).unwrap();
        assert_eq!(linked, Value::Ref(a));

        let copied = v
            .copy_with(None, CopyPolicy::Copy, &mut |_| replacement)
            .unwrap();
        assert_eq!(copied, Value::Ref(replacement));

        assert!(v.copy_with(None, CopyPolicy::Remove, &mut |id| id).is_none());
    }

    #[test]
    fn test_elements_of_scalar() {
        assert_eq!(Value::from(3).elements().count(), 1);
        assert_eq!(Value::null().elements().count(), 0);
    }

    #[test]
    fn test_serde_roundtrip_ignores_ownership() {
        let owner = Owner::new(ItemId::new(), "tags");
        let v = Value::sequence(["x", "y"]).prepared(&owner);
        assert_eq!(v.owner(), Some(&owner));

        let bytes = rmp_serde::to_vec(&v).unwrap();
        let back: Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, v);
        assert!(back.owner().is_none());
    }
}
