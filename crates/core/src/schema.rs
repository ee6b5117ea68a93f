//! Schema registry
//!
//! Kinds and their attribute declarations are registered ahead of time with
//! a [`SchemaBuilder`] and frozen into an immutable [`Schema`]. Attribute
//! lookup is a table lookup over the flattened super-kind hierarchy.
//!
//! ## Example
//!
//! ```
//! use cairn_core::schema::{Attribute, Cardinality, SchemaBuilder, ValueType};
//!
//! let schema = SchemaBuilder::new()
//!     .kind("Note", &[], vec![
//!         Attribute::new("title").with_type(ValueType::Text),
//!         Attribute::new("tags")
//!             .with_type(ValueType::Text)
//!             .with_cardinality(Cardinality::List),
//!     ])
//!     .kind("Task", &["Note"], vec![Attribute::new("done").with_type(ValueType::Bool)])
//!     .build()
//!     .unwrap();
//!
//! assert!(schema.is_subkind("Task", "Note"));
//! assert!(schema.attribute("Task", "tags").is_ok());
//! ```

use crate::error::{Error, Result};
use crate::value::{Literal, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Element type accepted by an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ValueType {
    /// Any value
    #[default]
    Any,
    /// Boolean literal
    Bool,
    /// Integer literal
    Int,
    /// Float literal (integers are accepted)
    Float,
    /// Text literal
    Text,
    /// Bytes literal
    Bytes,
    /// Timestamp literal
    Timestamp,
    /// Reference to another item
    Item,
}

impl ValueType {
    /// True if `value` (a scalar or reference) is acceptable
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (ValueType::Any, _) => true,
            (_, Value::Literal(Literal::Null)) => true,
            (ValueType::Item, Value::Ref(_)) => true,
            (ValueType::Bool, Value::Literal(Literal::Bool(_))) => true,
            (ValueType::Int, Value::Literal(Literal::Int(_))) => true,
            (ValueType::Float, Value::Literal(Literal::Float(_) | Literal::Int(_))) => true,
            (ValueType::Text, Value::Literal(Literal::Text(_))) => true,
            (ValueType::Bytes, Value::Literal(Literal::Bytes(_))) => true,
            (ValueType::Timestamp, Value::Literal(Literal::Timestamp(_))) => true,
            _ => false,
        }
    }
}

/// Shape of an attribute value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Cardinality {
    /// One scalar or reference
    #[default]
    Single,
    /// Ordered sequence
    List,
    /// Keyed mapping
    Dict,
    /// Fixed-arity tuple
    Tuple,
    /// Unordered set
    Set,
}

/// What happens to referenced items when the owner is copied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CopyPolicy {
    /// Referenced items are copied too
    Copy,
    /// The copy shares the reference
    #[default]
    Link,
    /// The copy drops the reference
    Remove,
}

/// What happens to referenced items when the owner is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeletePolicy {
    /// Only the reference goes away
    #[default]
    Remove,
    /// Referenced items are deleted as well
    Cascade,
}

/// Attribute declaration
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    /// Attribute name, unique within a kind
    pub name: String,
    /// Element type
    pub value_type: ValueType,
    /// Value shape
    pub cardinality: Cardinality,
    /// Must hold a value (or have a default) at commit
    pub required: bool,
    /// Value read when the attribute is unset
    pub default: Option<Value>,
    /// Attribute on the referenced item kept symmetric with this one
    pub inverse: Option<String>,
    /// Copy behaviour for referenced items
    pub copy_policy: CopyPolicy,
    /// Delete behaviour for referenced items
    pub delete_policy: DeletePolicy,
    /// Text values are added to the full-text index at commit
    pub indexed: bool,
}

impl Attribute {
    /// Single-valued attribute of any type
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_type: ValueType::Any,
            cardinality: Cardinality::Single,
            required: false,
            default: None,
            inverse: None,
            copy_policy: CopyPolicy::default(),
            delete_policy: DeletePolicy::default(),
            indexed: false,
        }
    }

    /// Set the element type
    pub fn with_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    /// Set the cardinality
    pub fn with_cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    /// Mark as required
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Set the default value
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Declare the inverse attribute; implies `ValueType::Item`
    pub fn with_inverse(mut self, inverse: impl Into<String>) -> Self {
        self.inverse = Some(inverse.into());
        self.value_type = ValueType::Item;
        self
    }

    /// Set the copy policy
    pub fn with_copy_policy(mut self, policy: CopyPolicy) -> Self {
        self.copy_policy = policy;
        self
    }

    /// Set the delete policy
    pub fn with_delete_policy(mut self, policy: DeletePolicy) -> Self {
        self.delete_policy = policy;
        self
    }

    /// Include text values in the full-text index
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Concurrent edits to this attribute merge instead of conflicting
    pub fn is_mergeable(&self) -> bool {
        self.cardinality == Cardinality::Set
    }

    /// Empty collection matching the cardinality, null for single values
    pub fn empty_value(&self) -> Value {
        match self.cardinality {
            Cardinality::Single => Value::null(),
            Cardinality::List => Value::sequence(Vec::<Value>::new()),
            Cardinality::Dict => Value::mapping(Vec::<(String, Value)>::new()),
            Cardinality::Tuple => Value::tuple(Vec::<Value>::new()),
            Cardinality::Set => Value::set(Vec::<Value>::new()),
        }
    }

    /// Validate `value` against cardinality and element type
    pub fn check(&self, value: &Value) -> Result<()> {
        let shape_ok = match (self.cardinality, value) {
            (Cardinality::Single, Value::Literal(_) | Value::Ref(_)) => true,
            (Cardinality::List, Value::Sequence(_)) => true,
            (Cardinality::Dict, Value::Mapping(_)) => true,
            (Cardinality::Tuple, Value::Tuple(_)) => true,
            (Cardinality::Set, Value::Set(_)) => true,
            (_, Value::Literal(Literal::Null)) => true,
            _ => false,
        };
        if !shape_ok {
            return Err(self.mismatch(format!("{:?}", self.cardinality), value));
        }
        for element in value.elements() {
            if !self.value_type.accepts(element) {
                return Err(self.mismatch(format!("{:?}", self.value_type), element));
            }
        }
        Ok(())
    }

    fn mismatch(&self, expected: String, actual: &Value) -> Error {
        Error::TypeMismatch {
            attribute: self.name.clone(),
            expected,
            actual: actual.type_name().to_string(),
        }
    }
}

/// A kind with its flattened attribute table
#[derive(Debug, Clone)]
pub struct Kind {
    name: String,
    superkinds: Vec<String>,
    ancestors: BTreeSet<String>,
    attributes: BTreeMap<String, Arc<Attribute>>,
}

impl Kind {
    /// Kind name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Direct super-kinds in declaration order
    pub fn superkinds(&self) -> &[String] {
        &self.superkinds
    }

    /// Attribute declared here or inherited
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name).map(|a| a.as_ref())
    }

    /// All attributes, own and inherited, by name
    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.values().map(|a| a.as_ref())
    }

    /// True if this kind is `other` or inherits from it
    pub fn is_a(&self, other: &str) -> bool {
        self.ancestors.contains(other)
    }
}

struct KindDef {
    name: String,
    superkinds: Vec<String>,
    attributes: Vec<Attribute>,
}

/// Builder collecting kind declarations before any item exists
#[derive(Default)]
pub struct SchemaBuilder {
    defs: Vec<KindDef>,
}

impl SchemaBuilder {
    /// Empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a kind with its super-kinds and own attributes
    pub fn kind(mut self, name: &str, superkinds: &[&str], attributes: Vec<Attribute>) -> Self {
        self.defs.push(KindDef {
            name: name.to_string(),
            superkinds: superkinds.iter().map(|s| s.to_string()).collect(),
            attributes,
        });
        self
    }

    /// Resolve the hierarchy and freeze the registry
    ///
    /// # Errors
    ///
    /// `Error::Schema` for duplicate kinds or attributes, unknown super-kinds,
    /// inheritance cycles, or inverse attributes that are not item-typed.
    pub fn build(self) -> Result<Schema> {
        let mut defs: HashMap<String, KindDef> = HashMap::new();
        let mut order = Vec::new();
        for def in self.defs {
            if defs.contains_key(&def.name) {
                return Err(Error::Schema(format!("kind {} declared twice", def.name)));
            }
            let mut seen = BTreeSet::new();
            for attr in &def.attributes {
                if !seen.insert(attr.name.as_str()) {
                    return Err(Error::Schema(format!(
                        "attribute {} declared twice on {}",
                        attr.name, def.name
                    )));
                }
                if attr.inverse.is_some() && attr.value_type != ValueType::Item {
                    return Err(Error::Schema(format!(
                        "attribute {}.{} has an inverse but is not item-typed",
                        def.name, attr.name
                    )));
                }
            }
            order.push(def.name.clone());
            defs.insert(def.name.clone(), def);
        }

        let mut kinds = HashMap::new();
        for name in &order {
            let mut visiting = Vec::new();
            resolve(name, &defs, &mut kinds, &mut visiting)?;
        }
        Ok(Schema { kinds })
    }
}

fn resolve(
    name: &str,
    defs: &HashMap<String, KindDef>,
    kinds: &mut HashMap<String, Kind>,
    visiting: &mut Vec<String>,
) -> Result<()> {
    if kinds.contains_key(name) {
        return Ok(());
    }
    if visiting.iter().any(|v| v == name) {
        return Err(Error::Schema(format!(
            "inheritance cycle through {}",
            visiting.join(" -> ")
        )));
    }
    let def = defs
        .get(name)
        .ok_or_else(|| Error::Schema(format!("unknown super-kind {}", name)))?;

    visiting.push(name.to_string());
    let mut ancestors = BTreeSet::new();
    let mut attributes = BTreeMap::new();
    ancestors.insert(name.to_string());
    for sup in &def.superkinds {
        resolve(sup, defs, kinds, visiting)?;
        if let Some(parent) = kinds.get(sup) {
            ancestors.extend(parent.ancestors.iter().cloned());
            for (attr_name, attr) in &parent.attributes {
                attributes
                    .entry(attr_name.clone())
                    .or_insert_with(|| Arc::clone(attr));
            }
        }
    }
    visiting.pop();

    // Own declarations override inherited ones
    for attr in &def.attributes {
        attributes.insert(attr.name.clone(), Arc::new(attr.clone()));
    }
    kinds.insert(
        name.to_string(),
        Kind {
            name: name.to_string(),
            superkinds: def.superkinds.clone(),
            ancestors,
            attributes,
        },
    );
    Ok(())
}

/// Immutable kind registry shared by every view of a repository
#[derive(Debug, Clone, Default)]
pub struct Schema {
    kinds: HashMap<String, Kind>,
}

impl Schema {
    /// Schema with no kinds
    pub fn empty() -> Self {
        Self::default()
    }

    /// Look up a kind
    pub fn kind(&self, name: &str) -> Result<&Kind> {
        self.kinds
            .get(name)
            .ok_or_else(|| Error::NoSuchKind(name.to_string()))
    }

    /// Look up an attribute of a kind
    pub fn attribute(&self, kind: &str, attribute: &str) -> Result<&Attribute> {
        self.kind(kind)?
            .attribute(attribute)
            .ok_or_else(|| Error::NoSuchAttribute {
                kind: kind.to_string(),
                attribute: attribute.to_string(),
            })
    }

    /// True if `kind` is `of` or inherits from it
    pub fn is_subkind(&self, kind: &str, of: &str) -> bool {
        self.kinds.get(kind).map_or(false, |k| k.is_a(of))
    }

    /// `of` and every kind inheriting from it, sorted by name
    pub fn subkinds(&self, of: &str) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .kinds
            .values()
            .filter(|k| k.is_a(of))
            .map(|k| k.name())
            .collect();
        out.sort_unstable();
        out
    }

    /// Iterate all kinds
    pub fn kinds(&self) -> impl Iterator<Item = &Kind> {
        self.kinds.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ItemId;

    fn sample() -> Schema {
        SchemaBuilder::new()
            .kind(
                "Base",
                &[],
                vec![
                    Attribute::new("title").with_type(ValueType::Text),
                    Attribute::new("rank").with_type(ValueType::Int),
                ],
            )
            .kind(
                "Tagged",
                &[],
                vec![Attribute::new("tags")
                    .with_type(ValueType::Text)
                    .with_cardinality(Cardinality::Set)],
            )
            .kind(
                "Note",
                &["Base", "Tagged"],
                vec![Attribute::new("rank").with_type(ValueType::Float)],
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_multiple_inheritance_flattens() {
        let schema = sample();
        let note = schema.kind("Note").unwrap();
        assert!(note.attribute("title").is_some());
        assert!(note.attribute("tags").is_some());
        assert!(schema.is_subkind("Note", "Base"));
        assert!(schema.is_subkind("Note", "Tagged"));
        assert!(!schema.is_subkind("Base", "Note"));
        assert_eq!(schema.subkinds("Base"), vec!["Base", "Note"]);
    }

    #[test]
    fn test_own_attribute_overrides_inherited() {
        let schema = sample();
        let rank = schema.attribute("Note", "rank").unwrap();
        assert_eq!(rank.value_type, ValueType::Float);
        assert_eq!(
            schema.attribute("Base", "rank").unwrap().value_type,
            ValueType::Int
        );
    }

    #[test]
    fn test_lookup_errors() {
        let schema = sample();
        assert!(matches!(schema.kind("Nope"), Err(Error::NoSuchKind(_))));
        assert!(matches!(
            schema.attribute("Note", "missing"),
            Err(Error::NoSuchAttribute { .. })
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let result = SchemaBuilder::new()
            .kind("A", &["B"], vec![])
            .kind("B", &["A"], vec![])
            .build();
        assert!(matches!(result, Err(Error::Schema(_))));
    }

    #[test]
    fn test_unknown_superkind_rejected() {
        let result = SchemaBuilder::new().kind("A", &["Ghost"], vec![]).build();
        assert!(matches!(result, Err(Error::Schema(_))));
    }

    #[test]
    fn test_duplicate_kind_rejected() {
        let result = SchemaBuilder::new()
            .kind("A", &[], vec![])
            .kind("A", &[], vec![])
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_inverse_requires_item_type() {
        let attr = Attribute::new("owner")
            .with_inverse("owned")
            .with_type(ValueType::Text);
        let result = SchemaBuilder::new().kind("A", &[], vec![attr]).build();
        assert!(matches!(result, Err(Error::Schema(_))));
    }

    #[test]
    fn test_check_cardinality_and_type() {
        let tags = Attribute::new("tags")
            .with_type(ValueType::Text)
            .with_cardinality(Cardinality::List);
        assert!(tags.check(&Value::sequence(["x", "y"])).is_ok());
        assert!(tags.check(&Value::null()).is_ok());
        assert!(matches!(
            tags.check(&Value::from("x")),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(tags.check(&Value::sequence([1])).is_err());

        let link = Attribute::new("link").with_type(ValueType::Item);
        assert!(link.check(&Value::Ref(ItemId::new())).is_ok());
        assert!(link.check(&Value::from("x")).is_err());
    }

    #[test]
    fn test_empty_value_matches_cardinality() {
        let set = Attribute::new("s").with_cardinality(Cardinality::Set);
        assert!(set.check(&set.empty_value()).is_ok());
        assert!(set.is_mergeable());
        assert!(Attribute::new("x").empty_value().is_null());
    }
}
