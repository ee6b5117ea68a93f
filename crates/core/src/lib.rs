//! Core types and traits for Cairn
//!
//! This crate defines the foundational types used throughout the system:
//! - ItemId / FileId / Version: identity and versioning
//! - Value: closed tagged variant for attribute values
//! - Persistent collection proxies: owned, dirty-tracking containers
//! - Schema: ahead-of-time kind and attribute registry
//! - Error: error taxonomy shared by every crate
//! - Traits: Container and ItemResolver seams

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod persistent;
pub mod schema;
pub mod traits;
pub mod types;
pub mod value;

pub use error::{Error, Result};
pub use persistent::{
    prepare_value, Owner, PersistentDict, PersistentList, PersistentSet, PersistentTuple, Resolved,
};
pub use schema::{
    Attribute, Cardinality, CopyPolicy, DeletePolicy, Kind, Schema, SchemaBuilder, ValueType,
};
pub use traits::{BatchOp, Container, ItemResolver, WriteBatch};
pub use types::{FileId, ItemId, Version};
pub use value::{Literal, Value};
