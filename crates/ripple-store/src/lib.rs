//! Ripple Store - Partitioned EAV fact store
//!
//! The replication kernel consumes a small surface of the fact store:
//! - Partitioned id allocation
//! - Schema lookup by stable ident (attributes, entity types)
//! - Eight traceable index query shapes
//! - Atomic transact with novelty, raw datom application and revert
//! - Reference following for cascading retraction
//!
//! This crate is the in-memory store implementing that surface.

pub mod schema;
pub mod db;
pub mod query;

pub use schema::*;
pub use db::*;
pub use query::*;
