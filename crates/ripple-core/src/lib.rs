//! Ripple Core - Fundamental types and primitives
//!
//! This crate defines the types shared by every layer of the replication kernel:
//! - Identifiers (EntityId with partition tag, Uid, ClientId, TxId)
//! - Values and attribute schemas
//! - Facts and novelty
//! - The per-origin client clock
//! - The error type

pub mod id;
pub mod value;
pub mod fact;
pub mod clock;
pub mod error;

pub use id::*;
pub use value::*;
pub use fact::*;
pub use clock::*;
pub use error::*;
