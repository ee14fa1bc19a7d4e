//! Ripple Wire - Durable payload format
//!
//! Everything that crosses a connection is keyed by durable identifiers:
//! - Wire instructions (7 variants) with entities as uids and attributes as idents
//! - Durable values, queries and facts
//! - Transactions and broadcasts
//! - Length-prefixed JSON framing

pub mod instruction;
pub mod transaction;
pub mod frame;

pub use instruction::*;
pub use transaction::*;
pub use frame::*;
