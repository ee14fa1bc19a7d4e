//! Ripple Codec - Local instructions and their durable form
//!
//! This crate bridges ephemeral store ids and the durable wire contract:
//! - Instruction enum (7 variants) and the tag-dispatched codec table
//! - encode / decode / expand / apply per instruction kind
//! - Fact and value conversion to durable form, resolve-or-create by uid
//! - Read traces folded into `Validate` instructions
//! - `Change`, the recording write context used by clients and the leader

pub mod instruction;
pub mod durable;
pub mod trace;
pub mod codec;
pub mod change;

pub use instruction::*;
pub use durable::*;
pub use trace::*;
pub use codec::*;
pub use change::*;
