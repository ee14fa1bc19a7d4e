//! Ripple Rebase - Client side of optimistic replication
//!
//! This crate provides:
//! - RebaseLog: confirmed-pending-replay and speculative-pending-ack regions
//! - Offering: conflating offer queue and the merge into visible state
//! - Replica: the visible local state and the handle applications write through
//! - RebaseLoop: one connection's control loop
//! - Supervisor: `with_rebase_loop` and reconnection
//! - Configuration presets

pub mod config;
pub mod log;
pub mod offer;
pub mod replica;
pub mod rebase_loop;
pub mod supervisor;

pub use config::*;
pub use log::*;
pub use offer::*;
pub use replica::*;
pub use rebase_loop::*;
pub use supervisor::*;
