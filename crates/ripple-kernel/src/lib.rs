//! Ripple Kernel - The canonical side of replication
//!
//! This crate provides:
//! - Kernel: the authoritative store, per-origin clock and broadcast fan-out
//! - The `RemoteKernel` endpoint (subscribe + transact) for clients
//! - Leader: writes made directly against the canonical store
//! - Kernel configuration

pub mod config;
pub mod kernel;
pub mod leader;

pub use config::*;
pub use kernel::*;
pub use leader::*;
