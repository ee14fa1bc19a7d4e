//! Ripple Transport - How clients reach the canonical kernel
//!
//! This crate provides:
//! - The `RemoteKernel` contract (subscribe + transact)
//! - Channel aliases for transactions and broadcasts
//! - A framed relay that carries messages through the wire codec
//! - `FramedKernel`, an in-process kernel wrapper over framed relays

pub mod remote;
pub mod channel;

pub use remote::*;
pub use channel::*;
