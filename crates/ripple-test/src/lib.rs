//! Ripple Test Harness - End-to-end replication testing
//!
//! This crate provides:
//! - An in-process cluster: one kernel, many supervised replicas
//! - A gated transport for holding a client's transactions in flight
//! - Convergence checks against the kernel's canonical state
//! - A seeded random-workload convergence fuzzer
//! - Tracing setup for tests

pub mod harness;
pub mod fuzz;

pub use harness::*;
pub use fuzz::*;

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Install a test-friendly tracing subscriber once per process
///
/// Honors `RUST_LOG`; defaults to `warn`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

#[cfg(test)]
mod scenarios;
