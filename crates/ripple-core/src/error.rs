//! Error types for the replication kernel

use thiserror::Error;

use crate::{EntityId, ValueKind};

/// Core Ripple errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RippleError {
    // Conflict errors
    #[error("Assumptions violated: read hash {expected:016x} now {actual:016x}")]
    AssumptionsViolated { expected: u64, actual: u64 },

    // Protocol errors
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Broadcast stream closed")]
    StreamClosed,

    #[error("Kernel reset the connection")]
    Reset,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Reconnect attempts exhausted after {0}")]
    ReconnectExhausted(u32),

    // Schema errors
    #[error("Unknown attribute: {0}")]
    UnknownAttribute(String),

    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("Schema conflict for {0}")]
    SchemaConflict(String),

    // Store errors
    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("Entity {0:?} carries no durable uid")]
    MissingUid(EntityId),

    #[error("Shared entity {entity:?} cannot reference non-shared entity {target:?}")]
    LocalRefLeak { entity: EntityId, target: EntityId },

    #[error("Attribute {attribute} expects {expected:?} values")]
    ValueKindMismatch {
        attribute: String,
        expected: ValueKind,
    },

    #[error("Unique attribute {attribute} already held by {owner:?}")]
    UniqueConflict { attribute: String, owner: EntityId },

    #[error("Unsupported value: {0}")]
    UnsupportedValue(String),

    // Wire errors
    #[error("Invalid wire format: {0}")]
    InvalidWireFormat(String),

    // Transport errors
    #[error("Transport error: {0}")]
    TransportError(String),

    // Extension errors
    #[error("Hook failed: {0}")]
    Hook(String),
}

impl RippleError {
    /// Errors that terminate the connection and force a fresh snapshot
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RippleError::ProtocolViolation(_)
                | RippleError::StreamClosed
                | RippleError::Reset
        )
    }

    /// Stale-read conflict, recoverable for the connection
    pub fn is_conflict(&self) -> bool {
        matches!(self, RippleError::AssumptionsViolated { .. })
    }
}

impl From<serde_json::Error> for RippleError {
    fn from(e: serde_json::Error) -> Self {
        RippleError::InvalidWireFormat(e.to_string())
    }
}

/// Result type for Ripple operations
pub type RippleResult<T> = Result<T, RippleError>;
