//! Replica configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use ripple_core::{ClientId, RippleResult};

/// When to re-establish a lost connection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Reconnects allowed in a row; unlimited when unset
    pub max_attempts: Option<u32>,
    /// Pause before each reconnect
    pub backoff_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::infinite()
    }
}

impl ReconnectPolicy {
    /// Never reconnect; the first fatal error ends the replica
    pub fn never() -> Self {
        ReconnectPolicy {
            max_attempts: Some(0),
            backoff_ms: 0,
        }
    }

    pub fn infinite() -> Self {
        ReconnectPolicy {
            max_attempts: None,
            backoff_ms: 250,
        }
    }

    pub fn bounded(max_attempts: u32) -> Self {
        ReconnectPolicy {
            max_attempts: Some(max_attempts),
            backoff_ms: 250,
        }
    }

    pub fn with_backoff(mut self, backoff_ms: u64) -> Self {
        self.backoff_ms = backoff_ms;
        self
    }

    /// May reconnect attempt number `attempt` (1-based) go ahead?
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Replica configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebaseConfig {
    /// Fixed client identity; generated when unset
    pub client_id: Option<ClientId>,
    /// Outgoing transaction buffer
    pub outgoing_buffer: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for RebaseConfig {
    fn default() -> Self {
        RebaseConfig {
            client_id: None,
            outgoing_buffer: 64,
            reconnect: ReconnectPolicy::infinite(),
        }
    }
}

impl RebaseConfig {
    /// Interactive clients: keep reconnecting
    pub fn interactive() -> Self {
        Self::default()
    }

    /// Tests: fast retries, bounded
    pub fn testing() -> Self {
        RebaseConfig {
            client_id: None,
            outgoing_buffer: 16,
            reconnect: ReconnectPolicy::bounded(20).with_backoff(5),
        }
    }

    /// Single connection, no retries
    pub fn one_shot() -> Self {
        RebaseConfig {
            reconnect: ReconnectPolicy::never(),
            ..Self::default()
        }
    }

    pub fn with_client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Load from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> RippleResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
