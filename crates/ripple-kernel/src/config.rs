//! Kernel configuration

use serde::{Deserialize, Serialize};

use ripple_core::{ClientId, RippleResult};

/// Kernel configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Events kept for slow subscribers before they are reset
    pub event_capacity: usize,
    /// Per-subscriber broadcast buffer
    pub subscriber_buffer: usize,
    /// Origin of leader writes; generated when unset
    pub leader_id: Option<ClientId>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            event_capacity: 1024,
            subscriber_buffer: 256,
            leader_id: None,
        }
    }
}

impl KernelConfig {
    /// Small buffers, so lagging subscribers show up in tests
    pub fn testing() -> Self {
        KernelConfig {
            event_capacity: 256,
            subscriber_buffer: 64,
            leader_id: None,
        }
    }

    pub fn with_leader_id(mut self, leader_id: ClientId) -> Self {
        self.leader_id = Some(leader_id);
        self
    }

    /// Load from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> RippleResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_partial() {
        let config = KernelConfig::from_json(r#"{"event_capacity": 8}"#).unwrap();
        assert_eq!(config.event_capacity, 8);
        assert_eq!(config.subscriber_buffer, KernelConfig::default().subscriber_buffer);
        assert_eq!(config.leader_id, None);
    }

    #[test]
    fn test_leader_id_roundtrip() {
        let leader = ClientId::from_u128(7);
        let config = KernelConfig::testing().with_leader_id(leader);
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(KernelConfig::from_json(&json).unwrap(), config);
    }
}
