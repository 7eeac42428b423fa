//! Registry configuration

use serde::{Deserialize, Serialize};

/// Forward registry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    /// Requests that may wait in front of the registry task
    pub request_queue_depth: usize,
    /// Chunks a data channel holds before `send` waits for the reader
    pub data_channel_capacity: usize,
    /// Drop a sequence binding when its connection is closed.
    /// Off by default: closed sequences keep resolving to their endpoint.
    pub reclaim_bindings: bool,
}

impl ForwardConfig {
    pub(crate) fn queue_depth(&self) -> usize {
        self.request_queue_depth.max(1)
    }

    pub(crate) fn channel_capacity(&self) -> usize {
        self.data_channel_capacity.max(1)
    }
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            request_queue_depth: 32,
            data_channel_capacity: 16,
            reclaim_bindings: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ForwardConfig = serde_json::from_str(r#"{"reclaim_bindings": true}"#).unwrap();

        assert!(config.reclaim_bindings);
        assert_eq!(config.request_queue_depth, 32);
        assert_eq!(config.data_channel_capacity, 16);
    }

    #[test]
    fn test_zero_sizes_are_clamped() {
        let config = ForwardConfig {
            request_queue_depth: 0,
            data_channel_capacity: 0,
            reclaim_bindings: false,
        };

        assert_eq!(config.queue_depth(), 1);
        assert_eq!(config.channel_capacity(), 1);
    }
}
