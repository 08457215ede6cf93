//! Controller configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A numeric knob is out of range
    #[error("Invalid {field}: {reason}")]
    OutOfRange {
        /// Field name
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// An ICE server URL is not a STUN/TURN URL
    #[error("Invalid ICE server URL: {0}")]
    IceServer(String),
}

/// Call controller configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// How long Dialing and Ringing may last before the call is abandoned
    pub ring_timeout_secs: u64,
    /// Grace period for a `disconnected` ICE state before the call is torn
    /// down; zero tears down immediately
    pub disconnect_grace_ms: u64,
    /// Maximum candidates held per buffer before the oldest is dropped
    pub ice_buffer_capacity: usize,
    /// Maximum remote peers whose candidates are held before any session exists
    pub stray_candidate_peers: usize,
    /// Capacity of the `CallEvent` broadcast channel
    pub event_capacity: usize,
    /// STUN/TURN servers handed to the negotiation engine
    pub ice_servers: Vec<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 45,
            disconnect_grace_ms: 5000,
            ice_buffer_capacity: 64,
            stray_candidate_peers: 16,
            event_capacity: 100,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl CallConfig {
    /// Dialing/Ringing timeout
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    /// ICE disconnect grace period
    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    /// Check the configuration for values the controller cannot work with
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_timeout_secs == 0 {
            return Err(ConfigError::OutOfRange {
                field: "ring_timeout_secs",
                reason: "must be at least one second".to_string(),
            });
        }
        if self.ice_buffer_capacity == 0 {
            return Err(ConfigError::OutOfRange {
                field: "ice_buffer_capacity",
                reason: "must hold at least one candidate".to_string(),
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::OutOfRange {
                field: "event_capacity",
                reason: "broadcast channel needs capacity".to_string(),
            });
        }
        for url in &self.ice_servers {
            let known = ["stun:", "stuns:", "turn:", "turns:"]
                .iter()
                .any(|scheme| url.starts_with(scheme));
            if !known {
                return Err(ConfigError::IceServer(url.clone()));
            }
        }
        Ok(())
    }
}
