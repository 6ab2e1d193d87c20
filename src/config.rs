//! Circuit and connection configuration
//!
//! Plain value structs with defaults. Loading is left to the embedding
//! application; partial JSON overrides work because every field falls back
//! to its default.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeouts, windows and failure policy for circuits and their streams
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Wait for CREATED / EXTENDED (milliseconds)
    pub circuit_timeout_ms: u64,

    /// Wait for CONNECTED after BEGIN (milliseconds)
    pub stream_build_timeout_ms: u64,

    /// Wait for RESOLVED after RESOLVE (milliseconds)
    pub resolve_timeout_ms: u64,

    /// Failed streams tolerated before a circuit is soft-closed
    pub closes_on_failures: u32,

    /// Weight of the circuit setup time against stream setup times in the ranking
    pub establishment_time_impact: u32,

    /// Circuit-level SENDME window
    pub circuit_window_start: u32,
    pub circuit_window_increment: u32,

    /// Stream-level SENDME window
    pub stream_window_start: u32,
    pub stream_window_increment: u32,

    /// Capacity of the per-circuit control queue
    pub control_queue_capacity: usize,

    /// Capacity of each per-stream inbound queue; a stream whose reader
    /// lets it overflow is closed
    pub stream_queue_capacity: usize,

    /// A soft close force-closes streams idle for longer than
    /// `drain_idle_factor * stream_build_timeout`
    pub drain_idle_factor: u32,

    /// Circuits without streams become idle after this long (milliseconds)
    pub idle_timeout_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            circuit_timeout_ms: 40_000,
            stream_build_timeout_ms: 10_000,
            resolve_timeout_ms: 20_000,
            closes_on_failures: 3,
            establishment_time_impact: 5,
            circuit_window_start: 1000,
            circuit_window_increment: 100,
            stream_window_start: 500,
            stream_window_increment: 50,
            control_queue_capacity: 64,
            stream_queue_capacity: 1024,
            drain_idle_factor: 10,
            idle_timeout_ms: 300_000,
        }
    }
}

impl CircuitConfig {
    pub fn circuit_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_timeout_ms)
    }

    pub fn stream_build_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_build_timeout_ms)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn drain_idle_limit(&self) -> Duration {
        self.stream_build_timeout() * self.drain_idle_factor
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Parse a (possibly partial) JSON document
    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| crate::error::TorError::InvalidState(format!("Bad circuit config: {}", e)))
    }
}

/// Link-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Random circuit-id draws before giving up
    pub circuit_id_attempts: u32,

    /// Settings applied to every circuit built on the link
    pub circuit: CircuitConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            circuit_id_attempts: 1000,
            circuit: CircuitConfig::default(),
        }
    }
}
