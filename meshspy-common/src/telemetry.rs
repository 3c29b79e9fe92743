use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A single environmental sample reported by a mesh node.
///
/// All four fields are always present; the wire format is fixed-field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTelemetry {
    /// Node identifier (e.g., "!a1b2c3d4"). Never empty once decoded.
    pub node_id: String,

    /// Unix epoch seconds when the sample was taken.
    pub timestamp: i64,

    /// Temperature in degrees Celsius.
    pub temperature: f32,

    /// Relative humidity in percent.
    pub humidity: f32,
}

impl NodeTelemetry {
    /// Create a sample with an explicit timestamp.
    pub fn new(node_id: impl Into<String>, timestamp: i64, temperature: f32, humidity: f32) -> Self {
        Self {
            node_id: node_id.into(),
            timestamp,
            temperature,
            humidity,
        }
    }

    /// Create a sample stamped with the current time.
    pub fn now(node_id: impl Into<String>, temperature: f32, humidity: f32) -> Self {
        Self::new(node_id, current_timestamp_secs(), temperature, humidity)
    }
}

impl std::fmt::Display for NodeTelemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{} temp={} hum={}",
            self.node_id, self.timestamp, self.temperature, self.humidity
        )
    }
}

/// Get the current timestamp in seconds since Unix epoch.
///
/// Returns 0 if system time is before Unix epoch (should never happen in practice).
pub fn current_timestamp_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
