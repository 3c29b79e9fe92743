//! Bus connection configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BusError, Result};
use crate::transport::QoS;

/// Which transport carries the bus traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// MQTT broker (default).
    #[default]
    Mqtt,
    /// Zenoh router or peer network.
    Zenoh,
    /// In-process loopback, no network.
    Loopback,
}

/// Zenoh session configuration, used when `backend` is `zenoh`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ZenohConfig {
    /// Zenoh mode: "client", "peer", or "router".
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Endpoints to connect to (for client mode).
    #[serde(default)]
    pub connect: Vec<String>,

    /// Endpoints to listen on (for peer/router mode).
    #[serde(default)]
    pub listen: Vec<String>,
}

fn default_mode() -> String {
    "client".to_string()
}

impl Default for ZenohConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            connect: Vec::new(),
            listen: Vec::new(),
        }
    }
}

/// Bus client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Transport backend.
    #[serde(default)]
    pub backend: Backend,

    /// Broker address, e.g. "tcp://localhost:1883".
    #[serde(default = "default_broker")]
    pub broker: String,

    /// Client identifier presented to the broker.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// How long a reconnection handshake may stall, in seconds.
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,

    /// Deadline for the initial CONNACK at startup, in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Deadline for a single publish, in milliseconds. At QoS 1 this covers
    /// the wait for the broker's PUBACK.
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    /// Bounded wait for in-flight requests on disconnect, in milliseconds.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// First delay between reconnection attempts, in milliseconds.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Upper bound for the reconnection back-off, in milliseconds.
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,

    /// Per-subscription delivery queue length.
    #[serde(default = "default_delivery_buffer")]
    pub delivery_buffer: usize,

    /// Quality of service for publishes and subscriptions (0 or 1).
    #[serde(default)]
    pub qos: QoS,

    /// Zenoh session settings.
    #[serde(default)]
    pub zenoh: ZenohConfig,
}

fn default_broker() -> String {
    "tcp://localhost:1883".to_string()
}

fn default_client_id() -> String {
    "meshspy".to_string()
}

fn default_keep_alive_secs() -> u64 {
    2
}

fn default_ping_timeout_secs() -> u64 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_publish_timeout_ms() -> u64 {
    5000
}

fn default_drain_timeout_ms() -> u64 {
    250
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_delay_ms() -> u64 {
    30_000
}

fn default_delivery_buffer() -> usize {
    256
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            broker: default_broker(),
            client_id: default_client_id(),
            keep_alive_secs: default_keep_alive_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            publish_timeout_ms: default_publish_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            delivery_buffer: default_delivery_buffer(),
            qos: QoS::default(),
            zenoh: ZenohConfig::default(),
        }
    }
}

impl BusConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(BusError::config("client_id must not be empty"));
        }
        if self.keep_alive_secs == 0 {
            return Err(BusError::config("keep_alive_secs must be at least 1"));
        }
        if self.ping_timeout_secs == 0 {
            return Err(BusError::config("ping_timeout_secs must be at least 1"));
        }
        if self.publish_timeout_ms == 0 {
            return Err(BusError::config("publish_timeout_ms must be positive"));
        }
        if self.delivery_buffer == 0 {
            return Err(BusError::config("delivery_buffer must be positive"));
        }
        if self.max_reconnect_delay_ms < self.reconnect_delay_ms {
            return Err(BusError::config(
                "max_reconnect_delay_ms must not be below reconnect_delay_ms",
            ));
        }
        if self.backend == Backend::Mqtt {
            crate::mqtt::parse_broker(&self.broker)?;
        }
        Ok(())
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }
}
