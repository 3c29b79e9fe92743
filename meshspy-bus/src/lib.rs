//! MeshSpy bus client
//!
//! A small publish/subscribe client shared by the MeshSpy pipeline flows.
//!
//! # Overview
//!
//! - [`BusClient`] publishes, subscribes and disconnects over any [`Transport`]
//! - [`Subscription`] yields inbound messages in arrival order
//! - [`AnyTransport`] picks MQTT, Zenoh or the in-process loopback from
//!   [`BusConfig`]
//!
//! After a dropped session the transport reconnects on its own and the client
//! re-issues every live subscription.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use meshspy_bus::BusConfig;
//!
//! let bus = Arc::new(meshspy_bus::connect(&BusConfig::default()).await?);
//! let mut sub = bus.subscribe("meshspy/nodes").await?;
//! bus.publish("meshspy/raw", &b"T=21.5"[..]).await?;
//! while let Some(msg) = sub.recv().await {
//!     println!("{}: {} bytes", msg.topic, msg.payload.len());
//! }
//! bus.disconnect(bus_config.drain_timeout()).await?;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod loopback;
pub mod mqtt;
pub mod topic;
pub mod transport;
pub mod zenoh_transport;

pub use client::{BusClient, ClientOptions, ConnectionState, PublishStats, Subscription};
pub use config::{Backend, BusConfig, ZenohConfig};
pub use error::{BusError, Result};
pub use loopback::LoopbackTransport;
pub use mqtt::MqttTransport;
pub use topic::{DEFAULT_RAW_TOPIC, DEFAULT_TELEMETRY_TOPIC};
pub use transport::{AnyTransport, EventReceiver, InboundMessage, QoS, Transport, TransportEvent};
pub use zenoh_transport::ZenohTransport;

/// Validate `config`, connect the configured backend and wrap it in a client.
pub async fn connect(config: &BusConfig) -> Result<BusClient<AnyTransport>> {
    config.validate()?;
    let (transport, events) = AnyTransport::connect(config).await?;
    tracing::debug!(backend = ?transport.backend(), "Bus transport ready");
    Ok(BusClient::new(transport, events, ClientOptions::from(config)))
}
