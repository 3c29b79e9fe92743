//! Transport seam between the bus client and a concrete broker protocol.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::{Backend, BusConfig};
use crate::error::{BusError, Result};
use crate::loopback::LoopbackTransport;
use crate::mqtt::MqttTransport;
use crate::zenoh_transport::ZenohTransport;

/// Delivery guarantee for a publish or subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    /// At most once (0). Best effort, no acknowledgment.
    #[default]
    AtMostOnce,
    /// At least once (1).
    AtLeastOnce,
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(level: u8) -> std::result::Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            other => Err(format!("unsupported QoS level {}", other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
        }
    }
}

/// A message as delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Events a transport reports to the bus client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The session was lost; the transport keeps trying to get it back.
    ConnectionLost(String),
    /// A new session is up after a loss. Broker-side subscriptions are gone.
    Reconnected,
    /// An inbound message.
    Message(InboundMessage),
}

/// Receiving half of a transport's event stream.
///
/// The stream ends when the transport has shut down.
pub type EventReceiver = mpsc::Receiver<TransportEvent>;

/// A connected broker session.
///
/// Implementations reconnect on their own and report it through
/// [`TransportEvent`]; re-subscribing is left to the bus client.
pub trait Transport: Send + Sync + 'static {
    /// Hand a message to the broker.
    fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Ask the broker for messages matching `filter`.
    fn subscribe(&self, filter: &str, qos: QoS) -> impl Future<Output = Result<()>> + Send;

    /// Flush in-flight requests for at most `drain`, then close the session.
    fn disconnect(&self, drain: Duration) -> impl Future<Output = Result<()>> + Send;
}

/// Transport selected at runtime from [`BusConfig::backend`].
pub enum AnyTransport {
    Mqtt(MqttTransport),
    Zenoh(ZenohTransport),
    Loopback(LoopbackTransport),
}

impl AnyTransport {
    /// Open the configured transport.
    pub async fn connect(config: &BusConfig) -> Result<(Self, EventReceiver)> {
        match config.backend {
            Backend::Mqtt => {
                let (transport, events) = MqttTransport::connect(config).await?;
                Ok((Self::Mqtt(transport), events))
            }
            Backend::Zenoh => {
                let (transport, events) =
                    ZenohTransport::connect(&config.zenoh, config.delivery_buffer).await?;
                Ok((Self::Zenoh(transport), events))
            }
            Backend::Loopback => {
                let (transport, events) = LoopbackTransport::new(config.delivery_buffer);
                Ok((Self::Loopback(transport), events))
            }
        }
    }

    pub fn backend(&self) -> Backend {
        match self {
            Self::Mqtt(_) => Backend::Mqtt,
            Self::Zenoh(_) => Backend::Zenoh,
            Self::Loopback(_) => Backend::Loopback,
        }
    }
}

impl Transport for AnyTransport {
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<()> {
        match self {
            Self::Mqtt(t) => t.publish(topic, payload, qos, retain).await,
            Self::Zenoh(t) => t.publish(topic, payload, qos, retain).await,
            Self::Loopback(t) => t.publish(topic, payload, qos, retain).await,
        }
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        match self {
            Self::Mqtt(t) => t.subscribe(filter, qos).await,
            Self::Zenoh(t) => t.subscribe(filter, qos).await,
            Self::Loopback(t) => t.subscribe(filter, qos).await,
        }
    }

    async fn disconnect(&self, drain: Duration) -> Result<()> {
        match self {
            Self::Mqtt(t) => t.disconnect(drain).await,
            Self::Zenoh(t) => t.disconnect(drain).await,
            Self::Loopback(t) => t.disconnect(drain).await,
        }
    }
}

/// Reject empty topics up front so every backend reports them the same way.
pub(crate) fn ensure_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(BusError::publish(topic, "empty topic"));
    }
    Ok(())
}
