//! Zenoh transport.
//!
//! Zenoh keeps its own sessions alive and re-declares subscribers after a
//! router comes back, so this transport never reports `ConnectionLost`.

use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use zenoh::Session;
use zenoh::sample::SampleKind;

use crate::config::ZenohConfig;
use crate::error::{BusError, Result};
use crate::topic::to_key_expr;
use crate::transport::{
    EventReceiver, InboundMessage, QoS, Transport, TransportEvent, ensure_topic,
};

/// Build a Zenoh configuration from [`ZenohConfig`].
fn session_config(config: &ZenohConfig) -> Result<zenoh::Config> {
    let mut zenoh_config = zenoh::Config::default();

    let mode_str = match config.mode.as_str() {
        "client" | "peer" | "router" => format!("\"{}\"", config.mode),
        other => {
            return Err(BusError::config(format!(
                "Invalid Zenoh mode: '{}'. Expected 'client', 'peer', or 'router'",
                other
            )));
        }
    };

    zenoh_config
        .insert_json5("mode", &mode_str)
        .map_err(|e| BusError::config(format!("Failed to set mode: {}", e)))?;

    if !config.connect.is_empty() {
        let endpoints_json = serde_json::to_string(&config.connect)?;
        zenoh_config
            .insert_json5("connect/endpoints", &endpoints_json)
            .map_err(|e| BusError::config(format!("Failed to set connect endpoints: {}", e)))?;
    }

    if !config.listen.is_empty() {
        let endpoints_json = serde_json::to_string(&config.listen)?;
        zenoh_config
            .insert_json5("listen/endpoints", &endpoints_json)
            .map_err(|e| BusError::config(format!("Failed to set listen endpoints: {}", e)))?;
    }

    Ok(zenoh_config)
}

/// A Zenoh session used as the bus.
pub struct ZenohTransport {
    session: Session,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl ZenohTransport {
    /// Open a Zenoh session.
    pub async fn connect(config: &ZenohConfig, buffer: usize) -> Result<(Self, EventReceiver)> {
        let zenoh_config = session_config(config)?;

        info!(
            mode = %config.mode,
            connect = ?config.connect,
            listen = ?config.listen,
            "Connecting to Zenoh"
        );

        let session = zenoh::open(zenoh_config)
            .await
            .map_err(|e| BusError::connect(config.connect.join(","), e))?;

        info!(zid = %session.zid(), "Connected to Zenoh");

        let (tx, rx) = mpsc::channel(buffer);
        Ok((
            Self {
                session,
                events: Mutex::new(Some(tx)),
                forwarders: Mutex::new(Vec::new()),
            },
            rx,
        ))
    }
}

impl Transport for ZenohTransport {
    async fn publish(&self, topic: &str, payload: Bytes, _qos: QoS, _retain: bool) -> Result<()> {
        ensure_topic(topic)?;
        self.session
            .put(topic, payload.to_vec())
            .await
            .map_err(|e| BusError::publish(topic, e))
    }

    async fn subscribe(&self, filter: &str, _qos: QoS) -> Result<()> {
        let events = self.events.lock().clone().ok_or(BusError::Closed)?;
        let key_expr = to_key_expr(filter);

        let subscriber = self
            .session
            .declare_subscriber(key_expr.clone())
            .await
            .map_err(|e| BusError::subscribe(filter, e))?;

        debug!(filter = %filter, key_expr = %key_expr, "Declared Zenoh subscriber");

        let handle = tokio::spawn(async move {
            while let Ok(sample) = subscriber.recv_async().await {
                if sample.kind() == SampleKind::Delete {
                    trace!(key = %sample.key_expr(), "Ignoring delete sample");
                    continue;
                }

                let message = InboundMessage::new(
                    sample.key_expr().as_str(),
                    Bytes::from(sample.payload().to_bytes().into_owned()),
                );
                if events.send(TransportEvent::Message(message)).await.is_err() {
                    break;
                }
            }
        });
        self.forwarders.lock().push(handle);

        Ok(())
    }

    async fn disconnect(&self, drain: Duration) -> Result<()> {
        for handle in self.forwarders.lock().drain(..) {
            handle.abort();
        }
        // Dropping the sender ends the event stream
        self.events.lock().take();

        match tokio::time::timeout(drain, self.session.close()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BusError::Disconnect(e.to_string())),
            Err(_) => {
                warn!(
                    drain_ms = drain.as_millis() as u64,
                    "Zenoh session close timed out"
                );
                Ok(())
            }
        }
    }
}
