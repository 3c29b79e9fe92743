//! In-process transport.
//!
//! Publishes loop back to matching subscriptions without any network. Handy
//! for running the daemon without a broker and for exercising the bus client
//! in tests: connection loss, publish failures and foreign messages can all
//! be injected.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{BusError, Result};
use crate::topic::topic_matches;
use crate::transport::{
    EventReceiver, InboundMessage, QoS, Transport, TransportEvent, ensure_topic,
};

#[derive(Default)]
struct State {
    events: Option<mpsc::Sender<TransportEvent>>,
    filters: Vec<String>,
    published: Vec<InboundMessage>,
    failing: HashSet<Bytes>,
    publish_delay: Option<Duration>,
}

struct Inner {
    state: Mutex<State>,
    disconnects: AtomicUsize,
}

/// Loopback bus. Clones share the same state.
#[derive(Clone)]
pub struct LoopbackTransport {
    inner: Arc<Inner>,
}

impl LoopbackTransport {
    pub fn new(buffer: usize) -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::channel(buffer);
        let state = State {
            events: Some(tx),
            ..Default::default()
        };
        let transport = Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                disconnects: AtomicUsize::new(0),
            }),
        };
        (transport, rx)
    }

    /// Every message accepted by `publish`, in order.
    pub fn published(&self) -> Vec<InboundMessage> {
        self.inner.state.lock().published.clone()
    }

    /// Filters currently registered with the "broker".
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.state.lock().filters.clone()
    }

    /// Make every publish of exactly `payload` fail.
    pub fn fail_payload(&self, payload: impl Into<Bytes>) {
        self.inner.state.lock().failing.insert(payload.into());
    }

    /// Stall every publish for `delay` before it is accepted.
    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        self.inner.state.lock().publish_delay = delay;
    }

    /// Deliver a message as if another client had published it.
    ///
    /// Returns `false` when no registered filter matches `topic` or the
    /// transport is closed.
    pub async fn inject(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        let message = InboundMessage::new(topic, payload);
        self.deliver(message).await
    }

    /// Simulate a dropped session that comes straight back.
    ///
    /// Broker-side subscriptions are forgotten, as a clean-session broker
    /// would.
    pub async fn drop_connection(&self) {
        let events = {
            let mut state = self.inner.state.lock();
            state.filters.clear();
            state.events.clone()
        };

        if let Some(events) = events {
            let _ = events
                .send(TransportEvent::ConnectionLost("connection reset".to_string()))
                .await;
            let _ = events.send(TransportEvent::Reconnected).await;
        }
    }

    /// How many times `disconnect` has been called.
    pub fn disconnect_count(&self) -> usize {
        self.inner.disconnects.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().events.is_none()
    }

    async fn deliver(&self, message: InboundMessage) -> bool {
        let events = {
            let state = self.inner.state.lock();
            let matched = state
                .filters
                .iter()
                .any(|filter| topic_matches(filter, &message.topic));
            if !matched {
                return false;
            }
            match &state.events {
                Some(events) => events.clone(),
                None => return false,
            }
        };

        events.send(TransportEvent::Message(message)).await.is_ok()
    }
}

impl Transport for LoopbackTransport {
    async fn publish(&self, topic: &str, payload: Bytes, _qos: QoS, _retain: bool) -> Result<()> {
        ensure_topic(topic)?;

        let delay = {
            let state = self.inner.state.lock();
            if state.events.is_none() {
                return Err(BusError::Closed);
            }
            if state.failing.contains(&payload) {
                return Err(BusError::publish(topic, "rejected by loopback"));
            }
            state.publish_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let message = InboundMessage::new(topic, payload);
        self.inner.state.lock().published.push(message.clone());
        self.deliver(message).await;
        Ok(())
    }

    async fn subscribe(&self, filter: &str, _qos: QoS) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.events.is_none() {
            return Err(BusError::Closed);
        }
        if !state.filters.iter().any(|f| f == filter) {
            state.filters.push(filter.to_string());
        }
        Ok(())
    }

    async fn disconnect(&self, _drain: Duration) -> Result<()> {
        self.inner.disconnects.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.state.lock();
        state.filters.clear();
        state.events.take();
        Ok(())
    }
}
