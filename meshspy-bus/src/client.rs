//! Bus client: publish, subscribe and disconnect over any [`Transport`].
//!
//! A single driver task owns the transport's event stream. It fans inbound
//! messages out to the matching subscriptions, tracks the connection state
//! and re-issues every subscription after the transport reconnects.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::topic::{topic_matches, validate_filter, validate_topic};
use crate::transport::{EventReceiver, InboundMessage, QoS, Transport, TransportEvent};

/// Connection state as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// The session was lost and the transport is retrying.
    Reconnecting,
    /// Disconnected, or the transport gave up.
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Tunables the client needs from [`BusConfig`].
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub qos: QoS,
    pub publish_timeout: Duration,
    pub delivery_buffer: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from(&BusConfig::default())
    }
}

impl From<&BusConfig> for ClientOptions {
    fn from(config: &BusConfig) -> Self {
        Self {
            qos: config.qos,
            publish_timeout: config.publish_timeout(),
            delivery_buffer: config.delivery_buffer,
        }
    }
}

/// Publish counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub published: u64,
    pub failed: u64,
}

struct Route {
    filter: String,
    tx: mpsc::Sender<InboundMessage>,
}

type Routes = Arc<Mutex<Vec<Route>>>;

/// Messages delivered for one subscription filter, in arrival order.
#[derive(Debug)]
pub struct Subscription {
    filter: String,
    rx: mpsc::Receiver<InboundMessage>,
}

impl Subscription {
    /// Next message, or `None` once the client is disconnected.
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }
}

/// Connection to the pub/sub bus.
///
/// Shared between tasks as `Arc<BusClient<T>>`; every method takes `&self`.
pub struct BusClient<T: Transport> {
    transport: Arc<T>,
    options: ClientOptions,
    routes: Routes,
    state: watch::Receiver<ConnectionState>,
    driver: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    published: AtomicU64,
    failed: AtomicU64,
}

impl<T: Transport> BusClient<T> {
    /// Wrap a connected transport and start dispatching its events.
    pub fn new(transport: T, events: EventReceiver, options: ClientOptions) -> Self {
        let transport = Arc::new(transport);
        let routes: Routes = Arc::new(Mutex::new(Vec::new()));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);

        let driver = tokio::spawn(drive(
            Arc::clone(&transport),
            events,
            Arc::clone(&routes),
            state_tx,
            options.qos,
        ));

        Self {
            transport,
            options,
            routes,
            state: state_rx,
            driver: Mutex::new(Some(driver)),
            closed: AtomicBool::new(false),
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Publish with the configured QoS, not retained.
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.publish_with(topic, payload.into(), self.options.qos, false)
            .await
    }

    /// Publish and wait for the transport to accept the message, bounded by
    /// the publish timeout.
    pub async fn publish_with(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        validate_topic(topic)?;

        let result = match tokio::time::timeout(
            self.options.publish_timeout,
            self.transport.publish(topic, payload, qos, retain),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BusError::PublishTimeout {
                topic: topic.to_string(),
                timeout_ms: self.options.publish_timeout.as_millis() as u64,
            }),
        };

        match &result {
            Ok(()) => self.published.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    /// Subscribe to `filter`.
    ///
    /// The subscription survives reconnects: the client re-issues it to the
    /// broker whenever the transport comes back.
    pub async fn subscribe(&self, filter: &str) -> Result<Subscription> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        validate_filter(filter)?;

        let (tx, rx) = mpsc::channel(self.options.delivery_buffer);
        // Register before asking the broker so no early message is lost
        self.routes.lock().push(Route {
            filter: filter.to_string(),
            tx: tx.clone(),
        });

        if let Err(e) = self.transport.subscribe(filter, self.options.qos).await {
            self.routes.lock().retain(|route| !route.tx.same_channel(&tx));
            return Err(e);
        }

        info!(filter = %filter, "Subscribed");
        Ok(Subscription {
            filter: filter.to_string(),
            rx,
        })
    }

    /// Close the connection, waiting at most `drain` for in-flight traffic.
    ///
    /// Safe to call more than once; only the first call does anything.
    pub async fn disconnect(&self, drain: Duration) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(drain_ms = drain.as_millis() as u64, "Disconnecting from bus");
        let result = self.transport.disconnect(drain).await;

        // Ends every subscription stream
        self.routes.lock().clear();

        let driver = self.driver.lock().take();
        if let Some(mut driver) = driver {
            if tokio::time::timeout(drain, &mut driver).await.is_err() {
                debug!("Bus event driver still busy, aborting");
                driver.abort();
            }
        }

        if let Err(e) = &result {
            warn!(error = %e, "Bus disconnect was not clean");
        }
        result
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_closed() {
            return ConnectionState::Closed;
        }
        *self.state.borrow()
    }

    /// Watch connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PublishStats {
        PublishStats {
            published: self.published.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T: Transport> Drop for BusClient<T> {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.abort();
        }
    }
}

async fn drive<T: Transport>(
    transport: Arc<T>,
    mut events: EventReceiver,
    routes: Routes,
    state: watch::Sender<ConnectionState>,
    qos: QoS,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(message) => dispatch(&routes, message).await,
            TransportEvent::ConnectionLost(reason) => {
                warn!(reason = %reason, "Bus connection lost, reconnecting");
                state.send_replace(ConnectionState::Reconnecting);
            }
            TransportEvent::Reconnected => {
                info!("Bus connection restored");
                state.send_replace(ConnectionState::Connected);

                let filters = active_filters(&routes);
                if !filters.is_empty() {
                    // Off the driver task: a transport may need the event
                    // stream drained before it can acknowledge
                    tokio::spawn(resubscribe(Arc::clone(&transport), filters, qos));
                }
            }
        }
    }

    state.send_replace(ConnectionState::Closed);
    debug!("Bus event stream ended");
}

async fn dispatch(routes: &Routes, message: InboundMessage) {
    let targets: Vec<mpsc::Sender<InboundMessage>> = routes
        .lock()
        .iter()
        .filter(|route| topic_matches(&route.filter, &message.topic))
        .map(|route| route.tx.clone())
        .collect();

    if targets.is_empty() {
        debug!(topic = %message.topic, "No subscription for message");
        return;
    }

    let mut dropped = false;
    for tx in targets {
        if tx.send(message.clone()).await.is_err() {
            dropped = true;
        }
    }

    if dropped {
        routes.lock().retain(|route| !route.tx.is_closed());
    }
}

fn active_filters(routes: &Routes) -> Vec<String> {
    let mut filters: Vec<String> = Vec::new();
    for route in routes.lock().iter() {
        if !route.tx.is_closed() && !filters.contains(&route.filter) {
            filters.push(route.filter.clone());
        }
    }
    filters
}

async fn resubscribe<T: Transport>(transport: Arc<T>, filters: Vec<String>, qos: QoS) {
    for filter in filters {
        match transport.subscribe(&filter, qos).await {
            Ok(()) => debug!(filter = %filter, "Re-subscribed"),
            Err(e) => warn!(filter = %filter, error = %e, "Re-subscribe failed"),
        }
    }
}
