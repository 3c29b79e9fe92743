//! MQTT transport built on `rumqttc`.
//!
//! The rumqttc event loop runs in its own task. It is the only place that
//! talks to the socket: publishes and subscriptions are queued through the
//! [`AsyncClient`] and flushed by the loop. When the loop reports an error it
//! is polled again after a back-off, which makes rumqttc open a fresh session
//! with the same options.
//!
//! QoS 1 publishes resolve only once the broker's PUBACK has been seen.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::transport::{
    EventReceiver, InboundMessage, QoS, Transport, TransportEvent, ensure_topic,
};

/// Default MQTT port when the broker address has none.
pub const DEFAULT_PORT: u16 = 1883;

/// Capacity of the rumqttc request queue.
const REQUEST_CAPACITY: usize = 64;

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        }
    }
}

/// Split a broker address into host and port.
///
/// Accepts `tcp://host:port`, `mqtt://host:port` or a bare `host[:port]`.
pub fn parse_broker(broker: &str) -> Result<(String, u16)> {
    let address = if broker.contains("://") {
        broker.to_string()
    } else {
        format!("tcp://{}", broker)
    };

    let url = Url::parse(&address)?;
    match url.scheme() {
        "tcp" | "mqtt" => {}
        other => {
            return Err(BusError::config(format!(
                "unsupported broker scheme '{}' (expected tcp or mqtt)",
                other
            )));
        }
    }

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| BusError::config(format!("broker address '{}' has no host", broker)))?;

    Ok((host.to_string(), url.port().unwrap_or(DEFAULT_PORT)))
}

/// Reconnection back-off: doubles from `initial` up to `max`.
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Matches QoS 1 publishes with their PUBACKs.
///
/// Packet ids are assigned inside the event loop, so waiters queue up in
/// request order and are bound to an id when the loop reports the outgoing
/// publish. Resends of an id that is already bound are ignored.
#[derive(Debug, Default)]
struct AckTracker {
    queued: VecDeque<oneshot::Sender<()>>,
    inflight: HashMap<u16, oneshot::Sender<()>>,
    // A publish whose id collided with one still awaiting its ack
    deferred: Option<(u16, oneshot::Sender<()>)>,
}

impl AckTracker {
    fn enqueue(&mut self, waiter: oneshot::Sender<()>) {
        self.queued.push_back(waiter);
    }

    fn on_outgoing_publish(&mut self, pkid: u16) {
        if pkid == 0 || self.inflight.contains_key(&pkid) || self.is_deferred(pkid) {
            return;
        }
        if let Some(waiter) = self.queued.pop_front() {
            self.inflight.insert(pkid, waiter);
        }
    }

    fn on_await_ack(&mut self, pkid: u16) {
        if let Some(waiter) = self.queued.pop_front() {
            self.deferred = Some((pkid, waiter));
        }
    }

    fn on_puback(&mut self, pkid: u16) {
        if let Some(waiter) = self.inflight.remove(&pkid) {
            let _ = waiter.send(());
        }
        if self.is_deferred(pkid) {
            if let Some((id, waiter)) = self.deferred.take() {
                self.inflight.insert(id, waiter);
            }
        }
    }

    fn is_deferred(&self, pkid: u16) -> bool {
        matches!(&self.deferred, Some((id, _)) if *id == pkid)
    }

    /// Drop every waiter; their publishes fail as unacknowledged.
    fn clear(&mut self) {
        self.queued.clear();
        self.inflight.clear();
        self.deferred = None;
    }
}

/// A session with an MQTT broker.
pub struct MqttTransport {
    broker: String,
    client: AsyncClient,
    acks: Arc<Mutex<AckTracker>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Connect and wait for the broker's CONNACK.
    ///
    /// Fails with [`BusError::Connect`] if the broker is unreachable, refuses
    /// the session, or does not answer within the connect timeout. Later
    /// reconnection handshakes are bounded by the ping timeout instead.
    pub async fn connect(config: &BusConfig) -> Result<(Self, EventReceiver)> {
        let (host, port) = parse_broker(&config.broker)?;

        let mut options = MqttOptions::new(config.client_id.clone(), host.clone(), port);
        options.set_keep_alive(config.keep_alive());
        options.set_clean_session(true);

        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        event_loop
            .network_options
            .set_connection_timeout(config.connect_timeout_secs);

        info!(
            broker = %config.broker,
            client_id = %config.client_id,
            keep_alive_secs = config.keep_alive_secs,
            "Connecting to MQTT broker"
        );

        match tokio::time::timeout(config.connect_timeout(), wait_for_connack(&mut event_loop))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(BusError::connect(&config.broker, e)),
            Err(_) => {
                return Err(BusError::connect(
                    &config.broker,
                    format!("no CONNACK within {}s", config.connect_timeout_secs),
                ));
            }
        }

        info!(host = %host, port, "Connected to MQTT broker");

        event_loop
            .network_options
            .set_connection_timeout(config.ping_timeout_secs);

        let (tx, rx) = mpsc::channel(config.delivery_buffer);
        let acks = Arc::new(Mutex::new(AckTracker::default()));
        let backoff = Backoff::new(config.reconnect_delay(), config.max_reconnect_delay());
        let handle = tokio::spawn(run_event_loop(event_loop, tx, Arc::clone(&acks), backoff));

        Ok((
            Self {
                broker: config.broker.clone(),
                client,
                acks,
                event_loop: Mutex::new(Some(handle)),
            },
            rx,
        ))
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> std::result::Result<(), rumqttc::ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = event_loop.poll().await? {
            return Ok(());
        }
    }
}

/// Drive the rumqttc event loop until the session is closed on purpose or
/// nobody listens to the events any more.
async fn run_event_loop(
    mut event_loop: EventLoop,
    events: mpsc::Sender<TransportEvent>,
    acks: Arc<Mutex<AckTracker>>,
    mut backoff: Backoff,
) {
    let mut connected = true;

    loop {
        match event_loop.poll().await {
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                acks.lock().on_outgoing_publish(pkid);
            }
            Ok(Event::Outgoing(Outgoing::AwaitAck(pkid))) => {
                acks.lock().on_await_ack(pkid);
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                acks.lock().on_puback(ack.pkid);
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                backoff.reset();
                if !connected {
                    connected = true;
                    if events.send(TransportEvent::Reconnected).await.is_err() {
                        break;
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                };
                if events.send(TransportEvent::Message(message)).await.is_err() {
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if connected {
                    connected = false;
                    if events
                        .send(TransportEvent::ConnectionLost(e.to_string()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }

                let delay = backoff.next_delay();
                warn!(
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "MQTT connection error"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    acks.lock().clear();
    debug!("MQTT event loop stopped");
}

impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<()> {
        ensure_topic(topic)?;

        if qos == QoS::AtMostOnce {
            return self
                .client
                .publish(topic, qos.into(), retain, payload.to_vec())
                .await
                .map_err(|e| BusError::publish(topic, e));
        }

        // Queue the request and its waiter under one lock so waiters stay in
        // request order.
        let (tx, rx) = oneshot::channel();
        {
            let mut acks = self.acks.lock();
            self.client
                .try_publish(topic, qos.into(), retain, payload.to_vec())
                .map_err(|e| BusError::publish(topic, e))?;
            acks.enqueue(tx);
        }

        rx.await
            .map_err(|_| BusError::publish(topic, "connection closed before PUBACK"))
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        self.client
            .subscribe(filter, qos.into())
            .await
            .map_err(|e| BusError::subscribe(filter, e))
    }

    async fn disconnect(&self, drain: Duration) -> Result<()> {
        let requested = tokio::time::timeout(drain, self.client.disconnect()).await;

        let handle = self.event_loop.lock().take();
        let Some(mut handle) = handle else {
            return Ok(());
        };

        match requested {
            Ok(Ok(())) => {
                if tokio::time::timeout(drain, &mut handle).await.is_err() {
                    warn!(
                        drain_ms = drain.as_millis() as u64,
                        "MQTT drain timed out, closing connection"
                    );
                    handle.abort();
                }
                Ok(())
            }
            Ok(Err(e)) => {
                handle.abort();
                Err(BusError::Disconnect(e.to_string()))
            }
            Err(_) => {
                handle.abort();
                Err(BusError::Disconnect(
                    "request queue full, connection force-closed".to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

    fn local_config(addr: SocketAddr) -> BusConfig {
        BusConfig {
            broker: format!("tcp://{}", addr),
            reconnect_delay_ms: 50,
            max_reconnect_delay_ms: 200,
            ..Default::default()
        }
    }

    /// Accept one client and answer its CONNECT after `delay`.
    async fn accept_session(listener: &TcpListener, delay: Duration) -> TcpStream {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 256];
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(buf[0], 0x10, "expected CONNECT, got {:?}", &buf[..n]);
        tokio::time::sleep(delay).await;
        socket.write_all(&CONNACK).await.unwrap();
        socket
    }

    #[test]
    fn test_ack_tracker_binds_in_request_order() {
        let mut acks = AckTracker::default();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        acks.enqueue(tx1);
        acks.enqueue(tx2);

        // QoS 0 publishes carry no id
        acks.on_outgoing_publish(0);
        acks.on_outgoing_publish(1);
        acks.on_outgoing_publish(2);
        // resend after reconnect
        acks.on_outgoing_publish(1);

        acks.on_puback(2);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());

        acks.on_puback(1);
        assert!(rx1.try_recv().is_ok());
        assert!(acks.inflight.is_empty());
    }

    #[test]
    fn test_ack_tracker_collision_waits_for_release() {
        let mut acks = AckTracker::default();
        let (old_tx, mut old_rx) = oneshot::channel();
        let (new_tx, mut new_rx) = oneshot::channel();
        acks.enqueue(old_tx);
        acks.on_outgoing_publish(7);

        acks.enqueue(new_tx);
        acks.on_await_ack(7);
        // rumqttc writes the held publish before reporting the ack that freed its id
        acks.on_outgoing_publish(7);
        acks.on_puback(7);
        assert!(old_rx.try_recv().is_ok());
        assert!(new_rx.try_recv().is_err());

        acks.on_puback(7);
        assert!(new_rx.try_recv().is_ok());
    }

    #[test]
    fn test_ack_tracker_clear_fails_waiters() {
        let mut acks = AckTracker::default();
        let (tx, mut rx) = oneshot::channel();
        acks.enqueue(tx);
        acks.clear();

        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_slow_connack_is_accepted_within_connect_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = local_config(listener.local_addr().unwrap());
        assert!(config.ping_timeout_secs < 2 && config.connect_timeout_secs > 2);

        let broker =
            tokio::spawn(async move { accept_session(&listener, Duration::from_secs(2)).await });

        let started = Instant::now();
        let (_transport, _events) = MqttTransport::connect(&config)
            .await
            .expect("broker answered within the connect timeout");
        assert!(started.elapsed() >= Duration::from_secs(2));

        let _socket = broker.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_connack_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = BusConfig {
            connect_timeout_secs: 1,
            ..local_config(listener.local_addr().unwrap())
        };

        // Accept and stay silent
        let broker = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let result = MqttTransport::connect(&config).await;
        assert!(matches!(result, Err(BusError::Connect { .. })));
        let _socket = broker.await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_loss_and_reconnect_are_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = local_config(listener.local_addr().unwrap());

        let (drop_tx, drop_rx) = oneshot::channel::<()>();
        let broker = tokio::spawn(async move {
            let first = accept_session(&listener, Duration::ZERO).await;
            drop_rx.await.unwrap();
            drop(first);
            accept_session(&listener, Duration::ZERO).await
        });

        let (_transport, mut events) = MqttTransport::connect(&config).await.unwrap();
        drop_tx.send(()).unwrap();

        let lost = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        assert!(matches!(lost, Some(TransportEvent::ConnectionLost(_))));

        let back = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        assert!(matches!(back, Some(TransportEvent::Reconnected)));

        let _socket = broker.await.unwrap();
    }

    #[tokio::test]
    async fn test_qos1_publish_waits_for_puback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = BusConfig {
            qos: QoS::AtLeastOnce,
            ..local_config(listener.local_addr().unwrap())
        };

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let broker = tokio::spawn(async move {
            let mut socket = accept_session(&listener, Duration::ZERO).await;
            let mut buf = [0u8; 256];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(buf[0] & 0xF0, 0x30, "expected PUBLISH, got {:?}", &buf[..n]);
            let topic_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
            let pkid = [buf[4 + topic_len], buf[5 + topic_len]];

            release_rx.await.unwrap();
            socket
                .write_all(&[0x40, 0x02, pkid[0], pkid[1]])
                .await
                .unwrap();
            socket
        });

        let (transport, _events) = MqttTransport::connect(&config).await.unwrap();
        let transport = Arc::new(transport);
        let publisher = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                transport
                    .publish(
                        "meshspy/raw",
                        Bytes::from_static(b"T=21.5"),
                        QoS::AtLeastOnce,
                        false,
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!publisher.is_finished());

        release_tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), publisher)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());

        let _socket = broker.await.unwrap();
    }

    #[test]
    fn test_parse_broker() {
        assert_eq!(
            parse_broker("tcp://localhost:1883").unwrap(),
            ("localhost".to_string(), 1883)
        );
        assert_eq!(
            parse_broker("mqtt://broker.lan:1884").unwrap(),
            ("broker.lan".to_string(), 1884)
        );
        assert_eq!(
            parse_broker("192.168.1.10").unwrap(),
            ("192.168.1.10".to_string(), DEFAULT_PORT)
        );
        assert_eq!(
            parse_broker("tcp://mosquitto").unwrap(),
            ("mosquitto".to_string(), DEFAULT_PORT)
        );
    }

    #[test]
    fn test_parse_broker_rejects() {
        assert!(parse_broker("http://localhost:1883").is_err());
        assert!(parse_broker("tcp://:1883").is_err());
        assert!(parse_broker("").is_err());
    }

    #[test]
    fn test_backoff() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_connect_refused_is_an_error() {
        // Nothing listens on port 1 locally
        let config = BusConfig {
            broker: "tcp://127.0.0.1:1".to_string(),
            connect_timeout_secs: 2,
            ..Default::default()
        };

        let result = MqttTransport::connect(&config).await;
        assert!(matches!(result, Err(BusError::Connect { .. })));
    }
}
