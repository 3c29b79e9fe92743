//! End-to-end pipeline runs over the loopback bus, in-memory devices and a
//! temporary SQLite store.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use meshspy::pipeline::{Pipeline, PipelineError, PipelineOptions, PipelineState};
use meshspy::serial::{DeviceOpener, SerialError, SerialReader};
use meshspy::storage::SqliteStore;
use meshspy_bus::{BusClient, ClientOptions, LoopbackTransport};
use meshspy_common::{NodeTelemetry, encode};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::watch;

/// Hands out prepared in-memory devices, one per open.
struct QueueOpener {
    devices: Mutex<VecDeque<DuplexStream>>,
}

impl QueueOpener {
    fn new(devices: Vec<DuplexStream>) -> Self {
        Self {
            devices: Mutex::new(devices.into()),
        }
    }
}

impl DeviceOpener for QueueOpener {
    type Device = DuplexStream;

    async fn open(&self) -> Result<SerialReader<DuplexStream>, SerialError> {
        let device = self.devices.lock().pop_front();
        device
            .map(|stream| SerialReader::from_reader("test-port", stream))
            .ok_or_else(|| SerialError::DeviceUnavailable {
                port: "test-port".to_string(),
                message: "no such device".to_string(),
            })
    }

    fn port(&self) -> &str {
        "test-port"
    }
}

struct Harness {
    _dir: TempDir,
    bus: Arc<BusClient<LoopbackTransport>>,
    store: Arc<SqliteStore>,
}

impl Harness {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path().join("meshspy.db")).await.unwrap();
        let (transport, events) = LoopbackTransport::new(64);
        let bus = BusClient::new(transport, events, ClientOptions::default());
        Self {
            _dir: dir,
            bus: Arc::new(bus),
            store: Arc::new(store),
        }
    }

    fn transport(&self) -> &LoopbackTransport {
        self.bus.transport()
    }

    fn pipeline(
        &self,
        opener: QueueOpener,
        options: PipelineOptions,
    ) -> Pipeline<QueueOpener, LoopbackTransport, SqliteStore> {
        Pipeline::new(
            opener,
            Arc::clone(&self.bus),
            Arc::clone(&self.store),
            options,
        )
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn wait_for_count(store: &SqliteStore, expected: i64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.count().await.unwrap() < expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("records not stored in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lines_are_forwarded_in_order() {
    let harness = Harness::new().await;
    let (mut device, host) = tokio::io::duplex(1024);
    let pipeline = harness.pipeline(QueueOpener::new(vec![host]), PipelineOptions::default());
    let mut state = pipeline.state();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(pipeline.run(shutdown_rx));
    state
        .wait_for(|s| *s == PipelineState::Running)
        .await
        .unwrap();

    device.write_all(b"T=21.5\nT=21.7\n").await.unwrap();
    wait_until(|| harness.transport().published().len() == 2).await;

    shutdown_tx.send(true).unwrap();
    let stats = run.await.unwrap().unwrap();

    let published = harness.transport().published();
    assert_eq!(published[0].topic, "meshspy/raw");
    assert_eq!(&published[0].payload[..], b"T=21.5");
    assert_eq!(&published[1].payload[..], b"T=21.7");
    assert_eq!(stats.lines_read, 2);
    assert_eq!(stats.published, 2);
    assert_eq!(*state.borrow(), PipelineState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_bus_and_releases_device() {
    let harness = Harness::new().await;
    let (mut device, host) = tokio::io::duplex(1024);
    let pipeline = harness.pipeline(QueueOpener::new(vec![host]), PipelineOptions::default());
    let mut state = pipeline.state();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(pipeline.run(shutdown_rx));
    state
        .wait_for(|s| *s == PipelineState::Running)
        .await
        .unwrap();

    shutdown_tx.send(true).unwrap();
    assert!(run.await.unwrap().is_ok());

    assert!(harness.bus.is_closed());
    assert_eq!(harness.transport().disconnect_count(), 1);

    // The reader side has been dropped
    let err = device.write_all(b"late\n").await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_telemetry_is_stored() {
    let harness = Harness::new().await;
    let (_device, host) = tokio::io::duplex(1024);
    let pipeline = harness.pipeline(QueueOpener::new(vec![host]), PipelineOptions::default());
    let mut state = pipeline.state();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(pipeline.run(shutdown_rx));
    state
        .wait_for(|s| *s == PipelineState::Running)
        .await
        .unwrap();

    let record = NodeTelemetry::new("n1", 1_700_000_000, 21.5, 40.0);
    assert!(harness.transport().inject("meshspy/nodes", encode(&record)).await);
    wait_for_count(&harness.store, 1).await;

    shutdown_tx.send(true).unwrap();
    let stats = run.await.unwrap().unwrap();

    let records = harness.store.records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].node_id, "n1");
    assert_eq!(records[0].timestamp.timestamp(), 1_700_000_000);
    assert_eq!(records[0].temperature, 21.5);
    assert_eq!(records[0].humidity, 40.0);
    assert_eq!(stats.stored, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_messages_are_dropped() {
    let harness = Harness::new().await;
    let (_device, host) = tokio::io::duplex(1024);
    let pipeline = harness.pipeline(QueueOpener::new(vec![host]), PipelineOptions::default());
    let mut state = pipeline.state();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(pipeline.run(shutdown_rx));
    state
        .wait_for(|s| *s == PipelineState::Running)
        .await
        .unwrap();

    let valid = encode(&NodeTelemetry::new("n2", 1_700_000_500, 19.0, 55.5));
    let truncated = valid[..valid.len() - 1].to_vec();

    let transport = harness.transport();
    assert!(transport.inject("meshspy/nodes", &b"T=21.5"[..]).await);
    assert!(transport.inject("meshspy/nodes", valid.clone()).await);
    assert!(transport.inject("meshspy/nodes", truncated).await);
    assert!(transport.inject("meshspy/nodes", Vec::<u8>::new()).await);
    assert!(transport.inject("meshspy/nodes", valid).await);
    wait_for_count(&harness.store, 2).await;

    shutdown_tx.send(true).unwrap();
    let stats = run.await.unwrap().unwrap();

    assert_eq!(stats.received, 5);
    assert_eq!(stats.malformed, 3);
    assert_eq!(stats.stored, 2);
    assert_eq!(harness.store.count().await.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_storage_resumes_after_reconnect() {
    let harness = Harness::new().await;
    let (_device, host) = tokio::io::duplex(1024);
    let pipeline = harness.pipeline(QueueOpener::new(vec![host]), PipelineOptions::default());
    let mut state = pipeline.state();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(pipeline.run(shutdown_rx));
    state
        .wait_for(|s| *s == PipelineState::Running)
        .await
        .unwrap();

    let transport = harness.transport().clone();
    transport.drop_connection().await;
    wait_until(|| transport.subscriptions() == vec!["meshspy/nodes".to_string()]).await;

    let record = NodeTelemetry::new("n3", 1_700_001_000, 22.0, 41.0);
    assert!(transport.inject("meshspy/nodes", encode(&record)).await);
    wait_for_count(&harness.store, 1).await;

    shutdown_tx.send(true).unwrap();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_device_loss_without_reopen_stops_pipeline() {
    let harness = Harness::new().await;
    let (mut device, host) = tokio::io::duplex(1024);
    let pipeline = harness.pipeline(QueueOpener::new(vec![host]), PipelineOptions::default());

    device.write_all(b"last words\n").await.unwrap();
    drop(device);

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let result = pipeline.run(shutdown_rx).await;

    assert!(matches!(
        result,
        Err(PipelineError::Serial(SerialError::DeviceClosed { .. }))
    ));
    assert!(harness.bus.is_closed());
    assert_eq!(harness.transport().published().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_device_is_reopened_after_loss() {
    let harness = Harness::new().await;
    let (mut first, first_host) = tokio::io::duplex(1024);
    let (mut second, second_host) = tokio::io::duplex(1024);
    let options = PipelineOptions {
        reopen_interval: Some(Duration::from_millis(10)),
        ..Default::default()
    };
    let pipeline = harness.pipeline(QueueOpener::new(vec![first_host, second_host]), options);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(pipeline.run(shutdown_rx));

    first.write_all(b"before\n").await.unwrap();
    wait_until(|| harness.transport().published().len() == 1).await;
    drop(first);

    second.write_all(b"after\n").await.unwrap();
    wait_until(|| harness.transport().published().len() == 2).await;

    shutdown_tx.send(true).unwrap();
    let stats = run.await.unwrap().unwrap();

    let payloads: Vec<_> = harness
        .transport()
        .published()
        .into_iter()
        .map(|m| m.payload)
        .collect();
    assert_eq!(payloads, vec!["before", "after"]);
    assert_eq!(stats.lines_read, 2);
}

#[tokio::test]
async fn test_missing_device_is_fatal() {
    let harness = Harness::new().await;
    let pipeline = harness.pipeline(QueueOpener::new(Vec::new()), PipelineOptions::default());
    let state = pipeline.state();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let result = pipeline.run(shutdown_rx).await;

    assert!(matches!(
        result,
        Err(PipelineError::Serial(SerialError::DeviceUnavailable { .. }))
    ));
    assert!(harness.bus.is_closed());
    assert_eq!(*state.borrow(), PipelineState::Stopped);
}
