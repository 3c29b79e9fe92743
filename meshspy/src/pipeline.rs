//! Pipeline orchestration.
//!
//! Two flows share one bus client:
//!
//! ```text
//! serial device --lines--> publish(raw topic)
//! subscribe(telemetry topic) --decode--> sink.append
//! ```
//!
//! The orchestrator moves through `Starting -> Running -> Draining -> Stopped`.
//! On every exit path the bus is disconnected and the device released.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use meshspy_bus::{BusClient, BusError, InboundMessage, Subscription, Transport};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::serial::{DeviceOpener, RawLine, SerialError, SerialReader};
use crate::storage::{StorageError, TelemetrySink};

/// Orchestrator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Errors that end a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Serial(#[from] SerialError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Flow task failed: {0}")]
    Task(String),
}

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub raw_topic: String,
    pub telemetry_topic: String,
    /// Bounded wait for in-flight bus traffic on disconnect.
    pub drain_timeout: Duration,
    /// How long the flows get to finish once draining starts.
    pub shutdown_grace: Duration,
    /// Delay between reopen attempts after device loss; `None` stops the
    /// pipeline instead.
    pub reopen_interval: Option<Duration>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            raw_topic: meshspy_bus::DEFAULT_RAW_TOPIC.to_string(),
            telemetry_topic: meshspy_bus::DEFAULT_TELEMETRY_TOPIC.to_string(),
            drain_timeout: Duration::from_millis(250),
            shutdown_grace: Duration::from_millis(1000),
            reopen_interval: None,
        }
    }
}

/// Flow counters, shared by both flows.
#[derive(Debug, Default)]
pub struct PipelineStats {
    lines_read: AtomicU64,
    published: AtomicU64,
    publish_failed: AtomicU64,
    received: AtomicU64,
    stored: AtomicU64,
    malformed: AtomicU64,
    store_failed: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub lines_read: u64,
    pub published: u64,
    pub publish_failed: u64,
    pub received: u64,
    pub stored: u64,
    pub malformed: u64,
    pub store_failed: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            lines_read: self.lines_read.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            publish_failed: self.publish_failed.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            store_failed: self.store_failed.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Publish every device line on `topic` until `stop` fires or the device fails.
///
/// A failed publish is logged and the next line is read; nothing is retried.
/// Lines read after the bus has closed are dropped quietly.
pub async fn forward_lines<R, T>(
    reader: &mut SerialReader<R>,
    bus: &BusClient<T>,
    topic: &str,
    stop: &mut watch::Receiver<bool>,
    stats: &PipelineStats,
) -> Result<(), SerialError>
where
    R: tokio::io::AsyncRead + Unpin,
    T: Transport,
{
    reader
        .read_loop(stop, move |line: RawLine| {
            bump(&stats.lines_read);
            async move {
                let len = line.len();
                match bus.publish(topic, line.bytes).await {
                    Ok(()) => {
                        bump(&stats.published);
                        debug!(topic = %topic, bytes = len, "Line published");
                    }
                    // The bus closes first when draining; lines still in
                    // flight are shutdown traffic, not failures.
                    Err(BusError::Closed) => {
                        debug!(topic = %topic, bytes = len, "Bus closed, line not published");
                    }
                    Err(e) => {
                        bump(&stats.publish_failed);
                        warn!(topic = %topic, bytes = len, error = %e, "Failed to publish line");
                    }
                }
            }
        })
        .await
}

/// Decode and store one inbound message. Failures are logged and the
/// message dropped.
pub async fn store_message<S: TelemetrySink>(
    message: &InboundMessage,
    sink: &S,
    stats: &PipelineStats,
) {
    bump(&stats.received);

    let record = match meshspy_common::decode(&message.payload) {
        Ok(record) => record,
        Err(e) => {
            bump(&stats.malformed);
            warn!(
                topic = %message.topic,
                bytes = message.payload.len(),
                error = %e,
                "Dropping malformed telemetry"
            );
            return;
        }
    };

    match sink.append(&record).await {
        Ok(stored) => {
            bump(&stats.stored);
            debug!(
                topic = %message.topic,
                id = stored.id,
                record = %record,
                "Telemetry recorded"
            );
        }
        Err(e) => {
            bump(&stats.store_failed);
            warn!(
                topic = %message.topic,
                bytes = message.payload.len(),
                error = %e,
                "Failed to store telemetry"
            );
        }
    }
}

/// Consume a subscription until the bus closes it.
pub async fn store_messages<S: TelemetrySink>(
    subscription: &mut Subscription,
    sink: &S,
    stats: &PipelineStats,
) {
    while let Some(message) = subscription.recv().await {
        store_message(&message, sink, stats).await;
    }
    debug!(filter = %subscription.filter(), "Telemetry subscription closed");
}

/// The serial-to-bus and bus-to-storage flows and their lifecycle.
pub struct Pipeline<O, T, S>
where
    O: DeviceOpener,
    T: Transport,
    S: TelemetrySink,
{
    opener: O,
    bus: Arc<BusClient<T>>,
    sink: Arc<S>,
    options: PipelineOptions,
    state: watch::Sender<PipelineState>,
    stats: Arc<PipelineStats>,
}

impl<O, T, S> Pipeline<O, T, S>
where
    O: DeviceOpener,
    T: Transport,
    S: TelemetrySink,
{
    pub fn new(opener: O, bus: Arc<BusClient<T>>, sink: Arc<S>, options: PipelineOptions) -> Self {
        let (state, _) = watch::channel(PipelineState::Starting);
        Self {
            opener,
            bus,
            sink,
            options,
            state,
            stats: Arc::new(PipelineStats::default()),
        }
    }

    /// Watch lifecycle transitions.
    pub fn state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Run until `shutdown` becomes `true`, or until the device is lost and
    /// reopening is disabled.
    ///
    /// The bus is disconnected before this returns, whatever the outcome.
    pub async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<StatsSnapshot, PipelineError> {
        let Self {
            opener,
            bus,
            sink,
            options,
            state,
            stats,
        } = self;

        info!(port = %opener.port(), "Pipeline starting");

        let reader = match opener.open().await {
            Ok(reader) => reader,
            Err(e) => {
                error!(error = %e, "Failed to open serial device");
                drain_bus(&bus, &options, &state).await;
                state.send_replace(PipelineState::Stopped);
                return Err(e.into());
            }
        };

        let mut subscription = match bus.subscribe(&options.telemetry_topic).await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(topic = %options.telemetry_topic, error = %e, "Failed to subscribe");
                drain_bus(&bus, &options, &state).await;
                state.send_replace(PipelineState::Stopped);
                return Err(e.into());
            }
        };

        let (stop_tx, stop_rx) = watch::channel(false);

        let mut serial_task: JoinHandle<Result<(), SerialError>> = tokio::spawn(serial_flow(
            opener,
            reader,
            Arc::clone(&bus),
            options.raw_topic.clone(),
            options.reopen_interval,
            stop_rx,
            Arc::clone(&stats),
        ));

        let storage_stats = Arc::clone(&stats);
        let storage_task: JoinHandle<()> = tokio::spawn(async move {
            store_messages(&mut subscription, sink.as_ref(), &storage_stats).await;
        });

        state.send_replace(PipelineState::Running);
        info!(
            raw_topic = %options.raw_topic,
            telemetry_topic = %options.telemetry_topic,
            "Pipeline running"
        );

        let mut serial_done = None;
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => {
                info!("Shutdown requested");
            }
            result = &mut serial_task => {
                serial_done = Some(result);
            }
        }

        drain_bus(&bus, &options, &state).await;
        let _ = stop_tx.send(true);

        let serial_result = match serial_done {
            Some(result) => result,
            None => match tokio::time::timeout(options.shutdown_grace, &mut serial_task).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Serial flow did not stop in time, aborting");
                    serial_task.abort();
                    Ok(Ok(()))
                }
            },
        };

        let mut storage_task = storage_task;
        if tokio::time::timeout(options.shutdown_grace, &mut storage_task)
            .await
            .is_err()
        {
            warn!("Storage flow did not stop in time, aborting");
            storage_task.abort();
        }

        state.send_replace(PipelineState::Stopped);

        let snapshot = stats.snapshot();
        info!(
            lines_read = snapshot.lines_read,
            published = snapshot.published,
            publish_failed = snapshot.publish_failed,
            received = snapshot.received,
            stored = snapshot.stored,
            malformed = snapshot.malformed,
            store_failed = snapshot.store_failed,
            "Pipeline stopped"
        );

        match serial_result {
            Ok(Ok(())) => Ok(snapshot),
            Ok(Err(e)) => {
                error!(error = %e, "Serial flow ended with an error");
                Err(e.into())
            }
            Err(e) => Err(PipelineError::Task(e.to_string())),
        }
    }
}

async fn drain_bus<T: Transport>(
    bus: &BusClient<T>,
    options: &PipelineOptions,
    state: &watch::Sender<PipelineState>,
) {
    state.send_replace(PipelineState::Draining);
    if let Err(e) = bus.disconnect(options.drain_timeout).await {
        warn!(error = %e, "Error while disconnecting from bus");
    }
}

/// Resolves once `shutdown` is `true` or its sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Forward lines, reopening the device after a loss when configured.
async fn serial_flow<O, T>(
    opener: O,
    mut reader: SerialReader<O::Device>,
    bus: Arc<BusClient<T>>,
    topic: String,
    reopen_interval: Option<Duration>,
    mut stop: watch::Receiver<bool>,
    stats: Arc<PipelineStats>,
) -> Result<(), SerialError>
where
    O: DeviceOpener,
    T: Transport,
{
    loop {
        let err = match forward_lines(&mut reader, &bus, &topic, &mut stop, &stats).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        let Some(interval) = reopen_interval else {
            return Err(err);
        };
        warn!(
            error = %err,
            retry_in_secs = interval.as_secs(),
            "Serial device lost, will reopen"
        );

        reader = loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut stop) => return Ok(()),
                _ = tokio::time::sleep(interval) => {}
            }

            match opener.open().await {
                Ok(reader) => {
                    info!(port = %opener.port(), "Serial device reopened");
                    break reader;
                }
                Err(e) => warn!(error = %e, "Serial device still unavailable"),
            }
        };
    }
}
