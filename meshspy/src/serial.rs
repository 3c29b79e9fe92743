//! Line reader for the radio's serial console.
//!
//! The device writes newline-terminated text. Each complete line becomes a
//! [`RawLine`]; a trailing `\r` is stripped and blank lines are skipped.

use std::borrow::Cow;
use std::future::Future;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;
use tokio_serial::{DataBits, Parity, SerialStream, StopBits};
use tracing::{debug, info};

/// Tracing target for mirrored device lines in debug mode.
pub const MIRROR_TARGET: &str = "meshspy::serial::mirror";

/// Errors from the serial side.
#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Serial device {port} unavailable: {message}")]
    DeviceUnavailable { port: String, message: String },

    #[error("Read from {port} failed: {source}")]
    DeviceReadError {
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serial device {port} closed")]
    DeviceClosed { port: String },
}

/// One line of device output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    /// Line content without the terminator.
    pub bytes: Bytes,
    pub received_at: DateTime<Utc>,
}

impl RawLine {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            received_at: Utc::now(),
        }
    }

    /// Lossy UTF-8 view, for logging.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Reads lines from a serial device or any other byte stream.
pub struct SerialReader<R> {
    port: String,
    reader: BufReader<R>,
    buf: Vec<u8>,
    debug: bool,
    lines_read: u64,
}

impl SerialReader<SerialStream> {
    /// Open `port` at `baud_rate`, 8N1.
    pub fn open(port: &str, baud_rate: u32) -> Result<Self, SerialError> {
        let builder = tokio_serial::new(port, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One);

        let stream = SerialStream::open(&builder).map_err(|e| SerialError::DeviceUnavailable {
            port: port.to_string(),
            message: e.to_string(),
        })?;

        info!(port = %port, baud_rate, "Serial device opened");
        Ok(Self::from_reader(port, stream))
    }
}

impl<R: AsyncRead + Unpin> SerialReader<R> {
    /// Wrap an already open stream. `port` is only used in logs and errors.
    pub fn from_reader(port: impl Into<String>, reader: R) -> Self {
        Self {
            port: port.into(),
            reader: BufReader::new(reader),
            buf: Vec::with_capacity(256),
            debug: false,
            lines_read: 0,
        }
    }

    /// Mirror every line to [`MIRROR_TARGET`].
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn lines_read(&self) -> u64 {
        self.lines_read
    }

    /// Wait for the next non-empty line.
    ///
    /// A partial line at end of stream is dropped and reported as
    /// [`SerialError::DeviceClosed`].
    pub async fn next_line(&mut self) -> Result<RawLine, SerialError> {
        loop {
            self.buf.clear();
            let n = self
                .reader
                .read_until(b'\n', &mut self.buf)
                .await
                .map_err(|source| SerialError::DeviceReadError {
                    port: self.port.clone(),
                    source,
                })?;

            if n == 0 || self.buf.last() != Some(&b'\n') {
                if n > 0 {
                    debug!(port = %self.port, bytes = n, "Discarding partial line at end of stream");
                }
                return Err(SerialError::DeviceClosed {
                    port: self.port.clone(),
                });
            }

            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
            if self.buf.is_empty() {
                continue;
            }

            self.lines_read += 1;
            return Ok(RawLine::new(Bytes::copy_from_slice(&self.buf)));
        }
    }

    /// Hand every line to `on_line`, one at a time, until `shutdown` fires.
    ///
    /// The next line is not read before `on_line` completes. Returns `Ok(())`
    /// on shutdown and the device error otherwise; a failed read is not
    /// retried.
    pub async fn read_loop<F, Fut>(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
        mut on_line: F,
    ) -> Result<(), SerialError>
    where
        F: FnMut(RawLine) -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            if *shutdown.borrow_and_update() {
                return Ok(());
            }

            let line = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    continue;
                }
                line = self.next_line() => line?,
            };

            if self.debug {
                info!(target: MIRROR_TARGET, port = %self.port, line = %line.text());
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                _ = on_line(line) => {}
            }
        }
    }
}

/// Opens (and reopens) the device for the pipeline.
pub trait DeviceOpener: Send + Sync + 'static {
    type Device: AsyncRead + Unpin + Send + 'static;

    fn open(&self) -> impl Future<Output = Result<SerialReader<Self::Device>, SerialError>> + Send;

    /// Port name for logs.
    fn port(&self) -> &str;
}

/// The real serial port.
#[derive(Debug, Clone)]
pub struct SerialDevice {
    pub port: String,
    pub baud_rate: u32,
    pub debug: bool,
}

impl DeviceOpener for SerialDevice {
    type Device = SerialStream;

    async fn open(&self) -> Result<SerialReader<SerialStream>, SerialError> {
        Ok(SerialReader::open(&self.port, self.baud_rate)?.with_debug(self.debug))
    }

    fn port(&self) -> &str {
        &self.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_splits_lines() {
        let mock = Builder::new().read(b"T=21.5\nT=").read(b"21.7\r\n").build();
        let mut reader = SerialReader::from_reader("mock", mock);

        assert_eq!(&reader.next_line().await.unwrap().bytes[..], b"T=21.5");
        assert_eq!(&reader.next_line().await.unwrap().bytes[..], b"T=21.7");
        assert!(matches!(
            reader.next_line().await,
            Err(SerialError::DeviceClosed { .. })
        ));
        assert_eq!(reader.lines_read(), 2);
    }

    #[tokio::test]
    async fn test_skips_blank_lines() {
        let mock = Builder::new().read(b"\n\r\nhello\n\n").build();
        let mut reader = SerialReader::from_reader("mock", mock);

        assert_eq!(&reader.next_line().await.unwrap().bytes[..], b"hello");
        assert!(reader.next_line().await.is_err());
    }

    #[tokio::test]
    async fn test_partial_line_at_eof_is_discarded() {
        let mock = Builder::new().read(b"complete\npartial").build();
        let mut reader = SerialReader::from_reader("mock", mock);

        assert_eq!(&reader.next_line().await.unwrap().bytes[..], b"complete");
        assert!(matches!(
            reader.next_line().await,
            Err(SerialError::DeviceClosed { .. })
        ));
        assert_eq!(reader.lines_read(), 1);
    }

    #[tokio::test]
    async fn test_read_error_is_reported() {
        let mock = Builder::new()
            .read(b"ok\n")
            .read_error(std::io::Error::other("usb unplugged"))
            .build();
        let mut reader = SerialReader::from_reader("mock", mock);

        assert!(reader.next_line().await.is_ok());
        match reader.next_line().await {
            Err(SerialError::DeviceReadError { port, source }) => {
                assert_eq!(port, "mock");
                assert_eq!(source.to_string(), "usb unplugged");
            }
            other => panic!("expected read error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_utf8_passes_through() {
        let mock = Builder::new().read(b"\xff\xfe\n").build();
        let mut reader = SerialReader::from_reader("mock", mock);

        let line = reader.next_line().await.unwrap();
        assert_eq!(&line.bytes[..], b"\xff\xfe");
        assert_eq!(line.len(), 2);
    }

    #[tokio::test]
    async fn test_read_loop_delivers_in_order() {
        let mock = Builder::new().read(b"a\nb\nc\n").build();
        let mut reader = SerialReader::from_reader("mock", mock).with_debug(true);
        let (_tx, mut shutdown) = watch::channel(false);

        let mut seen = Vec::new();
        let result = reader
            .read_loop(&mut shutdown, |line| {
                seen.push(line.bytes);
                async {}
            })
            .await;

        assert!(matches!(result, Err(SerialError::DeviceClosed { .. })));
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_read_loop_stops_on_shutdown() {
        let (mut device, host) = tokio::io::duplex(64);
        let mut reader = SerialReader::from_reader("duplex", host);
        let (tx, mut shutdown) = watch::channel(false);

        device.write_all(b"first\n").await.unwrap();

        let mut count = 0;
        let result = reader
            .read_loop(&mut shutdown, |_line| {
                count += 1;
                // Request shutdown from inside the callback
                let _ = tx.send(true);
                async {}
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_read_loop_returns_when_already_shut_down() {
        let (_device, host) = tokio::io::duplex(64);
        let mut reader = SerialReader::from_reader("duplex", host);
        let (_tx, mut shutdown) = watch::channel(true);

        let result = reader.read_loop(&mut shutdown, |_line| async {}).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_open_missing_port() {
        let result = SerialReader::open("/dev/meshspy-does-not-exist", 115_200);
        assert!(matches!(
            result,
            Err(SerialError::DeviceUnavailable { .. })
        ));
    }
}
