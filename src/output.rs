//! Output side: record formatting and the reconnecting consumer connection
//!
//! Every reading leaves the relay as one line on a Unix stream socket:
//!
//! ```text
//! mb_plant1_100 1234|mb_plant1_101 56.750000\n
//! ```
//!
//! [`OutputTransport::deliver`] keeps retrying until the line is written or the
//! relay is stopping, so a missing consumer stalls the caller instead of losing
//! data.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{decode, DecodedValue, ValueType};
use crate::error::{RelayError, RelayResult};

/// Fixed prefix of every record label
pub const LABEL_PREFIX: &str = "mb";

/// Default consumer socket path
pub const DEFAULT_SOCKET_FILE: &str = "/tmp/mbsocket";

/// Default pause between delivery attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// One `label value` pair
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRecord {
    pub label: String,
    pub value: DecodedValue,
}

impl OutputRecord {
    pub fn new(label: impl Into<String>, value: DecodedValue) -> Self {
        Self {
            label: label.into(),
            value,
        }
    }
}

impl fmt::Display for OutputRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.label, self.value)
    }
}

/// Where a register run came from, which decides its labels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSource<'a> {
    /// A polled target, labelled by name or id
    Device(&'a str),
    /// The local register map in serve mode
    Map,
}

impl RecordSource<'_> {
    pub fn label(&self, address: u32) -> String {
        match self {
            Self::Device(target) => format!("{}_{}_{}", LABEL_PREFIX, target, address),
            Self::Map => format!("{}_{}", LABEL_PREFIX, address),
        }
    }
}

/// Decode a register run starting at `start` into labelled records.
///
/// Each record carries the address of its first register.
pub fn build_records(
    source: RecordSource<'_>,
    start: u16,
    value_type: ValueType,
    raw: &[u16],
) -> Vec<OutputRecord> {
    let stride = value_type.register_stride() as u32;
    decode(raw, value_type)
        .into_iter()
        .enumerate()
        .map(|(i, value)| {
            let address = start as u32 + stride * i as u32;
            OutputRecord::new(source.label(address), value)
        })
        .collect()
}

/// Serialize records into one wire message
pub fn serialize_records(records: &[OutputRecord]) -> String {
    let mut message = records
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("|");
    message.push('\n');
    message
}

/// Outcome of [`RecordSink::deliver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Stop was requested before the records could be written
    Abandoned,
}

/// Downstream destination of relayed records
pub trait RecordSink: Send {
    /// Deliver `records`, retrying until written or `token` is cancelled
    fn deliver(
        &mut self,
        records: &[OutputRecord],
        token: &CancellationToken,
    ) -> impl std::future::Future<Output = RelayResult<Delivery>> + Send;
}

/// Output connection counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputStats {
    pub connects: u64,
    pub connect_failures: u64,
    pub messages_sent: u64,
    pub send_failures: u64,
}

/// Reconnecting Unix-socket client towards the consumer
pub struct OutputTransport {
    path: PathBuf,
    stream: Option<UnixStream>,
    retry_delay: Duration,
    send_timeout: Duration,
    stats: OutputStats,
}

impl OutputTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stream: None,
            retry_delay: DEFAULT_RETRY_DELAY,
            send_timeout: DEFAULT_RETRY_DELAY,
            stats: OutputStats::default(),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn stats(&self) -> OutputStats {
        self.stats
    }

    /// Open the consumer socket. Does not retry.
    pub async fn connect(&mut self) -> RelayResult<()> {
        match UnixStream::connect(&self.path).await {
            Ok(stream) => {
                info!("Connected to consumer socket {}", self.path.display());
                self.stream = Some(stream);
                self.stats.connects += 1;
                Ok(())
            }
            Err(e) => {
                debug!("Consumer socket {} unavailable: {}", self.path.display(), e);
                self.stats.connect_failures += 1;
                Err(RelayError::output(format!(
                    "Cannot connect to {}: {}",
                    self.path.display(),
                    e
                )))
            }
        }
    }

    /// Send records as one message. Never reconnects.
    pub async fn write(&mut self, records: &[OutputRecord]) -> RelayResult<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| RelayError::output("Consumer socket not connected"))?;
        let message = serialize_records(records);

        let result = match tokio::time::timeout(self.send_timeout, stream.write_all(message.as_bytes())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RelayError::output(format!("Send failed: {}", e))),
            Err(_) => Err(RelayError::timeout(
                "consumer send",
                self.send_timeout.as_millis() as u64,
            )),
        };

        match result {
            Ok(()) => {
                debug!("Sent {}", message.trim_end());
                self.stats.messages_sent += 1;
            }
            Err(_) => self.stats.send_failures += 1,
        }
        result
    }

    /// Drop the connection; safe to call when already closed
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("Closed consumer socket {}", self.path.display());
        }
    }
}

impl RecordSink for OutputTransport {
    async fn deliver(
        &mut self,
        records: &[OutputRecord],
        token: &CancellationToken,
    ) -> RelayResult<Delivery> {
        loop {
            if !self.is_connected() {
                let _ = self.connect().await;
            }
            if self.is_connected() {
                match self.write(records).await {
                    Ok(()) => return Ok(Delivery::Sent),
                    Err(e) => {
                        warn!("Lost consumer socket: {}", e);
                        self.close();
                    }
                }
            }

            tokio::select! {
                _ = token.cancelled() => {
                    warn!("Stopping with {} undelivered records", records.len());
                    return Ok(Delivery::Abandoned);
                }
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::UnixListener;

    #[test]
    fn test_serialize_records() {
        let records = vec![
            OutputRecord::new("mb_a_1", DecodedValue::Integer(10)),
            OutputRecord::new("mb_a_2", DecodedValue::Integer(20)),
        ];
        assert_eq!(serialize_records(&records), "mb_a_1 10|mb_a_2 20\n");
    }

    #[test]
    fn test_device_labels_follow_float_stride() {
        let records = build_records(
            RecordSource::Device("plant1"),
            100,
            ValueType::Float32MsbFirst,
            &[0x4640, 0xE666, 0x4445, 0x4000],
        );
        assert_eq!(
            serialize_records(&records),
            "mb_plant1_100 12345.599609|mb_plant1_102 789.000000\n"
        );
    }

    #[test]
    fn test_map_labels() {
        let records = build_records(RecordSource::Map, 1, ValueType::Integer16, &[5678, 9012]);
        assert_eq!(serialize_records(&records), "mb_1 5678|mb_2 9012\n");
    }

    #[tokio::test]
    async fn test_write_requires_connection() {
        let dir = tempfile::tempdir().unwrap();
        let mut output = OutputTransport::new(dir.path().join("absent.sock"));

        assert!(output.connect().await.is_err());
        assert!(!output.is_connected());
        assert!(output.write(&[]).await.is_err());
        assert_eq!(output.stats().connect_failures, 1);

        output.close();
        output.close();
    }

    #[tokio::test]
    async fn test_deliver_waits_for_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consumer.sock");

        let consumer_path = path.clone();
        let consumer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            let listener = UnixListener::bind(&consumer_path).unwrap();
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            lines.next_line().await.unwrap()
        });

        let mut output = OutputTransport::new(&path).with_retry_delay(Duration::from_millis(20));
        let records = vec![OutputRecord::new("mb_7", DecodedValue::Integer(42))];
        let token = CancellationToken::new();

        let delivery = output.deliver(&records, &token).await.unwrap();
        assert_eq!(delivery, Delivery::Sent);

        let line = consumer.await.unwrap();
        assert_eq!(line.as_deref(), Some("mb_7 42"));

        let stats = output.stats();
        assert!(stats.connect_failures >= 2);
        assert_eq!(stats.connects, 1);
        assert_eq!(stats.messages_sent, 1);
    }

    #[tokio::test]
    async fn test_deliver_resends_after_consumer_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consumer.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let (dropped_tx, dropped_rx) = tokio::sync::oneshot::channel();

        let consumer = tokio::spawn(async move {
            let (first, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(first).lines();
            let before = lines.next_line().await.unwrap();
            // Consumer restarts
            drop(lines);
            dropped_tx.send(()).unwrap();

            let (second, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(second).lines();
            let after = lines.next_line().await.unwrap();
            (before, after)
        });

        let mut output = OutputTransport::new(&path).with_retry_delay(Duration::from_millis(20));
        let token = CancellationToken::new();

        let first = vec![OutputRecord::new("mb_1", DecodedValue::Integer(1))];
        assert_eq!(output.deliver(&first, &token).await.unwrap(), Delivery::Sent);
        dropped_rx.await.unwrap();

        let second = vec![OutputRecord::new("mb_2", DecodedValue::Integer(2))];
        assert_eq!(output.deliver(&second, &token).await.unwrap(), Delivery::Sent);

        let (before, after) = consumer.await.unwrap();
        assert_eq!(before.as_deref(), Some("mb_1 1"));
        assert_eq!(after.as_deref(), Some("mb_2 2"));

        let stats = output.stats();
        assert_eq!(stats.send_failures, 1);
        assert_eq!(stats.connects, 2);
        assert_eq!(stats.messages_sent, 2);
    }

    #[tokio::test]
    async fn test_deliver_abandons_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let mut output = OutputTransport::new(dir.path().join("never.sock"))
            .with_retry_delay(Duration::from_millis(10));
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let records = vec![OutputRecord::new("mb_0", DecodedValue::Integer(1))];
        let delivery = output.deliver(&records, &token).await.unwrap();
        assert_eq!(delivery, Delivery::Abandoned);
        assert_eq!(output.stats().messages_sent, 0);
    }
}
