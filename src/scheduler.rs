//! Wall-clock aligned polling of remote devices (poll role)
//!
//! Cycles start on multiples of the interval since the Unix epoch, so relays
//! sharing an interval sample at the same instants. Each cycle reads every
//! [`ReadSpec`] of every [`Target`] in configuration order and hands each
//! reading to the [`RecordSink`] before moving on.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{ModbusClient, ModbusTcpClient};
use crate::codec::ValueType;
use crate::error::{RelayError, RelayResult};
use crate::output::{build_records, Delivery, RecordSink, RecordSource};
use crate::protocol::SlaveId;

#[cfg(feature = "rtu")]
use crate::client::ModbusRtuClient;
#[cfg(feature = "rtu")]
use crate::transport::SerialSettings;

/// One register run to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadSpec {
    pub address: u16,
    pub length: u16,
    pub value_type: ValueType,
}

/// A remote device polled every cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Unit id; zero or negative means none
    pub id: i32,
    pub name: Option<String>,
    /// Device address overriding the line default (TCP only)
    pub endpoint: Option<SocketAddr>,
    pub specs: Vec<ReadSpec>,
}

impl Target {
    /// Name used in record labels
    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.to_string())
    }

    /// Unit id put on the wire
    pub fn slave_id(&self) -> SlaveId {
        SlaveId::try_from(self.id).unwrap_or(0)
    }
}

/// Smallest multiple of `interval_ms` strictly greater than `now_ms`
pub fn next_boundary(now_ms: u64, interval_ms: u64) -> u64 {
    let interval = interval_ms.max(1);
    (now_ms / interval + 1) * interval
}

/// Boundary bookkeeping for the polling loop
#[derive(Debug, Clone)]
pub struct Schedule {
    interval_ms: u64,
    last: Option<u64>,
}

impl Schedule {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: (interval.as_millis() as u64).max(1),
            last: None,
        }
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    /// Next boundary to wake at.
    ///
    /// Always later than the one returned before, so boundaries missed by a
    /// slow cycle are skipped instead of fired back to back.
    pub fn next_wake(&mut self, now_ms: u64) -> u64 {
        let mut wake = next_boundary(now_ms, self.interval_ms);
        if let Some(last) = self.last {
            if wake <= last {
                wake = next_boundary(last, self.interval_ms);
            }
        }
        self.last = Some(wake);
        wake
    }
}

/// Milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Source of register readings
pub trait RegisterSource: Send {
    fn read_registers(
        &mut self,
        target: &Target,
        address: u16,
        count: u16,
    ) -> impl std::future::Future<Output = RelayResult<Vec<u16>>> + Send;
}

/// The field side of the poll role
pub enum DeviceLine {
    /// Modbus TCP connections keyed by device address
    Tcp {
        default: SocketAddr,
        clients: HashMap<SocketAddr, Option<ModbusTcpClient>>,
        timeout: Duration,
    },
    /// One shared serial bus, reopened if the port itself fails
    #[cfg(feature = "rtu")]
    Rtu {
        settings: SerialSettings,
        client: Option<ModbusRtuClient>,
        timeout: Duration,
    },
}

impl DeviceLine {
    /// Connect to every device the targets reference.
    ///
    /// Any failure here is fatal; later failures reconnect on the next read.
    pub async fn open_tcp(
        default: SocketAddr,
        targets: &[Target],
        timeout: Duration,
    ) -> RelayResult<Self> {
        let mut clients = HashMap::new();
        for endpoint in targets.iter().map(|t| t.endpoint.unwrap_or(default)) {
            if clients.contains_key(&endpoint) {
                continue;
            }
            let client = ModbusTcpClient::connect(endpoint, timeout).await?;
            info!("Connected to Modbus device {}", endpoint);
            clients.insert(endpoint, Some(client));
        }
        Ok(Self::Tcp {
            default,
            clients,
            timeout,
        })
    }

    #[cfg(feature = "rtu")]
    pub fn open_rtu(settings: &SerialSettings, timeout: Duration) -> RelayResult<Self> {
        let client = ModbusRtuClient::open(settings, timeout)?;
        info!("Opened serial line {}", settings.port);
        Ok(Self::Rtu {
            settings: settings.clone(),
            client: Some(client),
            timeout,
        })
    }

    pub async fn close(&mut self) {
        match self {
            Self::Tcp { clients, .. } => {
                for client in clients.values_mut().filter_map(Option::as_mut) {
                    let _ = client.close().await;
                }
                clients.clear();
            }
            #[cfg(feature = "rtu")]
            Self::Rtu { client, .. } => {
                if let Some(mut client) = client.take() {
                    let _ = client.close().await;
                }
            }
        }
    }
}

impl RegisterSource for DeviceLine {
    async fn read_registers(
        &mut self,
        target: &Target,
        address: u16,
        count: u16,
    ) -> RelayResult<Vec<u16>> {
        match self {
            Self::Tcp {
                default,
                clients,
                timeout,
            } => {
                let endpoint = target.endpoint.unwrap_or(*default);
                let slot = clients.entry(endpoint).or_insert(None);
                if slot.as_ref().map_or(true, |c| !c.is_connected()) {
                    debug!("Reconnecting to {}", endpoint);
                    *slot = None;
                    *slot = Some(ModbusTcpClient::connect(endpoint, *timeout).await?);
                }
                let client = slot
                    .as_mut()
                    .ok_or_else(|| RelayError::connection(format!("No link to {}", endpoint)))?;
                client.read_03(target.slave_id(), address, count).await
            }
            #[cfg(feature = "rtu")]
            Self::Rtu {
                settings,
                client,
                timeout,
            } => {
                if client.as_ref().map_or(true, |c| !c.is_connected()) {
                    debug!("Reopening serial line {}", settings.port);
                    *client = None;
                    *client = Some(ModbusRtuClient::open(settings, *timeout)?);
                }
                let client = client.as_mut().ok_or_else(|| {
                    RelayError::connection(format!("No link to {}", settings.port))
                })?;
                client.read_03(target.slave_id(), address, count).await
            }
        }
    }
}

/// Aligned polling loop
pub struct Scheduler<R, S> {
    targets: Vec<Target>,
    source: R,
    sink: S,
    schedule: Schedule,
}

impl<R: RegisterSource, S: RecordSink> Scheduler<R, S> {
    pub fn new(targets: Vec<Target>, source: R, sink: S, interval: Duration) -> Self {
        Self {
            targets,
            source,
            sink,
            schedule: Schedule::new(interval),
        }
    }

    pub fn source_mut(&mut self) -> &mut R {
        &mut self.source
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Run until `token` is cancelled
    pub async fn run(&mut self, token: &CancellationToken) -> RelayResult<()> {
        info!(
            "Polling {} targets every {} ms",
            self.targets.len(),
            self.schedule.interval_ms()
        );
        while !token.is_cancelled() {
            let now = now_ms();
            let wake = self.schedule.next_wake(now);
            debug!("Going to sleep for {} ms", wake - now);

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(wake - now)) => {}
            }
            debug!("Wake up at {}", chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"));

            self.poll_cycle(token).await?;
        }
        Ok(())
    }

    /// Read every spec once, in configuration order.
    ///
    /// Failed reads are logged and skipped. Returns early only when a delivery
    /// is abandoned because of a stop.
    pub async fn poll_cycle(&mut self, token: &CancellationToken) -> RelayResult<()> {
        for target in &self.targets {
            let label = target.label();
            for spec in &target.specs {
                if token.is_cancelled() {
                    return Ok(());
                }
                debug!(
                    "ID: {}, addr: {} l: {}",
                    target.id, spec.address, spec.length
                );

                let raw = match self
                    .source
                    .read_registers(target, spec.address, spec.length)
                    .await
                {
                    Ok(raw) => raw,
                    Err(e) if e.is_recoverable() => {
                        warn!(
                            "ID: {}, addr: {} l: {} {}",
                            target.id, spec.address, spec.length, e
                        );
                        continue;
                    }
                    Err(e) => {
                        error!(
                            "ID: {}, addr: {} l: {} {}",
                            target.id, spec.address, spec.length, e
                        );
                        continue;
                    }
                };

                let records = build_records(
                    RecordSource::Device(&label),
                    spec.address,
                    spec.value_type,
                    &raw,
                );
                if self.sink.deliver(&records, token).await? == Delivery::Abandoned {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{serialize_records, OutputRecord};
    use proptest::prelude::*;

    /// Register source answering from a fixed table, failing on listed addresses
    struct TableSource {
        failing: Vec<u16>,
        reads: Vec<(i32, u16, u16)>,
    }

    impl RegisterSource for TableSource {
        async fn read_registers(
            &mut self,
            target: &Target,
            address: u16,
            count: u16,
        ) -> RelayResult<Vec<u16>> {
            self.reads.push((target.id, address, count));
            if self.failing.contains(&address) {
                return Err(RelayError::timeout("FC03 request", 1000));
            }
            Ok((0..count).map(|i| address + i).collect())
        }
    }

    #[derive(Default)]
    struct VecSink {
        messages: Vec<String>,
    }

    impl RecordSink for VecSink {
        async fn deliver(
            &mut self,
            records: &[OutputRecord],
            _token: &CancellationToken,
        ) -> RelayResult<Delivery> {
            self.messages.push(serialize_records(records));
            Ok(Delivery::Sent)
        }
    }

    fn spec(address: u16, length: u16) -> ReadSpec {
        ReadSpec {
            address,
            length,
            value_type: ValueType::Integer16,
        }
    }

    fn targets() -> Vec<Target> {
        vec![
            Target {
                id: 1,
                name: Some("plant1".to_string()),
                endpoint: None,
                specs: vec![spec(100, 2), spec(200, 1)],
            },
            Target {
                id: 2,
                name: None,
                endpoint: None,
                specs: vec![spec(10, 1)],
            },
        ]
    }

    #[test]
    fn test_next_boundary() {
        assert_eq!(next_boundary(0, 10_000), 10_000);
        assert_eq!(next_boundary(9_999, 10_000), 10_000);
        assert_eq!(next_boundary(10_000, 10_000), 20_000);
        assert_eq!(next_boundary(123_456, 1_000), 124_000);
    }

    #[test]
    fn test_late_cycle_skips_missed_boundaries() {
        let mut schedule = Schedule::new(Duration::from_secs(10));
        assert_eq!(schedule.next_wake(1_000), 10_000);
        // The cycle woke at 10 000 and ran for 25 s
        assert_eq!(schedule.next_wake(35_000), 40_000);
        // A clock step back never reissues a boundary
        assert_eq!(schedule.next_wake(5_000), 50_000);
    }

    #[test]
    fn test_target_label_and_slave() {
        let targets = targets();
        assert_eq!(targets[0].label(), "plant1");
        assert_eq!(targets[1].label(), "2");
        assert_eq!(targets[1].slave_id(), 2);

        let anonymous = Target {
            id: -1,
            name: None,
            endpoint: None,
            specs: vec![],
        };
        assert_eq!(anonymous.slave_id(), 0);
    }

    #[tokio::test]
    async fn test_poll_cycle_order_and_skip() {
        let source = TableSource {
            failing: vec![200],
            reads: Vec::new(),
        };
        let mut scheduler =
            Scheduler::new(targets(), source, VecSink::default(), Duration::from_secs(10));
        let token = CancellationToken::new();

        scheduler.poll_cycle(&token).await.unwrap();

        assert_eq!(
            scheduler.source_mut().reads,
            vec![(1, 100, 2), (1, 200, 1), (2, 10, 1)]
        );
        assert_eq!(
            scheduler.sink().messages,
            vec![
                "mb_plant1_100 100|mb_plant1_101 101\n".to_string(),
                "mb_2_10 10\n".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_poll_cycle_stops_when_cancelled() {
        let source = TableSource {
            failing: vec![],
            reads: Vec::new(),
        };
        let mut scheduler =
            Scheduler::new(targets(), source, VecSink::default(), Duration::from_secs(10));
        let token = CancellationToken::new();
        token.cancel();

        scheduler.poll_cycle(&token).await.unwrap();
        scheduler.run(&token).await.unwrap();
        assert!(scheduler.source_mut().reads.is_empty());
        assert!(scheduler.sink().messages.is_empty());
    }

    /// Answer one FC03 request with 42, then drop the connection
    async fn answer_once(listener: &tokio::net::TcpListener) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 12];
        stream.read_exact(&mut request).await.unwrap();
        let reply = [
            request[0], request[1], 0x00, 0x00, 0x00, 0x05, request[6], 0x03, 0x02, 0x00, 0x2A,
        ];
        stream.write_all(&reply).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_device_link_reconnects() {
        let device = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = device.local_addr().unwrap();
        let targets = vec![Target {
            id: 1,
            name: Some("dev".to_string()),
            endpoint: None,
            specs: vec![spec(10, 1)],
        }];

        let line = DeviceLine::open_tcp(addr, &targets, Duration::from_secs(1))
            .await
            .unwrap();
        let server = tokio::spawn(async move {
            answer_once(&device).await;
            answer_once(&device).await;
        });
        let mut scheduler =
            Scheduler::new(targets, line, VecSink::default(), Duration::from_secs(10));
        let token = CancellationToken::new();

        scheduler.poll_cycle(&token).await.unwrap();
        // The device has closed the link: this read fails and is skipped
        scheduler.poll_cycle(&token).await.unwrap();
        // A fresh connection is opened for the next cycle
        scheduler.poll_cycle(&token).await.unwrap();

        server.await.unwrap();
        assert_eq!(
            scheduler.sink().messages,
            vec!["mb_dev_10 42\n".to_string(), "mb_dev_10 42\n".to_string()]
        );
        scheduler.source_mut().close().await;
    }

    proptest! {
        #[test]
        fn boundary_is_aligned_and_after_now(now in 0u64..1u64 << 48, interval in 1u64..86_400_000) {
            let wake = next_boundary(now, interval);
            prop_assert_eq!(wake % interval, 0);
            prop_assert!(wake > now);
            prop_assert!(wake - now <= interval);
        }

        #[test]
        fn wakes_strictly_increase(steps in proptest::collection::vec(0u64..100_000, 1..20)) {
            let mut schedule = Schedule::new(Duration::from_millis(1_000));
            let mut now = 0u64;
            let mut previous = 0u64;
            for step in steps {
                now += step;
                let wake = schedule.next_wake(now);
                prop_assert!(wake > previous);
                prop_assert_eq!(wake % 1_000, 0);
                previous = wake;
            }
        }
    }
}
