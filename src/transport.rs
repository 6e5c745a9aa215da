//! Device-side transport layer for TCP and RTU communication
//!
//! [`StreamTransport`] frames requests over any async byte stream; TCP and the
//! serial RTU line differ only in the [`Framing`] they use.

use std::net::SocketAddr;
use std::time::Duration;

use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::constants::{MBAP_HEADER_LEN, MAX_TCP_FRAME_LEN};
use crate::error::{RelayError, RelayResult};
use crate::logging::hex_frame;
use crate::protocol::{mbap_frame_len, rtu_response_len, Framing, ModbusRequest, ModbusResponse};

/// Transport statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Request/response exchange with a Modbus device.
pub trait ModbusTransport: Send {
    /// Send one request and wait for its response
    fn request(
        &mut self,
        request: &ModbusRequest,
    ) -> impl std::future::Future<Output = RelayResult<ModbusResponse>> + Send;

    fn is_connected(&self) -> bool;

    fn close(&mut self) -> impl std::future::Future<Output = RelayResult<()>> + Send;

    fn get_stats(&self) -> TransportStats;
}

/// Framed request/response transport over an async byte stream
pub struct StreamTransport<S> {
    stream: Option<S>,
    framing: Framing,
    timeout: Duration,
    transaction_id: u16,
    /// Input may hold a late or partial reply from a previous request
    stale: bool,
    stats: TransportStats,
}

/// Modbus TCP transport
pub type TcpTransport = StreamTransport<TcpStream>;

impl TcpTransport {
    /// Connect to a Modbus TCP device
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> RelayResult<Self> {
        debug!("Connecting to {}", addr);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RelayError::timeout(format!("connect to {}", addr), timeout.as_millis() as u64))?
            .map_err(|e| RelayError::connection(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, Framing::Tcp, timeout))
    }
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, framing: Framing, timeout: Duration) -> Self {
        Self {
            stream: Some(stream),
            framing,
            timeout,
            transaction_id: 0,
            stale: false,
            stats: TransportStats::default(),
        }
    }

    async fn exchange(&mut self, request: &ModbusRequest) -> RelayResult<ModbusResponse> {
        let pdu = request.to_pdu()?;
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let transaction_id = self.transaction_id;
        let frame = self.framing.encode(transaction_id, request.slave_id, &pdu);

        let framing = self.framing;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| RelayError::connection("Transport is closed"))?;

        if self.stale {
            let discarded = discard_pending(stream)?;
            if discarded > 0 {
                debug!("Discarded {} stale bytes before request", discarded);
            }
            self.stale = false;
        }

        trace!("-> {}", hex_frame(&frame));
        stream.write_all(&frame).await?;
        stream.flush().await?;
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;

        let raw = read_frame(stream, framing).await?;
        trace!("<- {}", hex_frame(&raw));
        self.stats.bytes_received += raw.len() as u64;

        let (response_tid, slave_id, pdu) = framing.decode(&raw)?;
        if framing == Framing::Tcp && response_tid != transaction_id {
            return Err(RelayError::protocol(format!(
                "Transaction id mismatch: sent {}, received {}",
                transaction_id, response_tid
            )));
        }
        if slave_id != request.slave_id {
            return Err(RelayError::protocol(format!(
                "Response from unit {} to a request for unit {}",
                slave_id, request.slave_id
            )));
        }
        let expected_fc = request.function.to_u8();
        if pdu.function_code().map(|fc| fc & 0x7F) != Some(expected_fc) {
            return Err(RelayError::protocol(format!(
                "Response function {:02X?} does not match request {:02X}",
                pdu.function_code(),
                expected_fc
            )));
        }

        self.stats.responses_received += 1;
        Ok(ModbusResponse::new(slave_id, pdu))
    }
}

/// Drop whatever input is already buffered, without waiting for more
fn discard_pending<S>(stream: &mut S) -> RelayResult<usize>
where
    S: AsyncRead + Unpin,
{
    let mut scratch = [0u8; 256];
    let mut discarded = 0;
    while let Some(read) = stream.read(&mut scratch).now_or_never() {
        match read? {
            0 => break,
            n => discarded += n,
        }
    }
    Ok(discarded)
}

/// Read exactly one response frame
async fn read_frame<S>(stream: &mut S, framing: Framing) -> RelayResult<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    match framing {
        Framing::Tcp => {
            let mut frame = vec![0u8; MBAP_HEADER_LEN];
            stream.read_exact(&mut frame).await?;
            let total = mbap_frame_len(&frame)?
                .filter(|len| *len <= MAX_TCP_FRAME_LEN)
                .ok_or_else(|| RelayError::protocol("Invalid MBAP header"))?;
            frame.resize(total, 0);
            stream.read_exact(&mut frame[MBAP_HEADER_LEN..]).await?;
            Ok(frame)
        }
        Framing::Rtu => {
            let mut head = [0u8; 3];
            stream.read_exact(&mut head).await?;
            let total = rtu_response_len(&head)?;
            let mut frame = Vec::with_capacity(total);
            frame.extend_from_slice(&head);
            frame.resize(total, 0);
            stream.read_exact(&mut frame[3..]).await?;
            Ok(frame)
        }
    }
}

impl<S> ModbusTransport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn request(&mut self, request: &ModbusRequest) -> RelayResult<ModbusResponse> {
        let timeout = self.timeout;
        let result = match tokio::time::timeout(timeout, self.exchange(request)).await {
            Ok(result) => result,
            Err(_) => {
                self.stats.timeouts += 1;
                Err(RelayError::timeout(
                    format!("FC{:02X} request", request.function.to_u8()),
                    timeout.as_millis() as u64,
                ))
            }
        };

        if let Err(ref e) = result {
            self.stats.errors += 1;
            match self.framing {
                // The serial bus is shared: a silent or garbled unit leaves the
                // line open, and its leftovers are discarded before the next request
                Framing::Rtu if !matches!(e, RelayError::Io(_) | RelayError::Connection { .. }) => {
                    self.stale = true;
                }
                // A TCP stream left mid-frame cannot be resynchronised
                _ if e.is_link_failure() => self.stream = None,
                _ => {}
            }
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) -> RelayResult<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats
    }
}

/// Modbus RTU transport over a serial line
#[cfg(feature = "rtu")]
pub type RtuTransport = StreamTransport<tokio_serial::SerialStream>;

/// Serial line settings for RTU
#[cfg(feature = "rtu")]
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub port: String,
    pub baud: u32,
    pub parity: tokio_serial::Parity,
    pub data_bits: tokio_serial::DataBits,
    pub stop_bits: tokio_serial::StopBits,
}

#[cfg(feature = "rtu")]
impl RtuTransport {
    /// Open the serial port
    pub fn open(settings: &SerialSettings, timeout: Duration) -> RelayResult<Self> {
        use tokio_serial::SerialPortBuilderExt;

        debug!(
            "Opening {} at {} bauds ({:?}, {:?}, {:?})",
            settings.port, settings.baud, settings.parity, settings.data_bits, settings.stop_bits
        );
        let stream = tokio_serial::new(&settings.port, settings.baud)
            .parity(settings.parity)
            .data_bits(settings.data_bits)
            .stop_bits(settings.stop_bits)
            .timeout(timeout)
            .open_native_async()
            .map_err(|e| {
                RelayError::connection(format!("Failed to open {}: {}", settings.port, e))
            })?;
        Ok(Self::new(stream, Framing::Rtu, timeout))
    }
}
