//! Modbus client used by the poll role
//!
//! Modbus TCP and RTU share the same application layer (PDU) and differ only in
//! how the transport encapsulates it, so the register logic lives once in
//! [`GenericModbusClient`] and [`ModbusTcpClient`] / [`ModbusRtuClient`] are
//! thin aliases over the matching transport.
//!
//! ```rust,no_run
//! use voltage_relay::{ModbusClient, ModbusTcpClient, RelayResult};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> RelayResult<()> {
//!     let mut client = ModbusTcpClient::from_address("127.0.0.1:1502", Duration::from_secs(1)).await?;
//!
//!     let registers = client.read_03(1, 0, 10).await?;
//!     println!("Registers: {:?}", registers);
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use crate::constants::{MAX_READ_REGISTERS, MAX_WRITE_REGISTERS};
use crate::error::{RelayError, RelayResult};
use crate::protocol::{ModbusFunction, ModbusRequest, ModbusResponse, SlaveId};
use crate::transport::{ModbusTransport, TcpTransport, TransportStats};

#[cfg(feature = "rtu")]
use crate::transport::{RtuTransport, SerialSettings};

/// Register operations against a remote device.
///
/// | Operation | Limit |
/// |-----------|-------|
/// | Read Holding Registers (0x03) | 125 registers |
/// | Write Multiple Registers (0x10) | 123 registers |
pub trait ModbusClient: Send {
    /// Read holding registers (function code 0x03).
    ///
    /// # Arguments
    ///
    /// * `slave_id` - The Modbus slave/unit ID (1-247)
    /// * `address` - Starting register address (0-65535)
    /// * `quantity` - Number of registers to read (1-125)
    fn read_03(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl std::future::Future<Output = RelayResult<Vec<u16>>> + Send;

    /// Write single register (function code 0x06).
    fn write_06(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        value: u16,
    ) -> impl std::future::Future<Output = RelayResult<()>> + Send;

    /// Write multiple registers (function code 0x10).
    fn write_10(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[u16],
    ) -> impl std::future::Future<Output = RelayResult<()>> + Send;

    /// Whether the underlying link is still usable
    fn is_connected(&self) -> bool;

    fn close(&mut self) -> impl std::future::Future<Output = RelayResult<()>> + Send;

    fn get_stats(&self) -> TransportStats;

    /// Alias for [`read_03`](Self::read_03)
    fn read_holding_registers(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl std::future::Future<Output = RelayResult<Vec<u16>>> + Send {
        self.read_03(slave_id, address, quantity)
    }
}

/// Generic Modbus client that works with any transport
pub struct GenericModbusClient<T: ModbusTransport> {
    transport: T,
}

impl<T: ModbusTransport> GenericModbusClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Execute a raw request, failing on an exception response
    pub async fn execute_request(&mut self, request: ModbusRequest) -> RelayResult<ModbusResponse> {
        let response = self.transport.request(&request).await?;
        response.check_exception()?;
        Ok(response)
    }
}

impl<T: ModbusTransport> ModbusClient for GenericModbusClient<T> {
    async fn read_03(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> RelayResult<Vec<u16>> {
        if quantity == 0 || quantity as usize > MAX_READ_REGISTERS {
            return Err(RelayError::invalid_data(format!(
                "Invalid quantity {} for FC03",
                quantity
            )));
        }

        let request = ModbusRequest::read_holding(slave_id, address, quantity);
        let response = self.execute_request(request).await?;
        response.parse_registers(quantity)
    }

    async fn write_06(&mut self, slave_id: SlaveId, address: u16, value: u16) -> RelayResult<()> {
        let request = ModbusRequest {
            slave_id,
            function: ModbusFunction::WriteSingleRegister,
            address,
            quantity: 1,
            values: vec![value],
        };

        self.execute_request(request).await?;
        Ok(())
    }

    async fn write_10(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[u16],
    ) -> RelayResult<()> {
        if values.is_empty() || values.len() > MAX_WRITE_REGISTERS {
            return Err(RelayError::invalid_data(format!(
                "Invalid quantity {} for FC16",
                values.len()
            )));
        }

        let request = ModbusRequest {
            slave_id,
            function: ModbusFunction::WriteMultipleRegisters,
            address,
            quantity: values.len() as u16,
            values: values.to_vec(),
        };

        self.execute_request(request).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    async fn close(&mut self) -> RelayResult<()> {
        self.transport.close().await
    }

    fn get_stats(&self) -> TransportStats {
        self.transport.get_stats()
    }
}

/// Modbus TCP client
pub type ModbusTcpClient = GenericModbusClient<TcpTransport>;

impl ModbusTcpClient {
    /// Connect to a device at `addr`
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> RelayResult<Self> {
        let transport = TcpTransport::connect(addr, timeout).await?;
        Ok(Self::new(transport))
    }

    /// Connect to a device given as `host:port`
    pub async fn from_address(addr: &str, timeout: Duration) -> RelayResult<Self> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| RelayError::config(format!("Invalid address {}: {}", addr, e)))?;
        Self::connect(addr, timeout).await
    }
}

/// Modbus RTU client
#[cfg(feature = "rtu")]
pub type ModbusRtuClient = GenericModbusClient<RtuTransport>;

#[cfg(feature = "rtu")]
impl ModbusRtuClient {
    /// Open the serial line described by `settings`
    pub fn open(settings: &SerialSettings, timeout: Duration) -> RelayResult<Self> {
        let transport = RtuTransport::open(settings, timeout)?;
        Ok(Self::new(transport))
    }
}
