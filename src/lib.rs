//! # Voltage Relay - Modbus field-data relay
//!
//! Moves register data from Modbus field devices to a local consumer process
//! over a Unix stream socket, one text line per reading:
//!
//! ```text
//! mb_plant1_100 1234|mb_plant1_101 56.750000
//! ```
//!
//! ## Roles
//!
//! - **poll**: reads configured register runs from one or more devices on a
//!   wall-clock aligned interval ([`Scheduler`]).
//! - **serve**: answers Modbus TCP requests from a local register map and relays
//!   every write it receives ([`Listener`]).
//!
//! Both roles hand their records to the [`OutputTransport`], which reconnects to
//! the consumer and retries until each message is written.
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Client | Server |
//! |------|----------|--------|--------|
//! | 0x03 | Read Holding Registers | ✅ | ✅ |
//! | 0x06 | Write Single Register | ✅ | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ | ✅ |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use voltage_relay::{
//!     DeviceLine, OutputTransport, ReadSpec, Scheduler, Target, ValueType, RelayResult,
//! };
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> RelayResult<()> {
//!     let targets = vec![Target {
//!         id: 1,
//!         name: Some("plant1".to_string()),
//!         endpoint: None,
//!         specs: vec![ReadSpec { address: 100, length: 2, value_type: ValueType::Float32MsbFirst }],
//!     }];
//!
//!     let line = DeviceLine::open_tcp("127.0.0.1:502".parse().unwrap(), &targets, Duration::from_secs(1)).await?;
//!     let output = OutputTransport::new("/tmp/mbsocket");
//!     let mut scheduler = Scheduler::new(targets, line, output, Duration::from_secs(10));
//!
//!     scheduler.run(&CancellationToken::new()).await
//! }
//! ```

// ============================================================================
// Field protocol
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Modbus protocol constants based on official specification
pub mod constants;

/// High-performance PDU with stack-allocated fixed array
pub mod pdu;

/// Modbus protocol definitions and message framing
pub mod protocol;

/// Device-side transport layer for TCP and RTU communication
pub mod transport;

/// Modbus client implementations
pub mod client;

/// Holding registers served in serve mode
pub mod register_map;

/// Register value decoding
pub mod codec;

// ============================================================================
// Relay engine
// ============================================================================

/// Record formatting and the consumer connection
pub mod output;

/// Aligned polling of remote devices
pub mod scheduler;

/// Connection bookkeeping for the listener
pub mod descriptor_set;

/// Modbus TCP register server
pub mod listener;

// ============================================================================
// Service plumbing
// ============================================================================

/// Layered configuration and command-line arguments
pub mod config;

/// Logging setup and packet tracing helpers
pub mod logging;

/// Supervisor with signal handling and reload
pub mod relay;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Error handling ===
pub use error::{RelayError, RelayResult};

// === Field protocol ===
pub use client::{GenericModbusClient, ModbusClient, ModbusTcpClient};
pub use pdu::{ModbusPdu, PduBuilder};
pub use protocol::{reply_to_request, Framing, ModbusFunction, ModbusRequest, ModbusResponse, SlaveId};
pub use register_map::RegisterMap;
pub use transport::{ModbusTransport, StreamTransport, TcpTransport, TransportStats};

// === Relay engine ===
pub use codec::{decode, DecodedValue, ValueType};
pub use descriptor_set::DescriptorSet;
pub use listener::{detect_write, Listener, WriteRange};
pub use output::{
    serialize_records, Delivery, OutputRecord, OutputStats, OutputTransport, RecordSink,
};
pub use scheduler::{next_boundary, DeviceLine, ReadSpec, RegisterSource, Schedule, Scheduler, Target};

// === Configuration ===
pub use config::{Args, ConfigFile, RelayConfig, Role};

// === Protocol limits (commonly needed constants) ===
pub use constants::{
    FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_REGISTER, MAX_PDU_SIZE, MAX_READ_REGISTERS,
    MAX_WRITE_REGISTERS,
};

#[cfg(feature = "rtu")]
pub use client::ModbusRtuClient;

#[cfg(feature = "rtu")]
pub use transport::{RtuTransport, SerialSettings};
