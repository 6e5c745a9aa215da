//! Modbus protocol constants used by the relay
//!
//! Frame sizes and register limits follow the official Modbus specification:
//! - Maximum PDU size: 253 bytes (inherited from RS485 ADU limit of 256 bytes)
//! - Register limits are calculated to fit within the PDU size constraint

// ============================================================================
// Frame Size Constants
// ============================================================================

/// MBAP header length without the Unit ID
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2) = 6 bytes
/// The Length field counts the Unit ID and the PDU.
pub const MBAP_HEADER_LEN: usize = 6;

/// Bytes preceding the function code in a Modbus TCP request (MBAP + Unit ID)
pub const TCP_HEADER_LENGTH: usize = MBAP_HEADER_LEN + 1;

/// Bytes preceding the function code in a Modbus RTU request (Slave ID)
pub const RTU_HEADER_LENGTH: usize = 1;

/// CRC16 trailer length of an RTU frame
pub const RTU_CRC_LEN: usize = 2;

/// Maximum PDU (Protocol Data Unit) size per Modbus specification
/// RS485 ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU)
/// = 1 (Unit ID) + 253 (Max PDU) = 254 bytes
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Largest complete Modbus TCP frame: 6 + 254 = 260 bytes
pub const MAX_TCP_FRAME_LEN: usize = MBAP_HEADER_LEN + MAX_MBAP_LENGTH;

/// Protocol identifier carried in every MBAP header
pub const MBAP_PROTOCOL_ID: u16 = 0;

// ============================================================================
// Register Operation Limits
// ============================================================================

/// Maximum number of registers for FC03/FC04 (Read Holding/Input Registers)
///
/// Response PDU: Function Code(1) + Byte Count(1) + N × 2 ≤ 253
/// Therefore: N ≤ (253 - 2) / 2 = 125.5 → 125 registers
pub const MAX_READ_REGISTERS: usize = 125;

/// Maximum number of registers for FC16 (Write Multiple Registers)
///
/// Request PDU: Function Code(1) + Address(2) + Quantity(2) + Byte Count(1) + N × 2 ≤ 253
/// Therefore: N ≤ (253 - 6) / 2 = 123.5 → 123 registers
pub const MAX_WRITE_REGISTERS: usize = 123;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Read Input Registers (FC04)
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

/// Write Single Register (FC06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Write Multiple Registers (FC16)
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Modbus Exception Codes
// ============================================================================

/// Illegal Function
pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;

/// Illegal Data Address
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;

/// Illegal Data Value
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;
