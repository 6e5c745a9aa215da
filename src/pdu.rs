//! Optimized Modbus PDU data structure
//!
//! Use a fixed-size stack array to avoid heap allocation on every request and reply.

use tracing::debug;

use crate::constants::{
    EXCEPTION_FLAG, FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS,
    FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_REGISTER, MAX_PDU_SIZE,
};
use crate::error::{RelayError, RelayResult};

/// High-performance PDU with stack-allocated fixed array
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    /// Fixed-size buffer (stack)
    data: [u8; MAX_PDU_SIZE],
    /// Actual data length
    len: usize,
}

impl ModbusPdu {
    /// Create an empty PDU
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Create a PDU from a byte slice
    #[inline]
    pub fn from_slice(data: &[u8]) -> RelayResult<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(RelayError::protocol(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }

        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();

        if let Some(fc) = pdu.function_code() {
            if pdu.is_exception() {
                debug!(
                    "PDU parsed: FC={:02X} (Exception: {}), exception_code={:02X}",
                    fc,
                    Self::function_code_description(fc),
                    pdu.exception_code().unwrap_or(0)
                );
            } else {
                debug!(
                    "PDU parsed: FC={:02X} ({}), data_len={}",
                    fc,
                    Self::function_code_description(fc),
                    pdu.len - 1
                );
            }
        }

        Ok(pdu)
    }

    /// Push a single byte
    #[inline]
    pub fn push(&mut self, byte: u8) -> RelayResult<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(RelayError::protocol("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> RelayResult<()> {
        self.push((value >> 8) as u8)?;
        self.push((value & 0xFF) as u8)?;
        Ok(())
    }

    /// Extend with a byte slice
    #[inline]
    pub fn extend(&mut self, data: &[u8]) -> RelayResult<()> {
        if self.len + data.len() > MAX_PDU_SIZE {
            return Err(RelayError::protocol(format!(
                "PDU would exceed max size: {} + {} > {}",
                self.len,
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    /// Get immutable data slice
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Get current length
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get function code (first byte)
    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        if self.len > 0 {
            Some(self.data[0])
        } else {
            None
        }
    }

    /// Read a big-endian u16 at `offset` (0 is the function code)
    #[inline]
    pub fn u16_at(&self, offset: usize) -> Option<u16> {
        if offset + 2 <= self.len {
            Some(u16::from_be_bytes([self.data[offset], self.data[offset + 1]]))
        } else {
            None
        }
    }

    /// Check if exception response
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(|fc| fc & EXCEPTION_FLAG != 0)
            .unwrap_or(false)
    }

    /// Get exception code
    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() && self.len > 1 {
            Some(self.data[1])
        } else {
            None
        }
    }

    /// Get human-readable function code description
    pub fn function_code_description(fc: u8) -> &'static str {
        match fc & 0x7F {
            0x01 => "Read Coils",
            0x02 => "Read Discrete Inputs",
            0x03 => "Read Holding Registers",
            0x04 => "Read Input Registers",
            0x05 => "Write Single Coil",
            0x06 => "Write Single Register",
            0x0F => "Write Multiple Coils",
            0x10 => "Write Multiple Registers",
            0x17 => "Read/Write Multiple Registers",
            _ => "Unknown Function",
        }
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// PDU builder - fluent API
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl Default for PduBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PduBuilder {
    /// Create a new builder
    #[inline]
    pub fn new() -> Self {
        Self {
            pdu: ModbusPdu::new(),
        }
    }

    /// Set function code
    #[inline]
    pub fn function_code(mut self, fc: u8) -> RelayResult<Self> {
        self.pdu.push(fc)?;
        Ok(self)
    }

    /// Add address
    #[inline]
    pub fn address(mut self, addr: u16) -> RelayResult<Self> {
        self.pdu.push_u16(addr)?;
        Ok(self)
    }

    /// Add quantity
    #[inline]
    pub fn quantity(mut self, qty: u16) -> RelayResult<Self> {
        self.pdu.push_u16(qty)?;
        Ok(self)
    }

    /// Add a byte
    #[inline]
    pub fn byte(mut self, b: u8) -> RelayResult<Self> {
        self.pdu.push(b)?;
        Ok(self)
    }

    /// Add a sequence of registers in big-endian
    #[inline]
    pub fn registers(mut self, values: &[u16]) -> RelayResult<Self> {
        for &value in values {
            self.pdu.push_u16(value)?;
        }
        Ok(self)
    }

    /// Build the PDU
    #[inline]
    pub fn build(self) -> ModbusPdu {
        if let Some(fc) = self.pdu.function_code() {
            debug!(
                "PDU built: FC={:02X} ({}), total_len={}",
                fc,
                ModbusPdu::function_code_description(fc),
                self.pdu.len()
            );
        }

        self.pdu
    }

    /// Build a read registers request PDU (FC03/FC04)
    pub fn build_read_request(
        fc: u8,
        start_address: u16,
        quantity: u16,
    ) -> RelayResult<ModbusPdu> {
        if !matches!(fc, FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS) {
            return Err(RelayError::invalid_function(fc));
        }
        Ok(PduBuilder::new()
            .function_code(fc)?
            .address(start_address)?
            .quantity(quantity)?
            .build())
    }

    /// Build a write single register PDU (FC06)
    ///
    /// The reply to FC06 is an echo of the request, so this also builds the response.
    pub fn build_write_single_register(address: u16, value: u16) -> RelayResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_SINGLE_REGISTER)?
            .address(address)?
            .quantity(value)?
            .build())
    }

    /// Build a write multiple registers PDU (FC16)
    pub fn build_write_multiple_registers(address: u16, values: &[u16]) -> RelayResult<ModbusPdu> {
        let quantity = values.len() as u16;
        let byte_count = (values.len() * 2) as u8;

        PduBuilder::new()
            .function_code(FC_WRITE_MULTIPLE_REGISTERS)?
            .address(address)?
            .quantity(quantity)?
            .byte(byte_count)?
            .registers(values)
            .map(PduBuilder::build)
    }

    /// Build a read registers response: FC + byte count + register data
    pub fn build_read_response(fc: u8, values: &[u16]) -> RelayResult<ModbusPdu> {
        PduBuilder::new()
            .function_code(fc)?
            .byte((values.len() * 2) as u8)?
            .registers(values)
            .map(PduBuilder::build)
    }

    /// Build the FC16 response: FC + start address + quantity written
    pub fn build_write_multiple_response(address: u16, quantity: u16) -> RelayResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_MULTIPLE_REGISTERS)?
            .address(address)?
            .quantity(quantity)?
            .build())
    }

    /// Build an exception response for `fc`
    pub fn build_exception(fc: u8, code: u8) -> ModbusPdu {
        let mut pdu = ModbusPdu::new();
        // Two bytes always fit in an empty PDU
        pdu.data[0] = fc | EXCEPTION_FLAG;
        pdu.data[1] = code;
        pdu.len = 2;
        debug!(
            "PDU built: exception FC={:02X} ({}), code={:02X}",
            fc,
            ModbusPdu::function_code_description(fc),
            code
        );
        pdu
    }
}
