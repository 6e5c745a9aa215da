//! Local holding-register map served in the serve role

use tracing::debug;

use crate::constants::{
    EXCEPTION_ILLEGAL_DATA_ADDRESS, EXCEPTION_ILLEGAL_DATA_VALUE, EXCEPTION_ILLEGAL_FUNCTION,
    FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS,
    FC_WRITE_SINGLE_REGISTER, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS,
};
use crate::error::exception_description;
use crate::pdu::{ModbusPdu, PduBuilder};

/// Default number of holding registers exposed in serve mode
pub const DEFAULT_REGISTER_COUNT: u16 = 400;

/// Contiguous block of holding registers starting at address 0.
///
/// There are no coils or input registers: any request for them is answered
/// with an exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMap {
    registers: Vec<u16>,
}

impl RegisterMap {
    pub fn new(count: u16) -> Self {
        Self {
            registers: vec![0; count as usize],
        }
    }

    /// Build a map from initial register contents
    pub fn from_registers(registers: Vec<u16>) -> Self {
        Self { registers }
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// Registers `address..address + count`, if the whole range exists
    pub fn slice(&self, address: u16, count: u16) -> Option<&[u16]> {
        let start = address as usize;
        let end = start.checked_add(count as usize)?;
        self.registers.get(start..end)
    }

    fn slice_mut(&mut self, address: u16, count: u16) -> Option<&mut [u16]> {
        let start = address as usize;
        let end = start.checked_add(count as usize)?;
        self.registers.get_mut(start..end)
    }

    /// Execute one request PDU and produce the response PDU
    pub fn handle(&mut self, request: &ModbusPdu) -> ModbusPdu {
        let Some(fc) = request.function_code() else {
            return PduBuilder::build_exception(0, EXCEPTION_ILLEGAL_FUNCTION);
        };

        let result = match fc {
            FC_READ_HOLDING_REGISTERS => self.read_holding(request),
            // No input registers are mapped
            FC_READ_INPUT_REGISTERS => Err(EXCEPTION_ILLEGAL_DATA_ADDRESS),
            FC_WRITE_SINGLE_REGISTER => self.write_single(request),
            FC_WRITE_MULTIPLE_REGISTERS => self.write_multiple(request),
            _ => Err(EXCEPTION_ILLEGAL_FUNCTION),
        };

        result.unwrap_or_else(|code| {
            debug!(
                "Request FC={:02X} ({}) rejected: {}",
                fc,
                ModbusPdu::function_code_description(fc),
                exception_description(code)
            );
            PduBuilder::build_exception(fc, code)
        })
    }

    fn read_holding(&self, request: &ModbusPdu) -> Result<ModbusPdu, u8> {
        let (address, quantity) = address_and_quantity(request)?;
        if quantity == 0 || quantity as usize > MAX_READ_REGISTERS {
            return Err(EXCEPTION_ILLEGAL_DATA_VALUE);
        }
        let values = self
            .slice(address, quantity)
            .ok_or(EXCEPTION_ILLEGAL_DATA_ADDRESS)?;
        PduBuilder::build_read_response(FC_READ_HOLDING_REGISTERS, values)
            .map_err(|_| EXCEPTION_ILLEGAL_DATA_VALUE)
    }

    fn write_single(&mut self, request: &ModbusPdu) -> Result<ModbusPdu, u8> {
        let (address, value) = address_and_quantity(request)?;
        let slot = self
            .slice_mut(address, 1)
            .ok_or(EXCEPTION_ILLEGAL_DATA_ADDRESS)?;
        slot[0] = value;
        PduBuilder::build_write_single_register(address, value)
            .map_err(|_| EXCEPTION_ILLEGAL_DATA_VALUE)
    }

    fn write_multiple(&mut self, request: &ModbusPdu) -> Result<ModbusPdu, u8> {
        let (address, quantity) = address_and_quantity(request)?;
        let data = request.as_slice();
        let byte_count = *data.get(5).ok_or(EXCEPTION_ILLEGAL_DATA_VALUE)? as usize;
        if quantity == 0
            || quantity as usize > MAX_WRITE_REGISTERS
            || byte_count != quantity as usize * 2
            || data.len() != 6 + byte_count
        {
            return Err(EXCEPTION_ILLEGAL_DATA_VALUE);
        }

        let slots = self
            .slice_mut(address, quantity)
            .ok_or(EXCEPTION_ILLEGAL_DATA_ADDRESS)?;
        for (slot, pair) in slots.iter_mut().zip(data[6..].chunks_exact(2)) {
            *slot = u16::from_be_bytes([pair[0], pair[1]]);
        }
        PduBuilder::build_write_multiple_response(address, quantity)
            .map_err(|_| EXCEPTION_ILLEGAL_DATA_VALUE)
    }
}

fn address_and_quantity(request: &ModbusPdu) -> Result<(u16, u16), u8> {
    match (request.u16_at(1), request.u16_at(3)) {
        (Some(address), Some(quantity)) => Ok((address, quantity)),
        _ => Err(EXCEPTION_ILLEGAL_DATA_VALUE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_holding_registers() {
        let mut map = RegisterMap::from_registers(vec![10, 20, 30, 40]);
        let request = PduBuilder::build_read_request(0x03, 1, 2).unwrap();
        let response = map.handle(&request);
        assert_eq!(response.as_slice(), &[0x03, 0x04, 0x00, 20, 0x00, 30]);
    }

    #[test]
    fn test_read_out_of_range() {
        let mut map = RegisterMap::new(4);
        let request = PduBuilder::build_read_request(0x03, 3, 2).unwrap();
        let response = map.handle(&request);
        assert_eq!(response.as_slice(), &[0x83, EXCEPTION_ILLEGAL_DATA_ADDRESS]);
    }

    #[test]
    fn test_write_single_then_read() {
        let mut map = RegisterMap::new(4);
        let request = PduBuilder::build_write_single_register(0, 1234).unwrap();
        let response = map.handle(&request);
        assert_eq!(response.as_slice(), request.as_slice());
        assert_eq!(map.slice(0, 1), Some(&[1234][..]));
    }

    #[test]
    fn test_write_multiple() {
        let mut map = RegisterMap::new(4);
        let request = PduBuilder::build_write_multiple_registers(1, &[5678, 9012]).unwrap();
        let response = map.handle(&request);
        assert_eq!(response.as_slice(), &[0x10, 0x00, 0x01, 0x00, 0x02]);
        assert_eq!(map.slice(1, 2), Some(&[5678, 9012][..]));
    }

    #[test]
    fn test_write_multiple_inconsistent_byte_count() {
        let mut map = RegisterMap::new(4);
        let request =
            ModbusPdu::from_slice(&[0x10, 0x00, 0x00, 0x00, 0x02, 0x02, 0x00, 0x01]).unwrap();
        let response = map.handle(&request);
        assert_eq!(response.as_slice(), &[0x90, EXCEPTION_ILLEGAL_DATA_VALUE]);
        assert_eq!(map.slice(0, 2), Some(&[0, 0][..]));
    }

    #[test]
    fn test_unsupported_functions() {
        let mut map = RegisterMap::new(4);
        let request = ModbusPdu::from_slice(&[0x01, 0x00, 0x00, 0x00, 0x08]).unwrap();
        assert_eq!(
            map.handle(&request).as_slice(),
            &[0x81, EXCEPTION_ILLEGAL_FUNCTION]
        );

        let request = PduBuilder::build_read_request(0x04, 0, 1).unwrap();
        assert_eq!(
            map.handle(&request).as_slice(),
            &[0x84, EXCEPTION_ILLEGAL_DATA_ADDRESS]
        );
    }
}
