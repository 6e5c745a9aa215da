//! Modbus protocol definitions and message framing
//!
//! TCP and RTU share the same application layer (PDU) and differ only in
//! encapsulation:
//! - **TCP**: MBAP Header + Unit ID + PDU
//! - **RTU**: Slave ID + PDU + CRC16
//!
//! [`Framing`] captures that difference so the client, the listener and
//! [`reply_to_request`] stay transport-agnostic.

use crc::{Crc, CRC_16_MODBUS};
use tracing::debug;

use crate::constants::{
    EXCEPTION_FLAG, FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS,
    FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_REGISTER, MAX_MBAP_LENGTH, MBAP_HEADER_LEN,
    MBAP_PROTOCOL_ID, RTU_CRC_LEN, RTU_HEADER_LENGTH, TCP_HEADER_LENGTH,
};
use crate::error::{RelayError, RelayResult};
use crate::pdu::{ModbusPdu, PduBuilder};
use crate::register_map::RegisterMap;

/// Modbus slave/unit identifier
pub type SlaveId = u8;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Register function codes understood by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModbusFunction {
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleRegister,
    WriteMultipleRegisters,
}

impl ModbusFunction {
    pub fn from_u8(code: u8) -> RelayResult<Self> {
        match code {
            FC_READ_HOLDING_REGISTERS => Ok(Self::ReadHoldingRegisters),
            FC_READ_INPUT_REGISTERS => Ok(Self::ReadInputRegisters),
            FC_WRITE_SINGLE_REGISTER => Ok(Self::WriteSingleRegister),
            FC_WRITE_MULTIPLE_REGISTERS => Ok(Self::WriteMultipleRegisters),
            _ => Err(RelayError::invalid_function(code)),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::ReadHoldingRegisters => FC_READ_HOLDING_REGISTERS,
            Self::ReadInputRegisters => FC_READ_INPUT_REGISTERS,
            Self::WriteSingleRegister => FC_WRITE_SINGLE_REGISTER,
            Self::WriteMultipleRegisters => FC_WRITE_MULTIPLE_REGISTERS,
        }
    }

    pub fn is_write(self) -> bool {
        matches!(
            self,
            Self::WriteSingleRegister | Self::WriteMultipleRegisters
        )
    }
}

/// Client-side request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusRequest {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    pub address: u16,
    /// Registers to read, or registers written
    pub quantity: u16,
    /// Register values for write requests
    pub values: Vec<u16>,
}

impl ModbusRequest {
    pub fn read_holding(slave_id: SlaveId, address: u16, quantity: u16) -> Self {
        Self {
            slave_id,
            function: ModbusFunction::ReadHoldingRegisters,
            address,
            quantity,
            values: Vec::new(),
        }
    }

    pub fn to_pdu(&self) -> RelayResult<ModbusPdu> {
        match self.function {
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                PduBuilder::build_read_request(self.function.to_u8(), self.address, self.quantity)
            }
            ModbusFunction::WriteSingleRegister => {
                let value = self
                    .values
                    .first()
                    .copied()
                    .ok_or_else(|| RelayError::invalid_data("No value for single register write"))?;
                PduBuilder::build_write_single_register(self.address, value)
            }
            ModbusFunction::WriteMultipleRegisters => {
                PduBuilder::build_write_multiple_registers(self.address, &self.values)
            }
        }
    }
}

/// Response received by the client
#[derive(Debug, Clone)]
pub struct ModbusResponse {
    pub slave_id: SlaveId,
    pub pdu: ModbusPdu,
}

impl ModbusResponse {
    pub fn new(slave_id: SlaveId, pdu: ModbusPdu) -> Self {
        Self { slave_id, pdu }
    }

    /// Fail with [`RelayError::Exception`] if the device answered with an exception
    pub fn check_exception(&self) -> RelayResult<()> {
        match (self.pdu.function_code(), self.pdu.exception_code()) {
            (Some(fc), Some(code)) if fc & EXCEPTION_FLAG != 0 => Err(RelayError::Exception {
                function: fc & !EXCEPTION_FLAG,
                code,
            }),
            _ => Ok(()),
        }
    }

    /// Decode the register payload of an FC03/FC04 response, skipping the byte count
    pub fn parse_registers(&self, expected: u16) -> RelayResult<Vec<u16>> {
        self.check_exception()?;

        let data = self.pdu.as_slice();
        if data.len() < 2 {
            return Err(RelayError::protocol("Read response too short"));
        }
        let byte_count = data[1] as usize;
        if byte_count != expected as usize * 2 || data.len() != 2 + byte_count {
            return Err(RelayError::protocol(format!(
                "Read response carries {} bytes, expected {} registers",
                byte_count, expected
            )));
        }

        Ok(data[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }
}

/// Wire encapsulation of a PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Tcp,
    Rtu,
}

impl Framing {
    /// Offset of the function code within a raw request
    pub fn header_length(self) -> usize {
        match self {
            Self::Tcp => TCP_HEADER_LENGTH,
            Self::Rtu => RTU_HEADER_LENGTH,
        }
    }

    /// Wrap a PDU into an ADU. `transaction_id` is ignored for RTU.
    pub fn encode(self, transaction_id: u16, slave_id: SlaveId, pdu: &ModbusPdu) -> Vec<u8> {
        match self {
            Self::Tcp => {
                let mut frame = Vec::with_capacity(TCP_HEADER_LENGTH + pdu.len());
                frame.extend_from_slice(&transaction_id.to_be_bytes());
                frame.extend_from_slice(&MBAP_PROTOCOL_ID.to_be_bytes());
                frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
                frame.push(slave_id);
                frame.extend_from_slice(pdu.as_slice());
                frame
            }
            Self::Rtu => {
                let mut frame = Vec::with_capacity(RTU_HEADER_LENGTH + pdu.len() + RTU_CRC_LEN);
                frame.push(slave_id);
                frame.extend_from_slice(pdu.as_slice());
                let crc = MODBUS_CRC.checksum(&frame);
                frame.extend_from_slice(&crc.to_le_bytes());
                frame
            }
        }
    }

    /// Split a complete ADU into transaction id, slave id and PDU, validating
    /// the MBAP header or the CRC.
    pub fn decode(self, frame: &[u8]) -> RelayResult<(u16, SlaveId, ModbusPdu)> {
        match self {
            Self::Tcp => {
                let frame_len = mbap_frame_len(frame)?
                    .ok_or_else(|| RelayError::protocol("Incomplete MBAP frame"))?;
                if frame_len != frame.len() {
                    return Err(RelayError::protocol(format!(
                        "MBAP length mismatch: header says {} bytes, got {}",
                        frame_len,
                        frame.len()
                    )));
                }
                let transaction_id = u16::from_be_bytes([frame[0], frame[1]]);
                let pdu = ModbusPdu::from_slice(&frame[TCP_HEADER_LENGTH..])?;
                Ok((transaction_id, frame[MBAP_HEADER_LEN], pdu))
            }
            Self::Rtu => {
                if frame.len() < RTU_HEADER_LENGTH + 1 + RTU_CRC_LEN {
                    return Err(RelayError::protocol("RTU frame too short"));
                }
                let (body, crc) = frame.split_at(frame.len() - RTU_CRC_LEN);
                let expected = MODBUS_CRC.checksum(body);
                let received = u16::from_le_bytes([crc[0], crc[1]]);
                if expected != received {
                    return Err(RelayError::protocol(format!(
                        "CRC mismatch: expected {:04X}, received {:04X}",
                        expected, received
                    )));
                }
                let pdu = ModbusPdu::from_slice(&body[RTU_HEADER_LENGTH..])?;
                Ok((0, body[0], pdu))
            }
        }
    }
}

/// Length of the complete MBAP frame at the start of `buf`.
///
/// Returns `Ok(None)` while the header itself is incomplete and an error when
/// the header cannot belong to a Modbus TCP frame.
pub fn mbap_frame_len(buf: &[u8]) -> RelayResult<Option<usize>> {
    if buf.len() < MBAP_HEADER_LEN {
        return Ok(None);
    }
    let protocol_id = u16::from_be_bytes([buf[2], buf[3]]);
    if protocol_id != MBAP_PROTOCOL_ID {
        return Err(RelayError::protocol(format!(
            "Unexpected MBAP protocol id {}",
            protocol_id
        )));
    }
    let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    if length < 2 || length > MAX_MBAP_LENGTH {
        return Err(RelayError::protocol(format!(
            "Invalid MBAP length field {}",
            length
        )));
    }
    Ok(Some(MBAP_HEADER_LEN + length))
}

/// Total length of an RTU response given its first three bytes
/// (slave id, function code, byte count or address high byte).
pub fn rtu_response_len(head: &[u8; 3]) -> RelayResult<usize> {
    let fc = head[1];
    if fc & EXCEPTION_FLAG != 0 {
        return Ok(RTU_HEADER_LENGTH + 2 + RTU_CRC_LEN);
    }
    match fc {
        0x01..=0x04 => Ok(RTU_HEADER_LENGTH + 2 + head[2] as usize + RTU_CRC_LEN),
        0x05 | 0x06 | 0x0F | 0x10 => Ok(RTU_HEADER_LENGTH + 5 + RTU_CRC_LEN),
        _ => Err(RelayError::invalid_function(fc)),
    }
}

/// Answer a raw request ADU against the local register map.
///
/// Returns the reply ADU, echoing the transaction and unit ids of the request.
/// Requests the map cannot honour are answered with a Modbus exception;
/// only a malformed frame is reported as an error.
pub fn reply_to_request(
    framing: Framing,
    request: &[u8],
    map: &mut RegisterMap,
) -> RelayResult<Vec<u8>> {
    let (transaction_id, slave_id, pdu) = framing.decode(request)?;
    let reply = map.handle(&pdu);
    debug!(
        "Replying to unit {} FC={:02X} with {} bytes",
        slave_id,
        pdu.function_code().unwrap_or(0),
        reply.len()
    );
    Ok(framing.encode(transaction_id, slave_id, &reply))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_code_roundtrip() {
        for code in [0x03, 0x04, 0x06, 0x10] {
            assert_eq!(ModbusFunction::from_u8(code).unwrap().to_u8(), code);
        }
        assert!(ModbusFunction::from_u8(0x2B).is_err());
        assert!(ModbusFunction::WriteMultipleRegisters.is_write());
        assert!(!ModbusFunction::ReadHoldingRegisters.is_write());
    }

    #[test]
    fn test_tcp_encode() {
        let pdu = PduBuilder::build_read_request(0x03, 0x0000, 2).unwrap();
        let frame = Framing::Tcp.encode(0x0102, 1, &pdu);
        assert_eq!(
            frame,
            vec![0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02]
        );
        assert_eq!(frame[Framing::Tcp.header_length()], 0x03);
    }

    #[test]
    fn test_rtu_encode_known_crc() {
        // Classic reference frame: slave 1, FC03, address 0, quantity 1 → CRC 0x0A84
        let pdu = PduBuilder::build_read_request(0x03, 0x0000, 1).unwrap();
        let frame = Framing::Rtu.encode(0, 1, &pdu);
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
        assert_eq!(frame[Framing::Rtu.header_length()], 0x03);
    }

    #[test]
    fn test_rtu_decode_rejects_bad_crc() {
        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0B];
        assert!(Framing::Rtu.decode(&frame).is_err());

        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A];
        let (_, slave, pdu) = Framing::Rtu.decode(&frame).unwrap();
        assert_eq!(slave, 1);
        assert_eq!(pdu.as_slice(), &[0x03, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_mbap_frame_len() {
        assert_eq!(mbap_frame_len(&[0x00, 0x01, 0x00]).unwrap(), None);
        assert_eq!(
            mbap_frame_len(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06]).unwrap(),
            Some(12)
        );
        // Wrong protocol id
        assert!(mbap_frame_len(&[0x00, 0x01, 0x00, 0x07, 0x00, 0x06]).is_err());
        // Length beyond the largest PDU
        assert!(mbap_frame_len(&[0x00, 0x01, 0x00, 0x00, 0x01, 0x00]).is_err());
    }

    #[test]
    fn test_rtu_response_len() {
        assert_eq!(rtu_response_len(&[0x01, 0x03, 0x04]).unwrap(), 9);
        assert_eq!(rtu_response_len(&[0x01, 0x10, 0x00]).unwrap(), 8);
        assert_eq!(rtu_response_len(&[0x01, 0x83, 0x02]).unwrap(), 5);
        assert!(rtu_response_len(&[0x01, 0x2B, 0x00]).is_err());
    }

    #[test]
    fn test_parse_registers() {
        let pdu = PduBuilder::build_read_response(0x03, &[0x0001, 0x0002]).unwrap();
        let response = ModbusResponse::new(1, pdu);
        assert_eq!(response.parse_registers(2).unwrap(), vec![1, 2]);
        assert!(response.parse_registers(3).is_err());

        let response = ModbusResponse::new(1, PduBuilder::build_exception(0x03, 0x02));
        match response.parse_registers(2) {
            Err(RelayError::Exception { function, code }) => {
                assert_eq!(function, 0x03);
                assert_eq!(code, 0x02);
            }
            other => panic!("Expected exception, got {:?}", other),
        }
    }

    #[test]
    fn test_reply_to_request_echoes_header() {
        let mut map = RegisterMap::new(10);
        let pdu = PduBuilder::build_write_single_register(3, 0xBEEF).unwrap();
        let request = Framing::Tcp.encode(0x00AA, 7, &pdu);

        let reply = reply_to_request(Framing::Tcp, &request, &mut map).unwrap();
        // FC06 reply echoes the request
        assert_eq!(reply, request);
        assert_eq!(map.slice(3, 1), Some(&[0xBEEF][..]));
    }
}
