//! # Register value codec
//!
//! Conversion between raw holding registers and the values written to the
//! output socket.
//!
//! ## Supported Data Types
//!
//! | Type | Registers | Aliases |
//! |------|-----------|---------|
//! | Integer16 | 1 | int, integer, int16, uint16 |
//! | Float32MsbFirst | 2 | floatmsb, float32msb, float |
//! | Float32LsbFirst | 2 | floatlsb, float32lsb |
//!
//! A float occupies two registers. In MSB-first word order the first register
//! carries the high 16 bits of the IEEE-754 pattern; in LSB-first order the
//! registers are swapped. Bytes inside each register are always big-endian.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// How a run of registers is interpreted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ValueType {
    #[default]
    Integer16,
    Float32MsbFirst,
    Float32LsbFirst,
}

impl ValueType {
    /// Registers consumed by one value
    pub fn register_stride(self) -> u16 {
        match self {
            Self::Integer16 => 1,
            Self::Float32MsbFirst | Self::Float32LsbFirst => 2,
        }
    }

    pub fn is_float(self) -> bool {
        self.register_stride() == 2
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Integer16 => "int",
            Self::Float32MsbFirst => "floatmsb",
            Self::Float32LsbFirst => "floatlsb",
        }
    }
}

impl FromStr for ValueType {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "int" | "integer" | "int16" | "uint16" => Ok(Self::Integer16),
            "floatmsb" | "float32msb" | "float" => Ok(Self::Float32MsbFirst),
            "floatlsb" | "float32lsb" => Ok(Self::Float32LsbFirst),
            other => Err(RelayError::config(format!("Unknown register type: {}", other))),
        }
    }
}

impl TryFrom<String> for ValueType {
    type Error = RelayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ValueType> for String {
    fn from(value: ValueType) -> Self {
        value.name().to_string()
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One decoded value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodedValue {
    Integer(u16),
    Float(f32),
}

impl fmt::Display for DecodedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{:.6}", v),
        }
    }
}

/// Reassemble a float from two registers in the given word order
#[inline]
pub fn decode_float(regs: [u16; 2], msb_first: bool) -> f32 {
    let [high, low] = if msb_first { regs } else { [regs[1], regs[0]] };
    f32::from_bits(((high as u32) << 16) | low as u32)
}

/// Decode a register run into values.
///
/// Integer runs yield one value per register. Float runs yield one value per
/// register pair; a trailing odd register is ignored.
pub fn decode(raw: &[u16], ty: ValueType) -> Vec<DecodedValue> {
    match ty {
        ValueType::Integer16 => raw.iter().copied().map(DecodedValue::Integer).collect(),
        ValueType::Float32MsbFirst | ValueType::Float32LsbFirst => {
            let msb_first = ty == ValueType::Float32MsbFirst;
            raw.chunks_exact(2)
                .map(|pair| DecodedValue::Float(decode_float([pair[0], pair[1]], msb_first)))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_value_type_aliases() {
        assert_eq!("int".parse::<ValueType>().unwrap(), ValueType::Integer16);
        assert_eq!("UINT16".parse::<ValueType>().unwrap(), ValueType::Integer16);
        assert_eq!("float".parse::<ValueType>().unwrap(), ValueType::Float32MsbFirst);
        assert_eq!("float32lsb".parse::<ValueType>().unwrap(), ValueType::Float32LsbFirst);
        assert!("double".parse::<ValueType>().is_err());
        assert_eq!(ValueType::default(), ValueType::Integer16);
    }

    #[test]
    fn test_decode_integers() {
        let values = decode(&[0, 1234, 0xFFFF], ValueType::Integer16);
        let rendered: Vec<String> = values.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["0", "1234", "65535"]);
    }

    #[test]
    fn test_decode_float_msb_first() {
        // 12345.6f32 == 0x4640E666
        let values = decode(&[0x4640, 0xE666], ValueType::Float32MsbFirst);
        assert_eq!(values, vec![DecodedValue::Float(12345.6)]);
        assert_eq!(values[0].to_string(), "12345.599609");
    }

    #[test]
    fn test_decode_float_lsb_first() {
        // 789.0f32 == 0x44454000
        let values = decode(&[0x4000, 0x4445], ValueType::Float32LsbFirst);
        assert_eq!(values[0].to_string(), "789.000000");
    }

    #[test]
    fn test_decode_float_ignores_trailing_register() {
        let values = decode(&[0x3F80, 0x0000, 0x1234], ValueType::Float32MsbFirst);
        assert_eq!(values, vec![DecodedValue::Float(1.0)]);
    }

    #[test]
    fn test_register_stride() {
        assert_eq!(ValueType::Integer16.register_stride(), 1);
        assert_eq!(ValueType::Float32LsbFirst.register_stride(), 2);
        assert!(ValueType::Float32MsbFirst.is_float());
    }

    proptest! {
        #[test]
        fn word_order_is_a_swap(w0 in any::<u16>(), w1 in any::<u16>()) {
            let msb = decode_float([w0, w1], true);
            let lsb = decode_float([w1, w0], false);
            prop_assert_eq!(msb.to_bits(), lsb.to_bits());
        }

        #[test]
        fn float_bits_are_preserved(bits in any::<u32>()) {
            let regs = [(bits >> 16) as u16, bits as u16];
            prop_assert_eq!(decode_float(regs, true).to_bits(), bits);
        }
    }
}
