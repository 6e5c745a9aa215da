//! Error types for the relay
//!
//! A single error enum covers the field protocol, the downstream output socket
//! and configuration. Callers decide containment: device-read and
//! per-connection errors are logged and skipped, configuration errors are fatal.

use std::io;

use thiserror::Error;

/// Result type used throughout the crate
pub type RelayResult<T> = Result<T, RelayError>;

/// Relay error
#[derive(Error, Debug)]
pub enum RelayError {
    /// Invalid or inconsistent configuration
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Device-side connection could not be established or was lost
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// No response within the allotted time
    #[error("Timeout: {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Malformed frame or unexpected response
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Function code not supported
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Request or response data out of range
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Modbus exception reported by the remote device
    #[error("Modbus exception: function 0x{function:02X}, code 0x{code:02X}")]
    Exception { function: u8, code: u8 },

    /// Downstream consumer socket failure
    #[error("Output error: {message}")]
    Output { message: String },
}

impl RelayError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    pub fn output(message: impl Into<String>) -> Self {
        Self::Output {
            message: message.into(),
        }
    }

    /// Whether the failure is transient and the operation may succeed later.
    ///
    /// Configuration errors and unsupported functions never heal by retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Connection { .. }
                | Self::Timeout { .. }
                | Self::Output { .. }
                | Self::Exception { .. }
        )
    }

    /// Whether the device-side link should be dropped and reopened.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Connection { .. } | Self::Timeout { .. } | Self::Protocol { .. }
        )
    }
}

impl From<figment::Error> for RelayError {
    fn from(err: figment::Error) -> Self {
        Self::config(err.to_string())
    }
}

/// Human-readable name of a Modbus exception code
pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Server Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Server Device Busy",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RelayError::timeout("read_03", 1000);
        assert_eq!(err.to_string(), "Timeout: read_03 after 1000ms");

        let err = RelayError::Exception {
            function: 0x03,
            code: 0x02,
        };
        assert_eq!(
            err.to_string(),
            "Modbus exception: function 0x03, code 0x02"
        );
        assert_eq!(exception_description(0x02), "Illegal Data Address");
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(RelayError::output("broken pipe").is_recoverable());
        assert!(RelayError::connection("refused").is_recoverable());
        assert!(!RelayError::config("bad interval").is_recoverable());
        assert!(!RelayError::invalid_function(0x2B).is_recoverable());
    }

    #[test]
    fn test_link_failure_classification() {
        assert!(RelayError::protocol("bad crc").is_link_failure());
        assert!(!RelayError::Exception {
            function: 0x03,
            code: 0x02
        }
        .is_link_failure());
    }
}
