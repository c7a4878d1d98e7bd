//! Error types and result handling.
//!
//! All fallible operations in the library return [`ModbusResult`]. Transport
//! failures, framing failures, timeouts and Modbus protocol exceptions are
//! kept in distinct variants of a single [`ModbusError`] enum so callers can
//! match on exactly the condition they care about.

use std::fmt;
use std::io;

use thiserror::Error;

/// Result type used throughout the library
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Errors raised by the library
#[derive(Debug, Error)]
pub enum ModbusError {
    /// Port, socket or readiness failure on the underlying transport
    #[error("I/O failure during {operation}: {source}")]
    Io {
        /// Operation that failed ("connect", "write", "read", ...)
        operation: &'static str,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// The peer closed the connection (zero-length read)
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The context has no open transport
    #[error("not connected")]
    NotConnected,

    /// No (or not enough) bytes arrived within the configured window
    #[error("timeout waiting for {operation}")]
    Timeout {
        /// What was being waited on
        operation: &'static str,
    },

    /// RTU checksum mismatch
    #[error("invalid CRC: received {received:#06X}, computed {computed:#06X}")]
    InvalidCrc {
        /// CRC recomputed over the received frame
        computed: u16,
        /// CRC carried by the frame trailer
        received: u16,
    },

    /// More bytes accumulated than the largest legal frame
    #[error("frame exceeds the maximum packet size of {max} bytes")]
    TooManyData {
        /// The maximum ADU size
        max: usize,
    },

    /// Exception response carried a code outside the published table
    #[error("invalid exception code {code:#04X}")]
    InvalidExceptionCode {
        /// Raw code byte from the response
        code: u8,
    },

    /// The remote server answered with a Modbus exception
    #[error("server exception: {0}")]
    Exception(ModbusException),

    /// Structurally malformed frame (too short, inconsistent byte count, ...)
    #[error("malformed frame: {message}")]
    Frame {
        /// Description of the defect
        message: String,
    },

    /// Request rejected locally before anything was sent
    #[error("invalid request data: {message}")]
    InvalidData {
        /// Description of the violated bound
        message: String,
    },

    /// Context or transport configuration error
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem
        message: String,
    },
}

impl ModbusError {
    pub(crate) fn io(operation: &'static str, source: io::Error) -> Self {
        ModbusError::Io { operation, source }
    }

    pub(crate) fn frame(message: impl Into<String>) -> Self {
        ModbusError::Frame {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_data(message: impl Into<String>) -> Self {
        ModbusError::InvalidData {
            message: message.into(),
        }
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        ModbusError::Configuration {
            message: message.into(),
        }
    }

    /// True if the error is a Modbus exception reported by the remote server
    pub fn is_exception(&self) -> bool {
        matches!(self, ModbusError::Exception(_))
    }

    /// The exception code if the error is a server exception
    pub fn exception_code(&self) -> Option<u8> {
        match self {
            ModbusError::Exception(exc) => Some(exc.to_u8()),
            _ => None,
        }
    }
}

/// Modbus exception codes (the published table)
///
/// Code 0x09 is reserved in the specification and has no variant; a response
/// carrying it is reported as [`ModbusError::InvalidExceptionCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ModbusException {
    /// The function code is not an allowable action for the server
    IllegalFunction = 0x01,
    /// The data address is not an allowable address for the server
    IllegalDataAddress = 0x02,
    /// A value in the query data field is not allowable
    IllegalDataValue = 0x03,
    /// Unrecoverable error while performing the requested action
    ServerDeviceFailure = 0x04,
    /// Request accepted, long-running processing in progress
    Acknowledge = 0x05,
    /// The server is busy with a long-duration command
    ServerDeviceBusy = 0x06,
    /// The server cannot perform the programming function
    NegativeAcknowledge = 0x07,
    /// Parity error detected in extended memory
    MemoryParityError = 0x08,
    /// Gateway could not allocate an internal communication path
    GatewayPathUnavailable = 0x0A,
    /// No response obtained from the gateway target device
    GatewayTargetFailedToRespond = 0x0B,
}

impl ModbusException {
    /// Convert a raw code byte to an exception, if it is in the table
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            0x07 => Some(ModbusException::NegativeAcknowledge),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetFailedToRespond),
            _ => None,
        }
    }

    /// The raw exception code byte
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Fixed description from the specification's message table
    pub fn description(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "Illegal function code",
            ModbusException::IllegalDataAddress => "Illegal data address",
            ModbusException::IllegalDataValue => "Illegal data value",
            ModbusException::ServerDeviceFailure => "Slave device or server failure",
            ModbusException::Acknowledge => "Acknowledge",
            ModbusException::ServerDeviceBusy => "Slave device or server busy",
            ModbusException::NegativeAcknowledge => "Negative acknowledge",
            ModbusException::MemoryParityError => "Memory parity error",
            ModbusException::GatewayPathUnavailable => "Gateway path unavailable",
            ModbusException::GatewayTargetFailedToRespond => "Target device failed to respond",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04X} {}", self.to_u8(), self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_conversion() {
        assert_eq!(
            ModbusException::from_u8(0x02),
            Some(ModbusException::IllegalDataAddress)
        );
        assert_eq!(ModbusException::IllegalDataAddress.to_u8(), 0x02);

        // 0x09 is reserved, anything above 0x0B is undefined
        assert_eq!(ModbusException::from_u8(0x09), None);
        assert_eq!(ModbusException::from_u8(0x0C), None);
        assert_eq!(ModbusException::from_u8(0x00), None);
    }

    #[test]
    fn test_exception_error_accessors() {
        let err = ModbusError::Exception(ModbusException::IllegalDataAddress);
        assert!(err.is_exception());
        assert_eq!(err.exception_code(), Some(0x02));

        let err = ModbusError::Timeout {
            operation: "response",
        };
        assert!(!err.is_exception());
        assert_eq!(err.exception_code(), None);
    }
}
