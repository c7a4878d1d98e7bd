//! Transport configuration types.
//!
//! A context is configured either for a serial line ([`SerialConfig`]) or a
//! TCP peer ([`TcpConfig`]). The types derive `serde` so applications can
//! load them from their own configuration files.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::constants::DEFAULT_TCP_PORT;

/// Baud rates accepted for the serial line; anything else falls back to 9600.
pub const SUPPORTED_BAUD_RATES: [u32; 11] = [
    110, 300, 600, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200,
];

/// Serial parity mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit, no input parity check
    #[default]
    None,
    /// Even parity, input parity check enabled
    Even,
    /// Odd parity, input parity check enabled
    Odd,
}

/// Number of data bits per serial character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataBits {
    /// 5 data bits
    Five,
    /// 6 data bits
    Six,
    /// 7 data bits
    Seven,
    /// 8 data bits
    #[default]
    Eight,
}

/// Number of stop bits per serial character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StopBits {
    /// 1 stop bit
    #[default]
    One,
    /// 2 stop bits
    Two,
}

/// What a TCP context does when an exchange fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorRecovery {
    /// Close and immediately reconnect once, then surface the error.
    ///
    /// The reconnect may stall for several seconds when the network to the
    /// remote unit is down.
    #[default]
    Reconnect,
    /// Surface the error unchanged; the application decides.
    Nop,
}

/// Serial line configuration for RTU framing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Character device path, e.g. `/dev/ttyUSB0`
    pub device: String,
    /// Requested baud rate; see [`SUPPORTED_BAUD_RATES`]
    pub baud_rate: u32,
    /// Parity mode
    #[serde(default)]
    pub parity: Parity,
    /// Data bits
    #[serde(default)]
    pub data_bits: DataBits,
    /// Stop bits
    #[serde(default)]
    pub stop_bits: StopBits,
}

impl SerialConfig {
    /// 8-N-1 configuration at the given baud rate
    pub fn new(device: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            device: device.into(),
            baud_rate,
            parity: Parity::default(),
            data_bits: DataBits::default(),
            stop_bits: StopBits::default(),
        }
    }

    /// The baud rate actually applied to the line: the configured one if it
    /// is in the supported set, 9600 otherwise (with a warning).
    pub(crate) fn effective_baud(&self) -> u32 {
        if SUPPORTED_BAUD_RATES.contains(&self.baud_rate) {
            self.baud_rate
        } else {
            warn!(
                baud_rate = self.baud_rate,
                device = %self.device,
                "unknown baud rate, falling back to 9600"
            );
            9600
        }
    }
}

/// TCP peer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Remote host for a master, bind address for a listening slave
    pub host: String,
    /// TCP port (502 by default; ports below 1024 need privileges)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Error handling policy for failed exchanges
    #[serde(default)]
    pub error_recovery: ErrorRecovery,
}

fn default_port() -> u16 {
    DEFAULT_TCP_PORT
}

impl TcpConfig {
    /// Configuration for the default Modbus port 502
    pub fn new(host: impl Into<String>) -> Self {
        Self::with_port(host, DEFAULT_TCP_PORT)
    }

    /// Configuration for an explicit port
    pub fn with_port(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            error_recovery: ErrorRecovery::default(),
        }
    }
}

#[cfg(feature = "rtu")]
impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

#[cfg(feature = "rtu")]
impl From<DataBits> for tokio_serial::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => tokio_serial::DataBits::Five,
            DataBits::Six => tokio_serial::DataBits::Six,
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

#[cfg(feature = "rtu")]
impl From<StopBits> for tokio_serial::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_defaults_are_8n1() {
        let config = SerialConfig::new("/dev/ttyUSB0", 19200);
        assert_eq!(config.parity, Parity::None);
        assert_eq!(config.data_bits, DataBits::Eight);
        assert_eq!(config.stop_bits, StopBits::One);
        assert_eq!(config.effective_baud(), 19200);
    }

    #[test]
    fn test_unknown_baud_falls_back_to_9600() {
        let config = SerialConfig::new("/dev/ttyUSB0", 14400);
        assert_eq!(config.effective_baud(), 9600);
    }

    #[test]
    fn test_tcp_defaults() {
        let config = TcpConfig::new("192.168.1.10");
        assert_eq!(config.port, 502);
        assert_eq!(config.error_recovery, ErrorRecovery::Reconnect);
    }
}
