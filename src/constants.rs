//! Modbus protocol constants based on the official specification
//!
//! The frame size limits are inherited from the RS485 ADU limit of 256 bytes;
//! the per-operation read/write limits are calculated so that every request
//! and response fits in one ADU.

use std::time::Duration;

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Largest ADU the library accepts on any transport
///
/// TCP: MBAP header (7 bytes including the unit id) + maximum PDU (253)
/// = 260 bytes. RTU frames are at most 256 bytes and fit below this bound.
pub const MAX_PACKET_SIZE: usize = 260;

/// Receive buffer size
///
/// Larger than [`MAX_PACKET_SIZE`] so the overflow check can observe a frame
/// crossing the limit instead of truncating it.
pub(crate) const RECV_BUFFER_SIZE: usize = 512;

// ============================================================================
// Register Operation Limits
// ============================================================================

/// Maximum registers per read (FC03/FC04)
///
/// Response PDU: function (1) + byte count (1) + N x 2 <= 253, so N <= 125.
pub const MAX_READ_REGISTERS: usize = 125;

/// Maximum registers per write (FC16)
///
/// Request PDU: function (1) + address (2) + quantity (2) + byte count (1)
/// + N x 2 <= 253, so N <= 123.
pub const MAX_WRITE_REGISTERS: usize = 123;

// ============================================================================
// Coil Operation Limits
// ============================================================================

/// Maximum coils or discrete inputs per read (FC01/FC02)
pub const MAX_READ_BITS: usize = 2000;

/// Maximum coils per write (FC15)
pub const MAX_WRITE_BITS: usize = 1968;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Coils (FC01)
pub const FC_READ_COILS: u8 = 0x01;

/// Read Discrete Inputs (FC02)
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Read Input Registers (FC04)
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

/// Write Single Coil (FC05)
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;

/// Write Single Register (FC06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Read Exception Status (FC07)
pub const FC_READ_EXCEPTION_STATUS: u8 = 0x07;

/// Write Multiple Coils (FC15)
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;

/// Write Multiple Registers (FC16)
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Report Slave ID (FC17)
pub const FC_REPORT_SLAVE_ID: u8 = 0x11;

// ============================================================================
// Defaults
// ============================================================================

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Default wait for the first byte of a response after a query is sent
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Default inter-byte wait inside a frame
pub const DEFAULT_BYTE_TIMEOUT: Duration = Duration::from_millis(50);

/// How long a server waits for the first byte of a query
pub(crate) const SERVER_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_limits() {
        // Read: function + byte count + data must fit in one PDU
        assert!(1 + 1 + MAX_READ_REGISTERS * 2 <= 253);
        assert_eq!(MAX_READ_REGISTERS, 125);

        // Write: function + address + quantity + byte count + data
        assert!(1 + 2 + 2 + 1 + MAX_WRITE_REGISTERS * 2 <= 253);
        assert_eq!(MAX_WRITE_REGISTERS, 123);
    }

    #[test]
    fn test_coil_limits() {
        assert!(1 + 1 + MAX_READ_BITS.div_ceil(8) <= 253);
        assert_eq!(MAX_READ_BITS, 2000);

        assert!(1 + 2 + 2 + 1 + MAX_WRITE_BITS.div_ceil(8) <= 253);
        assert_eq!(MAX_WRITE_BITS, 1968);
    }
}
