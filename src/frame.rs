//! Frame layout: framing variants, query/response builders and the size
//! oracle.
//!
//! Modbus TCP and RTU share the same application payload and differ only in
//! the envelope: RTU prefixes the slave address and trails a CRC-16, TCP
//! prefixes the 7-byte MBAP header (transaction id, protocol id, remaining
//! length, unit id) and carries no checksum. [`Framing`] captures the
//! per-variant constants; every offset in the library is derived from them.
//!
//! Builders write into caller-provided buffers and return the number of
//! bytes produced *before* sealing; [`seal`] appends the CRC (RTU) or patches
//! the MBAP length field (TCP) just before the frame goes on the wire.

use serde::{Deserialize, Serialize};

use crate::constants::{
    FC_READ_COILS, FC_READ_DISCRETE_INPUTS, FC_READ_EXCEPTION_STATUS, FC_READ_HOLDING_REGISTERS,
    FC_READ_INPUT_REGISTERS, FC_WRITE_MULTIPLE_COILS, FC_WRITE_MULTIPLE_REGISTERS,
    FC_WRITE_SINGLE_REGISTER,
};
use crate::crc::crc16;
use crate::error::ModbusException;

/// Wire framing variant of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Framing {
    /// Serial framing: slave address prefix, CRC-16 trailer
    Rtu,
    /// MBAP framing: 7-byte header, no checksum
    Tcp,
}

impl Framing {
    /// Bytes preceding the slave/unit address.
    ///
    /// The slave address sits at this offset and the function code one byte
    /// after it, for queries and responses alike.
    pub const fn header_len(self) -> usize {
        match self {
            Framing::Rtu => 0,
            Framing::Tcp => 6,
        }
    }

    /// Trailing checksum bytes (CRC-16 for RTU, none for TCP)
    pub const fn checksum_len(self) -> usize {
        match self {
            Framing::Rtu => 2,
            Framing::Tcp => 0,
        }
    }
}

/// Write the MBAP prefix: transaction id, protocol id 0, length placeholder.
fn put_mbap(t_id: u16, packet: &mut [u8]) {
    packet[0..2].copy_from_slice(&t_id.to_be_bytes());
    packet[2] = 0;
    packet[3] = 0;
    // Length bytes 4 and 5 are patched by seal()
}

/// Build a query carrying a start address and a count (or a single value in
/// the count slot, for the single-write functions).
///
/// Produces 6 bytes for RTU, 12 for TCP.
pub(crate) fn build_query(
    framing: Framing,
    t_id: u16,
    slave: u8,
    function: u8,
    start_addr: u16,
    count: u16,
    packet: &mut [u8],
) -> usize {
    let hl = framing.header_len();
    if framing == Framing::Tcp {
        put_mbap(t_id, packet);
    }

    packet[hl] = slave;
    packet[hl + 1] = function;
    packet[hl + 2..hl + 4].copy_from_slice(&start_addr.to_be_bytes());
    packet[hl + 4..hl + 6].copy_from_slice(&count.to_be_bytes());

    hl + 6
}

/// Build a read-response header: slave/unit, function and the byte count.
///
/// Produces 3 bytes for RTU, 9 for TCP; the payload follows.
pub(crate) fn build_response_header(
    framing: Framing,
    t_id: u16,
    slave: u8,
    function: u8,
    byte_count: u8,
    packet: &mut [u8],
) -> usize {
    let hl = framing.header_len();
    if framing == Framing::Tcp {
        put_mbap(t_id, packet);
    }

    packet[hl] = slave;
    packet[hl + 1] = function;
    packet[hl + 2] = byte_count;

    hl + 3
}

/// Build an exception response: the function code with the high bit set,
/// followed by the exception code.
pub(crate) fn build_exception(
    framing: Framing,
    t_id: u16,
    slave: u8,
    function: u8,
    exception: ModbusException,
    packet: &mut [u8],
) -> usize {
    let hl = framing.header_len();
    if framing == Framing::Tcp {
        put_mbap(t_id, packet);
    }

    packet[hl] = slave;
    packet[hl + 1] = function | 0x80;
    packet[hl + 2] = exception.to_u8();

    hl + 3
}

/// Patch the MBAP length field: remaining bytes after the six header bytes.
pub(crate) fn set_mbap_length(packet: &mut [u8], packet_len: usize) {
    let mbap_length = (packet_len - 6) as u16;
    packet[4..6].copy_from_slice(&mbap_length.to_be_bytes());
}

/// Finish a frame for transmission and return its final length.
///
/// RTU appends the CRC over everything built so far; TCP patches the MBAP
/// length field in place.
pub(crate) fn seal(framing: Framing, packet: &mut [u8], len: usize) -> usize {
    match framing {
        Framing::Rtu => {
            let crc = crc16(&packet[..len]);
            packet[len..len + 2].copy_from_slice(&crc.to_le_bytes());
            len + 2
        }
        Framing::Tcp => {
            set_mbap_length(packet, len);
            len
        }
    }
}

/// Expected total size of the response to a query.
///
/// Pure in `(framing, function, count)`; only the function code and the
/// count field of the query are inspected.
pub(crate) fn expected_response_len(framing: Framing, query: &[u8]) -> usize {
    let hl = framing.header_len();

    let body = match query[hl + 1] {
        FC_READ_COILS | FC_READ_DISCRETE_INPUTS => {
            let count = u16::from_be_bytes([query[hl + 4], query[hl + 5]]) as usize;
            3 + count.div_ceil(8)
        }
        FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS => {
            let count = u16::from_be_bytes([query[hl + 4], query[hl + 5]]) as usize;
            3 + 2 * count
        }
        FC_READ_EXCEPTION_STATUS => 4,
        // Write echoes and the report-slave-id reply
        _ => 6,
    };

    hl + body + framing.checksum_len()
}

/// Bytes that follow the function code in a query, known once the function
/// code has been read.
///
/// Reads and single writes carry address + count/value (4 bytes); multiple
/// writes additionally carry the byte-count field (5 bytes); the remaining
/// functions have an empty body.
pub(crate) fn query_header_extra(function: u8) -> usize {
    match function {
        FC_READ_COILS..=FC_WRITE_SINGLE_REGISTER => 4,
        FC_WRITE_MULTIPLE_COILS | FC_WRITE_MULTIPLE_REGISTERS => 5,
        _ => 0,
    }
}

/// Trailing bytes of a query once the fixed body has been read: the data
/// announced by the byte-count field for multiple writes, plus the checksum.
pub(crate) fn query_data_extra(framing: Framing, msg: &[u8]) -> usize {
    let hl = framing.header_len();
    let function = msg[hl + 1];

    let data = match function {
        FC_WRITE_MULTIPLE_COILS | FC_WRITE_MULTIPLE_REGISTERS => msg[hl + 6] as usize,
        _ => 0,
    };

    data + framing.checksum_len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{FC_READ_HOLDING_REGISTERS, FC_REPORT_SLAVE_ID, FC_WRITE_SINGLE_COIL};

    #[test]
    fn test_framing_constants() {
        assert_eq!(Framing::Rtu.header_len(), 0);
        assert_eq!(Framing::Rtu.checksum_len(), 2);
        assert_eq!(Framing::Tcp.header_len(), 6);
        assert_eq!(Framing::Tcp.checksum_len(), 0);
    }

    #[test]
    fn test_build_rtu_query() {
        let mut packet = [0u8; 16];
        let len = build_query(Framing::Rtu, 0, 0x01, FC_READ_HOLDING_REGISTERS, 0, 2, &mut packet);
        assert_eq!(len, 6);
        assert_eq!(&packet[..len], &[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]);

        let sealed = seal(Framing::Rtu, &mut packet, len);
        assert_eq!(sealed, 8);
        assert_eq!(&packet[6..8], &[0xC4, 0x0B]);
    }

    #[test]
    fn test_build_tcp_query() {
        let mut packet = [0u8; 16];
        let len = build_query(Framing::Tcp, 5, 0x01, 0x01, 0x0000, 0x0008, &mut packet);
        assert_eq!(len, 12);

        let sealed = seal(Framing::Tcp, &mut packet, len);
        assert_eq!(sealed, 12);
        assert_eq!(
            &packet[..12],
            &[0x00, 0x05, 0x00, 0x00, 0x00, 0x06, 0x01, 0x01, 0x00, 0x00, 0x00, 0x08]
        );
    }

    #[test]
    fn test_build_response_headers() {
        let mut packet = [0u8; 16];
        let len = build_response_header(Framing::Rtu, 0, 0x01, 0x03, 0x04, &mut packet);
        assert_eq!(len, 3);
        assert_eq!(&packet[..3], &[0x01, 0x03, 0x04]);

        let len = build_response_header(Framing::Tcp, 5, 0x01, 0x01, 0x01, &mut packet);
        assert_eq!(len, 9);
        packet[len] = 0x8D;
        let sealed = seal(Framing::Tcp, &mut packet, len + 1);
        assert_eq!(
            &packet[..sealed],
            &[0x00, 0x05, 0x00, 0x00, 0x00, 0x04, 0x01, 0x01, 0x01, 0x8D]
        );
    }

    #[test]
    fn test_build_exception_response() {
        let mut packet = [0u8; 16];
        let len = build_exception(
            Framing::Rtu,
            0,
            0x01,
            FC_READ_HOLDING_REGISTERS,
            ModbusException::IllegalDataAddress,
            &mut packet,
        );
        assert_eq!(&packet[..len], &[0x01, 0x83, 0x02]);
    }

    #[test]
    fn test_expected_response_len() {
        let mut query = [0u8; 16];

        // 2 holding registers: slave + function + byte count + 4 data + CRC
        build_query(Framing::Rtu, 0, 1, FC_READ_HOLDING_REGISTERS, 0, 2, &mut query);
        assert_eq!(expected_response_len(Framing::Rtu, &query), 9);

        // 9 coils cross the packing boundary: 2 data bytes
        build_query(Framing::Rtu, 0, 1, FC_READ_COILS, 0, 9, &mut query);
        assert_eq!(expected_response_len(Framing::Rtu, &query), 7);

        // count = 0: empty payload
        build_query(Framing::Rtu, 0, 1, FC_READ_COILS, 0, 0, &mut query);
        assert_eq!(expected_response_len(Framing::Rtu, &query), 5);

        // Write echo
        build_query(Framing::Rtu, 0, 1, FC_WRITE_SINGLE_COIL, 0x10, 0xFF00, &mut query);
        assert_eq!(expected_response_len(Framing::Rtu, &query), 8);

        // Same query under TCP framing: MBAP instead of CRC
        build_query(Framing::Tcp, 1, 1, FC_READ_HOLDING_REGISTERS, 0, 2, &mut query);
        assert_eq!(expected_response_len(Framing::Tcp, &query), 13);
    }

    #[test]
    fn test_query_size_helpers() {
        // Reads and single writes
        for function in [0x01, 0x02, 0x03, 0x04, 0x05, 0x06] {
            assert_eq!(query_header_extra(function), 4);
        }
        // Multiple writes
        assert_eq!(query_header_extra(FC_WRITE_MULTIPLE_COILS), 5);
        assert_eq!(query_header_extra(FC_WRITE_MULTIPLE_REGISTERS), 5);
        // No body
        assert_eq!(query_header_extra(FC_READ_EXCEPTION_STATUS), 0);
        assert_eq!(query_header_extra(FC_REPORT_SLAVE_ID), 0);

        // Data extra picks up the byte-count field of multiple writes
        let msg = [0x01, 0x10, 0x00, 0x00, 0x00, 0x02, 0x04];
        assert_eq!(query_data_extra(Framing::Rtu, &msg), 4 + 2);
        let msg = [0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0x00];
        assert_eq!(query_data_extra(Framing::Rtu, &msg), 2);
    }
}
