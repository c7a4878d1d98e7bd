//! Server-side dispatch.
//!
//! A server context receives queries with the undefined-size path of the
//! receive engine, dispatches them on the function code against the
//! application's [`ModbusMapping`] and sends the reply. Out-of-range
//! addresses, out-of-bounds counts and unknown function codes are answered
//! with the matching Modbus exception instead of an error on the server
//! side; the master sees them as [`ModbusError::Exception`] values.

use tracing::debug;

use crate::bitpack;
use crate::constants::{
    FC_READ_COILS, FC_READ_DISCRETE_INPUTS, FC_READ_EXCEPTION_STATUS, FC_READ_HOLDING_REGISTERS,
    FC_READ_INPUT_REGISTERS, FC_REPORT_SLAVE_ID, FC_WRITE_MULTIPLE_COILS,
    FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER, MAX_PACKET_SIZE,
    MAX_READ_BITS, MAX_READ_REGISTERS, MAX_WRITE_BITS, MAX_WRITE_REGISTERS, RECV_BUFFER_SIZE,
};
use crate::context::{ModbusContext, RecvError};
use crate::crc;
use crate::error::{ModbusError, ModbusException, ModbusResult};
use crate::frame::{self, Framing};
use crate::mapping::ModbusMapping;

impl ModbusContext {
    /// Wait for one query from the connected master and return its raw
    /// frame, trailer verified.
    pub async fn listen(&mut self) -> ModbusResult<Vec<u8>> {
        let framing = self.framing();
        let mut buf = [0u8; RECV_BUFFER_SIZE];

        match self.receive_frame(None, &mut buf).await {
            Ok(len) => {
                if let Err(e) = crc::check_crc(framing, &buf[..len]) {
                    self.recover_after_error().await;
                    return Err(e);
                }
                Ok(buf[..len].to_vec())
            }
            Err(RecvError::TimedOut { .. }) => Err(ModbusError::Timeout { operation: "query" }),
            Err(RecvError::Failed(e)) => {
                self.recover_after_error().await;
                Err(e)
            }
        }
    }

    /// Dispatch one received query against the mapping and send the reply.
    pub async fn reply(&mut self, query: &[u8], mapping: &mut ModbusMapping) -> ModbusResult<()> {
        let mut response = [0u8; MAX_PACKET_SIZE];
        let len = build_reply(self.framing(), query, mapping, &mut response)?;
        self.send_frame(&mut response, len).await
    }

    /// Receive one query and answer it.
    pub async fn serve_once(&mut self, mapping: &mut ModbusMapping) -> ModbusResult<()> {
        let query = self.listen().await?;
        self.reply(&query, mapping).await
    }
}

/// Analyse a query and construct the reply, reading and writing the mapping
/// as the function code dictates. Returns the unsealed response length.
fn build_reply(
    framing: Framing,
    query: &[u8],
    mapping: &mut ModbusMapping,
    response: &mut [u8; MAX_PACKET_SIZE],
) -> ModbusResult<usize> {
    let hl = framing.header_len();
    let body_len = query.len().saturating_sub(framing.checksum_len());
    if body_len < hl + 2 {
        return Err(ModbusError::frame("query too short to dispatch"));
    }

    let slave = query[hl];
    let function = query[hl + 1];
    // A TCP reply carries the transaction id of its query
    let t_id = match framing {
        Framing::Tcp => u16::from_be_bytes([query[0], query[1]]),
        Framing::Rtu => 0,
    };

    let field = |offset: usize| -> ModbusResult<u16> {
        if hl + offset + 2 > body_len {
            Err(ModbusError::frame("query body truncated"))
        } else {
            Ok(u16::from_be_bytes([
                query[hl + offset],
                query[hl + offset + 1],
            ]))
        }
    };

    match function {
        FC_READ_COILS | FC_READ_DISCRETE_INPUTS => {
            let address = field(2)? as usize;
            let count = field(4)? as usize;
            let table = if function == FC_READ_COILS {
                mapping.coils()
            } else {
                mapping.discrete_inputs()
            };

            if count > MAX_READ_BITS {
                return Ok(exception_reply(
                    framing,
                    t_id,
                    slave,
                    function,
                    ModbusException::IllegalDataValue,
                    response,
                ));
            }
            if address + count > table.len() {
                return Ok(exception_reply(
                    framing,
                    t_id,
                    slave,
                    function,
                    ModbusException::IllegalDataAddress,
                    response,
                ));
            }

            let byte_count = count.div_ceil(8) as u8;
            let mut len =
                frame::build_response_header(framing, t_id, slave, function, byte_count, response);
            for chunk in table[address..address + count].chunks(8) {
                response[len] = bitpack::byte_from_bits(chunk);
                len += 1;
            }
            Ok(len)
        }

        FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS => {
            let address = field(2)? as usize;
            let count = field(4)? as usize;
            let table = if function == FC_READ_HOLDING_REGISTERS {
                mapping.holding_registers()
            } else {
                mapping.input_registers()
            };

            if count > MAX_READ_REGISTERS {
                return Ok(exception_reply(
                    framing,
                    t_id,
                    slave,
                    function,
                    ModbusException::IllegalDataValue,
                    response,
                ));
            }
            if address + count > table.len() {
                return Ok(exception_reply(
                    framing,
                    t_id,
                    slave,
                    function,
                    ModbusException::IllegalDataAddress,
                    response,
                ));
            }

            let byte_count = (2 * count) as u8;
            let mut len =
                frame::build_response_header(framing, t_id, slave, function, byte_count, response);
            for &register in &table[address..address + count] {
                response[len..len + 2].copy_from_slice(&register.to_be_bytes());
                len += 2;
            }
            Ok(len)
        }

        FC_WRITE_SINGLE_COIL => {
            let address = field(2)? as usize;
            let value = field(4)?;

            if address >= mapping.coils().len() {
                return Ok(exception_reply(
                    framing,
                    t_id,
                    slave,
                    function,
                    ModbusException::IllegalDataAddress,
                    response,
                ));
            }
            let state = match value {
                0xFF00 => true,
                0x0000 => false,
                _ => {
                    return Ok(exception_reply(
                        framing,
                        t_id,
                        slave,
                        function,
                        ModbusException::IllegalDataValue,
                        response,
                    ))
                }
            };
            mapping.coils_mut()[address] = state;

            // Echo the query; the trailer is recomputed when the reply is
            // sealed, so the echo is valid under RTU too
            let len = hl + 6;
            response[..len].copy_from_slice(&query[..len]);
            Ok(len)
        }

        FC_WRITE_SINGLE_REGISTER => {
            let address = field(2)? as usize;
            let value = field(4)?;

            if address >= mapping.holding_registers().len() {
                return Ok(exception_reply(
                    framing,
                    t_id,
                    slave,
                    function,
                    ModbusException::IllegalDataAddress,
                    response,
                ));
            }
            mapping.holding_registers_mut()[address] = value;

            let len = hl + 6;
            response[..len].copy_from_slice(&query[..len]);
            Ok(len)
        }

        FC_WRITE_MULTIPLE_COILS => {
            let address = field(2)? as usize;
            let count = field(4)? as usize;
            if body_len < hl + 7 {
                return Err(ModbusError::frame("query body truncated"));
            }
            let byte_count = query[hl + 6] as usize;
            if body_len < hl + 7 + byte_count {
                return Err(ModbusError::frame("coil data truncated"));
            }

            if count > MAX_WRITE_BITS || byte_count != count.div_ceil(8) {
                return Ok(exception_reply(
                    framing,
                    t_id,
                    slave,
                    function,
                    ModbusException::IllegalDataValue,
                    response,
                ));
            }
            if address + count > mapping.coils().len() {
                return Ok(exception_reply(
                    framing,
                    t_id,
                    slave,
                    function,
                    ModbusException::IllegalDataAddress,
                    response,
                ));
            }

            let bits = bitpack::unpack_bits(&query[hl + 7..hl + 7 + byte_count], count);
            mapping.coils_mut()[address..address + count].copy_from_slice(&bits);

            // The reply carries the start address and count only
            Ok(frame::build_query(
                framing,
                t_id,
                slave,
                function,
                address as u16,
                count as u16,
                response,
            ))
        }

        FC_WRITE_MULTIPLE_REGISTERS => {
            let address = field(2)? as usize;
            let count = field(4)? as usize;
            if body_len < hl + 7 {
                return Err(ModbusError::frame("query body truncated"));
            }
            let byte_count = query[hl + 6] as usize;
            if body_len < hl + 7 + byte_count {
                return Err(ModbusError::frame("register data truncated"));
            }

            if count > MAX_WRITE_REGISTERS || byte_count != 2 * count {
                return Ok(exception_reply(
                    framing,
                    t_id,
                    slave,
                    function,
                    ModbusException::IllegalDataValue,
                    response,
                ));
            }
            if address + count > mapping.holding_registers().len() {
                return Ok(exception_reply(
                    framing,
                    t_id,
                    slave,
                    function,
                    ModbusException::IllegalDataAddress,
                    response,
                ));
            }

            for i in 0..count {
                let offset = hl + 7 + 2 * i;
                mapping.holding_registers_mut()[address + i] =
                    u16::from_be_bytes([query[offset], query[offset + 1]]);
            }

            Ok(frame::build_query(
                framing,
                t_id,
                slave,
                function,
                address as u16,
                count as u16,
                response,
            ))
        }

        FC_READ_EXCEPTION_STATUS => {
            let coils = mapping.coils();
            let status = bitpack::byte_from_bits(&coils[..coils.len().min(8)]);
            // The single status byte rides in the byte-count slot
            Ok(frame::build_response_header(
                framing, t_id, slave, function, status, response,
            ))
        }

        FC_REPORT_SLAVE_ID => {
            // Server id, run indicator, one spare diagnostic byte: three
            // data bytes keep the reply at the size masters compute for it
            let mut len = frame::build_response_header(framing, t_id, slave, function, 3, response);
            response[len] = slave;
            response[len + 1] = 0xFF;
            response[len + 2] = 0x00;
            len += 3;
            Ok(len)
        }

        _ => Ok(exception_reply(
            framing,
            t_id,
            slave,
            function,
            ModbusException::IllegalFunction,
            response,
        )),
    }
}

fn exception_reply(
    framing: Framing,
    t_id: u16,
    slave: u8,
    function: u8,
    exception: ModbusException,
    response: &mut [u8; MAX_PACKET_SIZE],
) -> usize {
    debug!(function, %exception, "replying with an exception");
    frame::build_exception(framing, t_id, slave, function, exception, response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::crc16;

    fn rtu_frame(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        frame.extend_from_slice(&crc16(body).to_le_bytes());
        frame
    }

    fn dispatch_rtu(query: &[u8], mapping: &mut ModbusMapping) -> (Vec<u8>, usize) {
        let mut response = [0u8; MAX_PACKET_SIZE];
        let len = build_reply(Framing::Rtu, query, mapping, &mut response).unwrap();
        (response.to_vec(), len)
    }

    #[test]
    fn test_read_holding_registers_reply() {
        let mut mapping = ModbusMapping::new(0, 0, 10, 0);
        mapping.holding_registers_mut()[0] = 0x1234;
        mapping.holding_registers_mut()[1] = 0x5678;

        let query = rtu_frame(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]);
        assert_eq!(&query[6..], &[0xC4, 0x0B]);

        let (response, len) = dispatch_rtu(&query, &mut mapping);
        assert_eq!(&response[..len], &[0x01, 0x03, 0x04, 0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn test_write_single_coil_updates_and_echoes() {
        let mut mapping = ModbusMapping::new(32, 0, 0, 0);

        let query = rtu_frame(&[0x01, 0x05, 0x00, 0x10, 0xFF, 0x00]);
        let (response, len) = dispatch_rtu(&query, &mut mapping);

        assert!(mapping.coils()[0x10]);
        assert_eq!(&response[..len], &query[..6]);

        // Off value clears the coil
        let query = rtu_frame(&[0x01, 0x05, 0x00, 0x10, 0x00, 0x00]);
        dispatch_rtu(&query, &mut mapping);
        assert!(!mapping.coils()[0x10]);
    }

    #[test]
    fn test_write_single_coil_rejects_other_values() {
        let mut mapping = ModbusMapping::new(32, 0, 0, 0);

        let query = rtu_frame(&[0x01, 0x05, 0x00, 0x10, 0x12, 0x34]);
        let (response, len) = dispatch_rtu(&query, &mut mapping);

        assert_eq!(&response[..len], &[0x01, 0x85, 0x03]);
        assert!(!mapping.coils()[0x10]);
    }

    #[test]
    fn test_illegal_data_address_exception() {
        let mut mapping = ModbusMapping::new(0, 0, 10, 0);

        let query = rtu_frame(&[0x01, 0x03, 0xFF, 0x00, 0x00, 0x01]);
        let (response, len) = dispatch_rtu(&query, &mut mapping);

        assert_eq!(&response[..len], &[0x01, 0x83, 0x02]);
    }

    #[test]
    fn test_write_multiple_registers() {
        let mut mapping = ModbusMapping::new(0, 0, 10, 0);

        let query = rtu_frame(&[
            0x01, 0x10, 0x00, 0x00, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02,
        ]);
        let (response, len) = dispatch_rtu(&query, &mut mapping);

        assert_eq!(mapping.holding_registers()[0], 0x000A);
        assert_eq!(mapping.holding_registers()[1], 0x0102);
        assert_eq!(&response[..len], &[0x01, 0x10, 0x00, 0x00, 0x00, 0x02]);
    }

    #[test]
    fn test_tcp_read_coils_echoes_transaction_id() {
        let mut mapping = ModbusMapping::new(8, 0, 0, 0);
        for (i, bit) in [true, false, true, true, false, false, false, true]
            .into_iter()
            .enumerate()
        {
            mapping.coils_mut()[i] = bit;
        }

        let query = [
            0x00, 0x05, 0x00, 0x00, 0x00, 0x06, 0x01, 0x01, 0x00, 0x00, 0x00, 0x08,
        ];
        let mut response = [0u8; MAX_PACKET_SIZE];
        let len = build_reply(Framing::Tcp, &query, &mut mapping, &mut response).unwrap();

        let sealed = crate::frame::seal(Framing::Tcp, &mut response, len);
        assert_eq!(
            &response[..sealed],
            &[0x00, 0x05, 0x00, 0x00, 0x00, 0x04, 0x01, 0x01, 0x01, 0x8D]
        );
    }

    #[test]
    fn test_read_coils_pads_partial_byte_with_zeros() {
        let mut mapping = ModbusMapping::new(16, 0, 0, 0);
        for i in 0..9 {
            mapping.coils_mut()[i] = true;
        }

        let query = rtu_frame(&[0x01, 0x01, 0x00, 0x00, 0x00, 0x09]);
        let (response, len) = dispatch_rtu(&query, &mut mapping);

        assert_eq!(&response[..len], &[0x01, 0x01, 0x02, 0xFF, 0x01]);
    }

    #[test]
    fn test_read_count_zero_yields_empty_payload() {
        let mut mapping = ModbusMapping::new(8, 0, 0, 0);

        let query = rtu_frame(&[0x01, 0x01, 0x00, 0x00, 0x00, 0x00]);
        let (response, len) = dispatch_rtu(&query, &mut mapping);

        assert_eq!(&response[..len], &[0x01, 0x01, 0x00]);
    }

    #[test]
    fn test_write_multiple_coils_byte_count_mismatch() {
        let mut mapping = ModbusMapping::new(16, 0, 0, 0);

        // 9 coils need 2 data bytes, the query announces 1
        let query = rtu_frame(&[0x01, 0x0F, 0x00, 0x00, 0x00, 0x09, 0x01, 0xFF]);
        let (response, len) = dispatch_rtu(&query, &mut mapping);

        assert_eq!(&response[..len], &[0x01, 0x8F, 0x03]);
    }

    #[test]
    fn test_write_multiple_coils_stores_bits() {
        let mut mapping = ModbusMapping::new(16, 0, 0, 0);

        let query = rtu_frame(&[0x01, 0x0F, 0x00, 0x04, 0x00, 0x09, 0x02, 0x8D, 0x01]);
        let (response, len) = dispatch_rtu(&query, &mut mapping);

        assert_eq!(&response[..len], &[0x01, 0x0F, 0x00, 0x04, 0x00, 0x09]);
        let expected = [true, false, true, true, false, false, false, true, true];
        for (i, &bit) in expected.iter().enumerate() {
            assert_eq!(mapping.coils()[4 + i], bit, "coil {}", 4 + i);
        }
    }

    #[test]
    fn test_unknown_function_code() {
        let mut mapping = ModbusMapping::new(8, 8, 8, 8);

        let query = rtu_frame(&[0x01, 0x2B, 0x00, 0x00]);
        let (response, len) = dispatch_rtu(&query, &mut mapping);

        assert_eq!(&response[..len], &[0x01, 0xAB, 0x01]);
    }

    #[test]
    fn test_read_exception_status_packs_first_coils() {
        let mut mapping = ModbusMapping::new(16, 0, 0, 0);
        mapping.coils_mut()[0] = true;
        mapping.coils_mut()[2] = true;
        mapping.coils_mut()[4] = true;

        let query = rtu_frame(&[0x01, 0x07]);
        let (response, len) = dispatch_rtu(&query, &mut mapping);

        assert_eq!(&response[..len], &[0x01, 0x07, 0x15]);
    }

    #[test]
    fn test_report_slave_id_reply() {
        let mut mapping = ModbusMapping::new(0, 0, 0, 0);

        let query = rtu_frame(&[0x11, 0x11]);
        let (response, len) = dispatch_rtu(&query, &mut mapping);

        assert_eq!(&response[..len], &[0x11, 0x11, 0x03, 0x11, 0xFF, 0x00]);
    }

    #[test]
    fn test_truncated_query_is_an_error() {
        let mut mapping = ModbusMapping::new(8, 0, 8, 0);

        // CRC alone, no body
        assert!(build_reply(
            Framing::Rtu,
            &[0x01],
            &mut mapping,
            &mut [0u8; MAX_PACKET_SIZE]
        )
        .is_err());

        // Multi-write announcing more data than it carries
        let query = rtu_frame(&[0x01, 0x10, 0x00, 0x00, 0x00, 0x02, 0x04, 0x00]);
        assert!(build_reply(
            Framing::Rtu,
            &query,
            &mut mapping,
            &mut [0u8; MAX_PACKET_SIZE]
        )
        .is_err());
    }
}
