//! Master-side operations.
//!
//! Every verb follows the same skeleton: build the query in a stack buffer,
//! seal and send it, then run check-response, which receives with the
//! expected size from the size oracle, verifies the trailer and detects
//! exception responses before the payload is decoded.

use tracing::warn;

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
use crate::frame;

impl ModbusContext {
    /// Read coils (0x01) from a remote server.
    ///
    /// Returns one boolean per coil, `count` at most 2000.
    pub async fn read_coils(
        &mut self,
        slave: u8,
        start_addr: u16,
        count: u16,
    ) -> ModbusResult<Vec<bool>> {
        self.read_bits(slave, FC_READ_COILS, start_addr, count).await
    }

    /// Read discrete inputs (0x02) from a remote server.
    pub async fn read_discrete_inputs(
        &mut self,
        slave: u8,
        start_addr: u16,
        count: u16,
    ) -> ModbusResult<Vec<bool>> {
        self.read_bits(slave, FC_READ_DISCRETE_INPUTS, start_addr, count)
            .await
    }

    /// Read holding registers (0x03), `count` at most 125.
    pub async fn read_holding_registers(
        &mut self,
        slave: u8,
        start_addr: u16,
        count: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.read_registers(slave, FC_READ_HOLDING_REGISTERS, start_addr, count)
            .await
    }

    /// Read input registers (0x04), `count` at most 125.
    pub async fn read_input_registers(
        &mut self,
        slave: u8,
        start_addr: u16,
        count: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.read_registers(slave, FC_READ_INPUT_REGISTERS, start_addr, count)
            .await
    }

    /// Force a single coil (0x05) on or off. The server echoes the query.
    pub async fn write_single_coil(&mut self, slave: u8, addr: u16, on: bool) -> ModbusResult<()> {
        let value = if on { 0xFF00 } else { 0x0000 };
        self.write_single(slave, FC_WRITE_SINGLE_COIL, addr, value)
            .await
    }

    /// Preset a single holding register (0x06). The server echoes the query.
    pub async fn write_single_register(
        &mut self,
        slave: u8,
        addr: u16,
        value: u16,
    ) -> ModbusResult<()> {
        self.write_single(slave, FC_WRITE_SINGLE_REGISTER, addr, value)
            .await
    }

    /// Force multiple coils (0x0F), at most 1968 per query.
    pub async fn write_multiple_coils(
        &mut self,
        slave: u8,
        start_addr: u16,
        values: &[bool],
    ) -> ModbusResult<()> {
        if values.is_empty() || values.len() > MAX_WRITE_BITS {
            return Err(ModbusError::invalid_data(format!(
                "cannot write {} coils in one query (1..={MAX_WRITE_BITS})",
                values.len()
            )));
        }

        let mut query = [0u8; MAX_PACKET_SIZE];
        let t_id = self.next_transaction_id();
        let mut len = frame::build_query(
            self.framing(),
            t_id,
            slave,
            FC_WRITE_MULTIPLE_COILS,
            start_addr,
            values.len() as u16,
            &mut query,
        );

        let packed = bitpack::pack_bits(values);
        query[len] = packed.len() as u8;
        len += 1;
        query[len..len + packed.len()].copy_from_slice(&packed);
        len += packed.len();

        self.send_frame(&mut query, len).await?;

        let mut response = [0u8; RECV_BUFFER_SIZE];
        self.check_response(&query, &mut response).await?;
        Ok(())
    }

    /// Preset multiple holding registers (0x10), at most 123 per query.
    pub async fn write_multiple_registers(
        &mut self,
        slave: u8,
        start_addr: u16,
        values: &[u16],
    ) -> ModbusResult<()> {
        if values.is_empty() || values.len() > MAX_WRITE_REGISTERS {
            return Err(ModbusError::invalid_data(format!(
                "cannot write {} registers in one query (1..={MAX_WRITE_REGISTERS})",
                values.len()
            )));
        }

        let mut query = [0u8; MAX_PACKET_SIZE];
        let t_id = self.next_transaction_id();
        let mut len = frame::build_query(
            self.framing(),
            t_id,
            slave,
            FC_WRITE_MULTIPLE_REGISTERS,
            start_addr,
            values.len() as u16,
            &mut query,
        );

        query[len] = (values.len() * 2) as u8;
        len += 1;
        for &value in values {
            query[len..len + 2].copy_from_slice(&value.to_be_bytes());
            len += 2;
        }

        self.send_frame(&mut query, len).await?;

        let mut response = [0u8; RECV_BUFFER_SIZE];
        self.check_response(&query, &mut response).await?;
        Ok(())
    }

    /// Read the exception status byte (0x07) of a remote server.
    pub async fn read_exception_status(&mut self, slave: u8) -> ModbusResult<u8> {
        let mut query = [0u8; MAX_PACKET_SIZE];
        let t_id = self.next_transaction_id();
        let len = self.build_bodyless_query(t_id, slave, FC_READ_EXCEPTION_STATUS, &mut query);
        self.send_frame(&mut query, len).await?;

        let mut response = [0u8; RECV_BUFFER_SIZE];
        self.check_response(&query, &mut response).await?;

        Ok(response[self.framing().header_len() + 2])
    }

    /// Report slave id (0x11). The reply payload (byte count, server id, run
    /// indicator and any additional data) is returned as raw bytes.
    pub async fn report_slave_id(&mut self, slave: u8) -> ModbusResult<Vec<u8>> {
        let mut query = [0u8; MAX_PACKET_SIZE];
        let t_id = self.next_transaction_id();
        let len = self.build_bodyless_query(t_id, slave, FC_REPORT_SLAVE_ID, &mut query);
        self.send_frame(&mut query, len).await?;

        let mut response = [0u8; RECV_BUFFER_SIZE];
        let frame_len = self.check_response(&query, &mut response).await?;

        let framing = self.framing();
        let payload = framing.header_len() + 2..frame_len - framing.checksum_len();
        Ok(response[payload].to_vec())
    }

    /// Query of slave and function only: the address/count body is dropped.
    fn build_bodyless_query(&self, t_id: u16, slave: u8, function: u8, query: &mut [u8]) -> usize {
        frame::build_query(self.framing(), t_id, slave, function, 0, 0, query) - 4
    }

    async fn read_bits(
        &mut self,
        slave: u8,
        function: u8,
        start_addr: u16,
        count: u16,
    ) -> ModbusResult<Vec<bool>> {
        if count as usize > MAX_READ_BITS {
            return Err(ModbusError::invalid_data(format!(
                "cannot read {count} bits in one query (limit {MAX_READ_BITS})"
            )));
        }

        let mut query = [0u8; MAX_PACKET_SIZE];
        let t_id = self.next_transaction_id();
        let len = frame::build_query(
            self.framing(),
            t_id,
            slave,
            function,
            start_addr,
            count,
            &mut query,
        );
        self.send_frame(&mut query, len).await?;

        let mut response = [0u8; RECV_BUFFER_SIZE];
        let frame_len = self.check_response(&query, &mut response).await?;

        let framing = self.framing();
        let hl = framing.header_len();
        let byte_count = response[hl + 2] as usize;
        if hl + 3 + byte_count + framing.checksum_len() > frame_len {
            return Err(ModbusError::frame("byte count exceeds the received frame"));
        }

        Ok(bitpack::unpack_bits(
            &response[hl + 3..hl + 3 + byte_count],
            count as usize,
        ))
    }

    async fn read_registers(
        &mut self,
        slave: u8,
        function: u8,
        start_addr: u16,
        count: u16,
    ) -> ModbusResult<Vec<u16>> {
        if count as usize > MAX_READ_REGISTERS {
            return Err(ModbusError::invalid_data(format!(
                "cannot read {count} registers in one query (limit {MAX_READ_REGISTERS})"
            )));
        }

        let mut query = [0u8; MAX_PACKET_SIZE];
        let t_id = self.next_transaction_id();
        let len = frame::build_query(
            self.framing(),
            t_id,
            slave,
            function,
            start_addr,
            count,
            &mut query,
        );
        self.send_frame(&mut query, len).await?;

        let mut response = [0u8; RECV_BUFFER_SIZE];
        let frame_len = self.check_response(&query, &mut response).await?;

        let framing = self.framing();
        let hl = framing.header_len();
        let byte_count = response[hl + 2] as usize;
        if hl + 3 + byte_count + framing.checksum_len() > frame_len {
            return Err(ModbusError::frame("byte count exceeds the received frame"));
        }

        let words = byte_count / 2;
        let mut values = Vec::with_capacity(words);
        for i in 0..words {
            let offset = hl + 3 + 2 * i;
            values.push(u16::from_be_bytes([response[offset], response[offset + 1]]));
        }
        Ok(values)
    }

    async fn write_single(
        &mut self,
        slave: u8,
        function: u8,
        addr: u16,
        value: u16,
    ) -> ModbusResult<()> {
        let mut query = [0u8; MAX_PACKET_SIZE];
        let t_id = self.next_transaction_id();
        let len = frame::build_query(self.framing(), t_id, slave, function, addr, value, &mut query);
        self.send_frame(&mut query, len).await?;

        // The reply echoes the query; nothing to decode
        let mut response = [0u8; RECV_BUFFER_SIZE];
        self.check_response(&query, &mut response).await?;
        Ok(())
    }

    /// Receive and validate the response to `query`.
    ///
    /// On success returns the frame length. The exception response is the
    /// smallest frame in the protocol, so it usually shows up as a short
    /// read (a timeout with exactly its size in hand); a zero-count read
    /// computes that same size, so frames of the exception size are
    /// classified on the success path as well.
    async fn check_response(
        &mut self,
        query: &[u8],
        response: &mut [u8; RECV_BUFFER_SIZE],
    ) -> ModbusResult<usize> {
        let framing = self.framing();
        let hl = framing.header_len();
        let exception_len = hl + 3 + framing.checksum_len();
        let expected = frame::expected_response_len(framing, query);

        match self.receive_frame(Some(expected), response).await {
            Ok(len) => {
                if let Err(e) = crc::check_crc(framing, &response[..len]) {
                    self.recover_after_error().await;
                    return Err(e);
                }
                if len == exception_len {
                    if let Some(err) = self.detect_exception(query, response).await {
                        return Err(err);
                    }
                }
                Ok(len)
            }
            Err(RecvError::TimedOut { received }) if received == exception_len => {
                let len = received;
                if let Err(e) = crc::check_crc(framing, &response[..len]) {
                    self.recover_after_error().await;
                    return Err(e);
                }

                if let Some(err) = self.detect_exception(query, response).await {
                    Err(err)
                } else if response[hl + 1] == query[hl + 1] {
                    // A complete frame one byte under the computed size
                    // (the read-exception-status reply); accept it.
                    Ok(len)
                } else {
                    self.recover_after_error().await;
                    Err(ModbusError::Timeout {
                        operation: "response",
                    })
                }
            }
            Err(RecvError::TimedOut { .. }) => {
                self.recover_after_error().await;
                Err(ModbusError::Timeout {
                    operation: "response",
                })
            }
            Err(RecvError::Failed(e)) => {
                self.recover_after_error().await;
                Err(e)
            }
        }
    }

    /// Classify a CRC-valid frame of exactly the exception-response size:
    /// the error to surface when it answers `query` with the high bit set on
    /// the function code, `None` when it is anything else.
    async fn detect_exception(
        &mut self,
        query: &[u8],
        response: &[u8; RECV_BUFFER_SIZE],
    ) -> Option<ModbusError> {
        let hl = self.framing().header_len();
        if response[hl + 1] != (0x80 | query[hl + 1]) {
            return None;
        }

        let code = response[hl + 2];
        self.recover_after_error().await;
        match ModbusException::from_u8(code) {
            Some(exception) => {
                warn!(%exception, "server replied with an exception");
                Some(ModbusError::Exception(exception))
            }
            None => Some(ModbusError::InvalidExceptionCode { code }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::crc16;
    use crate::frame::Framing;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn rtu_frame(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        frame.extend_from_slice(&crc16(body).to_le_bytes());
        frame
    }

    fn memory_master() -> (ModbusContext, tokio::io::DuplexStream) {
        let (mut context, far) = ModbusContext::from_memory(Framing::Rtu);
        context.set_timeouts(Duration::from_millis(50), Duration::from_millis(20));
        (context, far)
    }

    #[tokio::test]
    async fn test_read_holding_registers_round_trip() {
        let (mut context, mut far) = memory_master();

        far.write_all(&rtu_frame(&[0x01, 0x03, 0x04, 0x12, 0x34, 0x56, 0x78]))
            .await
            .unwrap();

        let values = context.read_holding_registers(0x01, 0, 2).await.unwrap();
        assert_eq!(values, vec![0x1234, 0x5678]);

        // The wire carried the canonical query frame
        let mut sent = [0u8; 8];
        far.read_exact(&mut sent).await.unwrap();
        assert_eq!(&sent, &[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);
    }

    #[tokio::test]
    async fn test_read_coils_decodes_lsb_first() {
        let (mut context, mut far) = memory_master();

        far.write_all(&rtu_frame(&[0x01, 0x01, 0x01, 0x8D])).await.unwrap();

        let bits = context.read_coils(0x01, 0, 8).await.unwrap();
        assert_eq!(
            bits,
            vec![true, false, true, true, false, false, false, true]
        );
    }

    #[tokio::test]
    async fn test_exception_response_is_detected() {
        let (mut context, mut far) = memory_master();

        far.write_all(&rtu_frame(&[0x01, 0x83, 0x02])).await.unwrap();

        let err = context.read_holding_registers(0x01, 0xFF00, 1).await.unwrap_err();
        match err {
            ModbusError::Exception(exception) => {
                assert_eq!(exception, ModbusException::IllegalDataAddress)
            }
            other => panic!("expected an exception, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exception_on_zero_count_read() {
        // A zero-count read expects a frame of exactly the exception size,
        // so the exception arrives without a timeout
        let (mut context, mut far) = memory_master();

        far.write_all(&rtu_frame(&[0x01, 0x83, 0x02])).await.unwrap();

        let err = context
            .read_holding_registers(0x01, 0xFF00, 0)
            .await
            .unwrap_err();
        match err {
            ModbusError::Exception(exception) => {
                assert_eq!(exception, ModbusException::IllegalDataAddress)
            }
            other => panic!("expected an exception, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_exception_code_is_rejected() {
        let (mut context, mut far) = memory_master();

        // 0x0C is outside the published table, 0x09 is reserved
        far.write_all(&rtu_frame(&[0x01, 0x83, 0x0C])).await.unwrap();
        let err = context.read_holding_registers(0x01, 0, 1).await.unwrap_err();
        assert!(matches!(
            err,
            ModbusError::InvalidExceptionCode { code: 0x0C }
        ));
    }

    #[tokio::test]
    async fn test_corrupted_crc_is_rejected() {
        let (mut context, mut far) = memory_master();

        let mut response = rtu_frame(&[0x01, 0x03, 0x04, 0x12, 0x34, 0x56, 0x78]);
        let last = response.len() - 1;
        response[last] ^= 0xFF;
        far.write_all(&response).await.unwrap();

        let err = context.read_holding_registers(0x01, 0, 2).await.unwrap_err();
        assert!(matches!(err, ModbusError::InvalidCrc { .. }));
    }

    #[tokio::test]
    async fn test_silence_times_out() {
        let (mut context, _far) = memory_master();

        let err = context.read_holding_registers(0x01, 0, 2).await.unwrap_err();
        assert!(matches!(err, ModbusError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_count_limits_are_enforced_locally() {
        let (mut context, _far) = memory_master();

        assert!(matches!(
            context.read_holding_registers(1, 0, 126).await,
            Err(ModbusError::InvalidData { .. })
        ));
        assert!(matches!(
            context.read_coils(1, 0, 2001).await,
            Err(ModbusError::InvalidData { .. })
        ));
        assert!(matches!(
            context.write_multiple_coils(1, 0, &[false; 1969]).await,
            Err(ModbusError::InvalidData { .. })
        ));
        assert!(matches!(
            context.write_multiple_registers(1, 0, &[0; 124]).await,
            Err(ModbusError::InvalidData { .. })
        ));
    }

    #[tokio::test]
    async fn test_write_single_coil_sends_ff00() {
        let (mut context, mut far) = memory_master();

        let echo = rtu_frame(&[0x01, 0x05, 0x00, 0x10, 0xFF, 0x00]);
        far.write_all(&echo).await.unwrap();

        context.write_single_coil(0x01, 0x10, true).await.unwrap();

        let mut sent = [0u8; 8];
        far.read_exact(&mut sent).await.unwrap();
        assert_eq!(sent.to_vec(), echo);
    }

    #[tokio::test]
    async fn test_read_exception_status_accepts_short_reply() {
        let (mut context, mut far) = memory_master();

        far.write_all(&rtu_frame(&[0x01, 0x07, 0x15])).await.unwrap();

        let status = context.read_exception_status(0x01).await.unwrap();
        assert_eq!(status, 0x15);
    }
}
