//! Modbus master (client) implementation
//!
//! [`ModbusMaster`] owns one framed transport and issues synchronous
//! request/response exchanges over it. The correlator at its core sends the
//! request, then loops inside the caller's timeout window: frames that fail
//! parsing purge the input and the wait continues; well-formed frames that
//! answer a different device or function are discarded as strays (shared
//! RS-485 buses carry other masters' traffic); the first frame matching the
//! outstanding `(address, function)` pair ends the wait. A matched response
//! with the exception flag set decodes into [`ModbusError::Exception`].
//!
//! The master is not pipelined: one request is in flight at a time, which
//! `&mut self` receivers enforce at compile time.
//!
//! # API Naming Convention
//!
//! The API is dual-track, one primary method per function code plus a
//! semantic alias:
//!
//! | Function Code | Primary Name | Semantic Alias |
//! |---------------|--------------|----------------|
//! | 0x01 | `read_01()` | `read_coils()` |
//! | 0x02 | `read_02()` | `read_discrete_inputs()` |
//! | 0x03 | `read_03()` | `read_holding_registers()` |
//! | 0x04 | `read_04()` | `read_input_registers()` |
//! | 0x05 | `write_05()` | `write_single_coil()` |
//! | 0x06 | `write_06()` | `write_single_register()` |
//! | 0x0F | `write_0f()` | `write_multiple_coils()` |
//! | 0x10 | `write_10()` | `write_multiple_registers()` |
//! | 0x17 | `read_write_17()` | `read_write_multiple_registers()` |
//!
//! The serial-line diagnostics functions (0x07, 0x08, 0x0B, 0x0C) and
//! device identification (0x2B/0x0E) go by their semantic names only.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::codec::{bytes_to_registers, get_u16_be, unpack_bits};
use crate::constants::{
    BROADCAST_ADDRESS, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_READ_WRITE_REGISTERS,
    MAX_WRITE_COILS, MAX_WRITE_REGISTERS, MEI_READ_DEVICE_ID,
};
use crate::error::{ModbusError, ModbusResult};
use crate::identity::{DeviceIdentification, ReadDeviceIdCode, MORE_FOLLOWS};
use crate::logging::CallbackLogger;
use crate::pdu::{ModbusPdu, PduBuilder};
use crate::transport::{FrameTransport, TransportStats};

/// Decoded response of Get Comm Event Log (FC12).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommEventLog {
    pub status: u16,
    pub event_count: u16,
    pub message_count: u16,
    /// Most recent event bytes, newest first as the device sends them.
    pub events: Vec<u8>,
}

/// Modbus master bound to one framed transport.
pub struct ModbusMaster<T: FrameTransport> {
    transport: T,
    buffer: Vec<u8>,
    logger: Option<CallbackLogger>,
}

impl<T: FrameTransport> ModbusMaster<T> {
    /// Create a master over `transport`.
    pub fn new(transport: T) -> Self {
        let buffer = vec![0u8; transport.max_adu_len() as usize];
        Self {
            transport,
            buffer,
            logger: None,
        }
    }

    /// Create a master with traffic logging.
    pub fn with_logger(transport: T, logger: CallbackLogger) -> Self {
        let mut master = Self::new(transport);
        master.logger = Some(logger);
        master
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable access to the underlying transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Whether the transport is usable.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Close the transport.
    pub async fn close(&mut self) -> ModbusResult<()> {
        self.transport.close().await
    }

    /// Transport statistics.
    pub fn get_stats(&self) -> TransportStats {
        self.transport.get_stats()
    }

    /// One synchronous exchange: send the request PDU, collect the matching
    /// response PDU data within `timeout`.
    async fn transact(
        &mut self,
        address: u8,
        pdu: &ModbusPdu,
        desired_resp_data_len: Option<u16>,
        timeout: Duration,
    ) -> ModbusResult<Vec<u8>> {
        let function = pdu
            .function_code()
            .ok_or_else(|| ModbusError::invalid_data("empty request PDU"))?;
        let request_data = pdu.payload();

        if let Some(ref logger) = self.logger {
            logger.log_request(address, function, request_data);
        }

        let mut ctx = self.transport.context();
        let slot = self.transport.build(
            &mut self.buffer,
            address,
            function,
            request_data.len(),
            false,
            &mut ctx,
        )?;
        self.buffer[slot.data_pos..slot.data_pos + request_data.len()]
            .copy_from_slice(request_data);

        self.transport.prepare_write().await?;
        let send_result = self.transport.send(&mut self.buffer, slot.frame_len).await;
        self.transport.prepare_read().await?;
        send_result?;

        // Broadcast requests never get a response.
        if address == BROADCAST_ADDRESS {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(ModbusError::timeout(
                    "response wait",
                    timeout.as_millis() as u64,
                ));
            }
            let remaining = deadline - now;

            let frame_len = self
                .transport
                .receive(&mut self.buffer, desired_resp_data_len, remaining)
                .await?;

            let frame =
                match self
                    .transport
                    .parse(&mut self.buffer, frame_len, true, &mut ctx)
                {
                    Ok(frame) => frame,
                    Err(e) if e.is_wire_error() => {
                        // Corrupted or foreign frame: resynchronize and keep
                        // waiting for the real response.
                        debug!("discarding unparseable frame: {e}");
                        self.transport.clear_input().await?;
                        continue;
                    }
                    Err(e) => return Err(e),
                };

            if frame.address != address || frame.function & 0x7F != function {
                trace!(
                    "stray frame from addr {} fc 0x{:02X}, still waiting",
                    frame.address,
                    frame.function
                );
                continue;
            }

            let data = frame.data(&self.buffer).to_vec();
            if let Some(ref logger) = self.logger {
                logger.log_response(frame.address, frame.function, &data);
            }

            if frame.is_exception() {
                let code = *data
                    .first()
                    .ok_or(ModbusError::ResponseTooShort { length: frame_len })?;
                return Err(ModbusError::exception(frame.function, code));
            }
            return Ok(data);
        }
    }

    // ===== Bit operations =====

    /// Read coils (function code 0x01).
    pub async fn read_01(
        &mut self,
        address: u8,
        start: u16,
        quantity: u16,
        timeout: Duration,
    ) -> ModbusResult<Vec<bool>> {
        if quantity == 0 || quantity > MAX_READ_COILS {
            return Err(ModbusError::invalid_data("invalid coil quantity"));
        }
        let pdu = PduBuilder::build_read_request(0x01, start, quantity)?;
        let expected_payload = (quantity as usize).div_ceil(8);
        let data = self
            .transact(address, &pdu, Some(1 + expected_payload as u16), timeout)
            .await?;
        decode_bit_response(&data, quantity)
    }

    /// Read discrete inputs (function code 0x02).
    pub async fn read_02(
        &mut self,
        address: u8,
        start: u16,
        quantity: u16,
        timeout: Duration,
    ) -> ModbusResult<Vec<bool>> {
        if quantity == 0 || quantity > MAX_READ_COILS {
            return Err(ModbusError::invalid_data("invalid input quantity"));
        }
        let pdu = PduBuilder::build_read_request(0x02, start, quantity)?;
        let expected_payload = (quantity as usize).div_ceil(8);
        let data = self
            .transact(address, &pdu, Some(1 + expected_payload as u16), timeout)
            .await?;
        decode_bit_response(&data, quantity)
    }

    // ===== Register operations =====

    /// Read holding registers (function code 0x03).
    pub async fn read_03(
        &mut self,
        address: u8,
        start: u16,
        quantity: u16,
        timeout: Duration,
    ) -> ModbusResult<Vec<u16>> {
        if quantity == 0 || quantity > MAX_READ_REGISTERS {
            return Err(ModbusError::invalid_data("invalid register quantity"));
        }
        let pdu = PduBuilder::build_read_request(0x03, start, quantity)?;
        let data = self
            .transact(address, &pdu, Some(1 + quantity * 2), timeout)
            .await?;
        decode_register_response(&data, quantity)
    }

    /// Read input registers (function code 0x04).
    pub async fn read_04(
        &mut self,
        address: u8,
        start: u16,
        quantity: u16,
        timeout: Duration,
    ) -> ModbusResult<Vec<u16>> {
        if quantity == 0 || quantity > MAX_READ_REGISTERS {
            return Err(ModbusError::invalid_data("invalid register quantity"));
        }
        let pdu = PduBuilder::build_read_request(0x04, start, quantity)?;
        let data = self
            .transact(address, &pdu, Some(1 + quantity * 2), timeout)
            .await?;
        decode_register_response(&data, quantity)
    }

    // ===== Write operations =====

    /// Write single coil (function code 0x05).
    pub async fn write_05(
        &mut self,
        address: u8,
        coil_address: u16,
        value: bool,
        timeout: Duration,
    ) -> ModbusResult<()> {
        let pdu = PduBuilder::build_write_single_coil(coil_address, value)?;
        let data = self.transact(address, &pdu, Some(4), timeout).await?;
        if address != BROADCAST_ADDRESS {
            check_write_echo(&data, coil_address)?;
        }
        Ok(())
    }

    /// Write single register (function code 0x06).
    pub async fn write_06(
        &mut self,
        address: u8,
        register_address: u16,
        value: u16,
        timeout: Duration,
    ) -> ModbusResult<()> {
        let pdu = PduBuilder::build_write_single_register(register_address, value)?;
        let data = self.transact(address, &pdu, Some(4), timeout).await?;
        if address != BROADCAST_ADDRESS {
            check_write_echo(&data, register_address)?;
        }
        Ok(())
    }

    /// Write multiple coils (function code 0x0F).
    pub async fn write_0f(
        &mut self,
        address: u8,
        start: u16,
        values: &[bool],
        timeout: Duration,
    ) -> ModbusResult<()> {
        if values.is_empty() || values.len() > MAX_WRITE_COILS as usize {
            return Err(ModbusError::invalid_data("invalid coil quantity"));
        }
        let pdu = PduBuilder::build_write_multiple_coils(start, values)?;
        let data = self.transact(address, &pdu, Some(4), timeout).await?;
        if address != BROADCAST_ADDRESS {
            check_write_echo(&data, start)?;
        }
        Ok(())
    }

    /// Write multiple registers (function code 0x10).
    pub async fn write_10(
        &mut self,
        address: u8,
        start: u16,
        values: &[u16],
        timeout: Duration,
    ) -> ModbusResult<()> {
        if values.is_empty() || values.len() > MAX_WRITE_REGISTERS as usize {
            return Err(ModbusError::invalid_data("invalid register quantity"));
        }
        let pdu = PduBuilder::build_write_multiple_registers(start, values)?;
        let data = self.transact(address, &pdu, Some(4), timeout).await?;
        if address != BROADCAST_ADDRESS {
            check_write_echo(&data, start)?;
        }
        Ok(())
    }

    /// Read/write multiple registers (function code 0x17). The write is
    /// performed before the read on the device.
    pub async fn read_write_17(
        &mut self,
        address: u8,
        read_start: u16,
        read_quantity: u16,
        write_start: u16,
        write_values: &[u16],
        timeout: Duration,
    ) -> ModbusResult<Vec<u16>> {
        if read_quantity == 0 || read_quantity > MAX_READ_WRITE_REGISTERS {
            return Err(ModbusError::invalid_data("invalid read quantity"));
        }
        if write_values.is_empty() || write_values.len() > MAX_READ_WRITE_REGISTERS as usize {
            return Err(ModbusError::invalid_data("invalid write quantity"));
        }
        let pdu = PduBuilder::build_read_write_multiple_registers(
            read_start,
            read_quantity,
            write_start,
            write_values,
        )?;
        let data = self
            .transact(address, &pdu, Some(1 + read_quantity * 2), timeout)
            .await?;
        decode_register_response(&data, read_quantity)
    }

    // ===== Serial line diagnostics =====

    /// Read exception status (function code 0x07). Returns the device's
    /// eight exception status outputs as one byte.
    pub async fn read_exception_status(
        &mut self,
        address: u8,
        timeout: Duration,
    ) -> ModbusResult<u8> {
        let pdu = PduBuilder::build_read_exception_status()?;
        let data = self.transact(address, &pdu, Some(1), timeout).await?;
        data.first()
            .copied()
            .ok_or(ModbusError::ResponseTooShort { length: data.len() })
    }

    /// Diagnostics (function code 0x08). The device echoes the sub-function
    /// and data word; the echoed data word is returned.
    pub async fn diagnostics(
        &mut self,
        address: u8,
        sub_function: u16,
        data_word: u16,
        timeout: Duration,
    ) -> ModbusResult<u16> {
        let pdu = PduBuilder::build_diagnostics(sub_function, data_word)?;
        let data = self.transact(address, &pdu, Some(4), timeout).await?;
        if data.len() < 4 {
            return Err(ModbusError::ResponseTooShort { length: data.len() });
        }
        let echoed_sub = get_u16_be(&data, 0);
        if echoed_sub != sub_function {
            return Err(ModbusError::protocol(format!(
                "diagnostics sub-function mismatch: sent 0x{sub_function:04X}, got 0x{echoed_sub:04X}"
            )));
        }
        Ok(get_u16_be(&data, 2))
    }

    /// Get comm event counter (function code 0x0B). Returns
    /// `(status, event_count)`.
    pub async fn get_comm_event_counter(
        &mut self,
        address: u8,
        timeout: Duration,
    ) -> ModbusResult<(u16, u16)> {
        let pdu = PduBuilder::build_comm_event_counter()?;
        let data = self.transact(address, &pdu, Some(4), timeout).await?;
        if data.len() < 4 {
            return Err(ModbusError::ResponseTooShort { length: data.len() });
        }
        Ok((get_u16_be(&data, 0), get_u16_be(&data, 2)))
    }

    /// Get comm event log (function code 0x0C).
    pub async fn get_comm_event_log(
        &mut self,
        address: u8,
        timeout: Duration,
    ) -> ModbusResult<CommEventLog> {
        let pdu = PduBuilder::build_comm_event_log()?;
        // Variable-length response: let the framer find the boundary.
        let data = self.transact(address, &pdu, None, timeout).await?;
        if data.len() < 7 {
            return Err(ModbusError::ResponseTooShort { length: data.len() });
        }
        let byte_count = data[0] as usize;
        if byte_count < 6 || data.len() < 1 + byte_count {
            return Err(ModbusError::protocol("comm event log length mismatch"));
        }
        Ok(CommEventLog {
            status: get_u16_be(&data, 1),
            event_count: get_u16_be(&data, 3),
            message_count: get_u16_be(&data, 5),
            events: data[7..1 + byte_count].to_vec(),
        })
    }

    // ===== Device identification =====

    /// Read device identification (function code 0x2B / MEI 0x0E),
    /// transparently following `more_follows` continuations and
    /// concatenating the object stream.
    pub async fn read_device_identification(
        &mut self,
        address: u8,
        code: ReadDeviceIdCode,
        object_id: u8,
        timeout: Duration,
    ) -> ModbusResult<DeviceIdentification> {
        let mut objects = BTreeMap::new();
        let mut conformity_level = 0u8;
        let mut next_object = object_id;

        // The object id space bounds the page count.
        for _ in 0..=u8::MAX as usize {
            let pdu = PduBuilder::build_read_device_identification(code.to_u8(), next_object)?;
            let data = self.transact(address, &pdu, None, timeout).await?;

            if data.len() < 6 {
                return Err(ModbusError::ResponseTooShort { length: data.len() });
            }
            if data[0] != MEI_READ_DEVICE_ID {
                return Err(ModbusError::protocol(format!(
                    "unexpected MEI type 0x{:02X}",
                    data[0]
                )));
            }
            conformity_level = data[2];
            let more_follows = data[3];
            let next_object_id = data[4];
            let object_count = data[5] as usize;

            let mut pos = 6;
            for _ in 0..object_count {
                if pos + 2 > data.len() {
                    return Err(ModbusError::protocol("truncated identification object"));
                }
                let id = data[pos];
                let len = data[pos + 1] as usize;
                pos += 2;
                if pos + len > data.len() {
                    return Err(ModbusError::protocol("truncated identification object"));
                }
                objects.insert(id, data[pos..pos + len].to_vec());
                pos += len;
            }

            if more_follows != MORE_FOLLOWS {
                break;
            }
            next_object = next_object_id;
        }

        Ok(DeviceIdentification {
            conformity_level,
            objects,
        })
    }

    // ===== Semantic name aliases (for readability) =====

    /// Alias for `read_01` - Read coils
    #[inline]
    pub async fn read_coils(
        &mut self,
        address: u8,
        start: u16,
        quantity: u16,
        timeout: Duration,
    ) -> ModbusResult<Vec<bool>> {
        self.read_01(address, start, quantity, timeout).await
    }

    /// Alias for `read_02` - Read discrete inputs
    #[inline]
    pub async fn read_discrete_inputs(
        &mut self,
        address: u8,
        start: u16,
        quantity: u16,
        timeout: Duration,
    ) -> ModbusResult<Vec<bool>> {
        self.read_02(address, start, quantity, timeout).await
    }

    /// Alias for `read_03` - Read holding registers
    #[inline]
    pub async fn read_holding_registers(
        &mut self,
        address: u8,
        start: u16,
        quantity: u16,
        timeout: Duration,
    ) -> ModbusResult<Vec<u16>> {
        self.read_03(address, start, quantity, timeout).await
    }

    /// Alias for `read_04` - Read input registers
    #[inline]
    pub async fn read_input_registers(
        &mut self,
        address: u8,
        start: u16,
        quantity: u16,
        timeout: Duration,
    ) -> ModbusResult<Vec<u16>> {
        self.read_04(address, start, quantity, timeout).await
    }

    /// Alias for `write_05` - Write single coil
    #[inline]
    pub async fn write_single_coil(
        &mut self,
        address: u8,
        coil_address: u16,
        value: bool,
        timeout: Duration,
    ) -> ModbusResult<()> {
        self.write_05(address, coil_address, value, timeout).await
    }

    /// Alias for `write_06` - Write single register
    #[inline]
    pub async fn write_single_register(
        &mut self,
        address: u8,
        register_address: u16,
        value: u16,
        timeout: Duration,
    ) -> ModbusResult<()> {
        self.write_06(address, register_address, value, timeout).await
    }

    /// Alias for `write_0f` - Write multiple coils
    #[inline]
    pub async fn write_multiple_coils(
        &mut self,
        address: u8,
        start: u16,
        values: &[bool],
        timeout: Duration,
    ) -> ModbusResult<()> {
        self.write_0f(address, start, values, timeout).await
    }

    /// Alias for `write_10` - Write multiple registers
    #[inline]
    pub async fn write_multiple_registers(
        &mut self,
        address: u8,
        start: u16,
        values: &[u16],
        timeout: Duration,
    ) -> ModbusResult<()> {
        self.write_10(address, start, values, timeout).await
    }

    /// Alias for `read_write_17` - Read/write multiple registers
    #[inline]
    #[allow(clippy::too_many_arguments)]
    pub async fn read_write_multiple_registers(
        &mut self,
        address: u8,
        read_start: u16,
        read_quantity: u16,
        write_start: u16,
        write_values: &[u16],
        timeout: Duration,
    ) -> ModbusResult<Vec<u16>> {
        self.read_write_17(
            address,
            read_start,
            read_quantity,
            write_start,
            write_values,
            timeout,
        )
        .await
    }
}

/// Decode a `byte_count | packed_bits` response into `quantity` booleans.
fn decode_bit_response(data: &[u8], quantity: u16) -> ModbusResult<Vec<bool>> {
    if data.is_empty() {
        // Broadcast reads complete without a payload.
        return Ok(Vec::new());
    }
    let byte_count = data[0] as usize;
    let expected = (quantity as usize).div_ceil(8);
    if byte_count < expected || data.len() < 1 + byte_count {
        return Err(ModbusError::protocol("bit response length mismatch"));
    }
    Ok(unpack_bits(&data[1..1 + byte_count], quantity as usize))
}

/// Decode a `byte_count | registers` response into `quantity` registers.
fn decode_register_response(data: &[u8], quantity: u16) -> ModbusResult<Vec<u16>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let byte_count = data[0] as usize;
    if byte_count != quantity as usize * 2 || data.len() < 1 + byte_count {
        return Err(ModbusError::protocol("register response length mismatch"));
    }
    bytes_to_registers(&data[1..1 + byte_count])
}

/// Verify the echoed address of a write response.
fn check_write_echo(data: &[u8], expected_address: u16) -> ModbusResult<()> {
    if data.len() < 4 {
        return Err(ModbusError::ResponseTooShort { length: data.len() });
    }
    let echoed = get_u16_be(data, 0);
    if echoed != expected_address {
        return Err(ModbusError::protocol(format!(
            "write echo address mismatch: sent {expected_address}, got {echoed}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{FrameContext, FrameSlot, ParsedFrame};
    use std::collections::VecDeque;

    /// Sentinel inbound frame that fails parsing, standing in for a frame
    /// with a bad checksum.
    const CORRUPT: &[u8] = &[0xFF];

    /// In-memory transport with a trivial `addr | fc | data` framing.
    struct MockTransport {
        inbound: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
        cleared: usize,
        stats: TransportStats,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                inbound: VecDeque::new(),
                sent: Vec::new(),
                cleared: 0,
                stats: TransportStats::default(),
            }
        }

        fn push_response(&mut self, frame: &[u8]) {
            self.inbound.push_back(frame.to_vec());
        }
    }

    #[async_trait::async_trait]
    impl FrameTransport for MockTransport {
        fn max_adu_len(&self) -> u16 {
            256
        }

        fn max_pdu_data_len(&self) -> u16 {
            252
        }

        fn data_available(&mut self) -> bool {
            !self.inbound.is_empty()
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn receive(
            &mut self,
            buf: &mut [u8],
            _desired_data_len: Option<u16>,
            timeout: Duration,
        ) -> ModbusResult<usize> {
            match self.inbound.pop_front() {
                Some(frame) => {
                    buf[..frame.len()].copy_from_slice(&frame);
                    Ok(frame.len())
                }
                None => Err(ModbusError::timeout(
                    "mock receive",
                    timeout.as_millis() as u64,
                )),
            }
        }

        fn parse(
            &mut self,
            buf: &mut [u8],
            frame_len: usize,
            _is_response: bool,
            _ctx: &mut FrameContext,
        ) -> ModbusResult<ParsedFrame> {
            if frame_len < 2 {
                return Err(ModbusError::frame("mock frame corrupted"));
            }
            Ok(ParsedFrame {
                address: buf[0],
                function: buf[1],
                data_pos: 2,
                data_len: frame_len - 2,
            })
        }

        fn build(
            &mut self,
            buf: &mut [u8],
            address: u8,
            function: u8,
            data_len: usize,
            _is_response: bool,
            _ctx: &mut FrameContext,
        ) -> ModbusResult<FrameSlot> {
            buf[0] = address;
            buf[1] = function;
            Ok(FrameSlot {
                frame_len: 2 + data_len,
                data_pos: 2,
            })
        }

        async fn send(&mut self, buf: &mut [u8], frame_len: usize) -> ModbusResult<()> {
            self.sent.push(buf[..frame_len].to_vec());
            Ok(())
        }

        async fn clear_input(&mut self) -> ModbusResult<()> {
            self.cleared += 1;
            Ok(())
        }

        fn get_stats(&self) -> TransportStats {
            self.stats.clone()
        }
    }

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn test_read_03_round_trip() {
        let mut mock = MockTransport::new();
        // addr=1 fc=3 byte_count=4 regs 0x1234 0x5678
        mock.push_response(&[0x01, 0x03, 0x04, 0x12, 0x34, 0x56, 0x78]);

        let mut master = ModbusMaster::new(mock);
        let values = master.read_03(1, 0, 2, TIMEOUT).await.unwrap();
        assert_eq!(values, vec![0x1234, 0x5678]);

        // Request on the wire: addr fc start quantity
        assert_eq!(
            master.transport().sent,
            vec![vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02]]
        );
    }

    #[tokio::test]
    async fn test_read_01_unpacks_bits() {
        let mut mock = MockTransport::new();
        mock.push_response(&[0x01, 0x01, 0x02, 0b0000_1101, 0b0000_0001]);

        let mut master = ModbusMaster::new(mock);
        let coils = master.read_01(1, 0, 9, TIMEOUT).await.unwrap();
        assert_eq!(
            coils,
            vec![true, false, true, true, false, false, false, false, true]
        );
    }

    #[tokio::test]
    async fn test_exception_response_decodes() {
        let mut mock = MockTransport::new();
        mock.push_response(&[0x01, 0x83, 0x02]);

        let mut master = ModbusMaster::new(mock);
        let err = master.read_03(1, 0, 1, TIMEOUT).await.unwrap_err();
        match err {
            ModbusError::Exception { function, code } => {
                assert_eq!(function, 0x03);
                assert_eq!(code, crate::ExceptionCode::IllegalDataAddress);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stray_frames_are_discarded() {
        let mut mock = MockTransport::new();
        // Stray: right function, wrong device.
        mock.push_response(&[0x07, 0x03, 0x02, 0xDE, 0xAD]);
        // Stray: right device, wrong function.
        mock.push_response(&[0x05, 0x04, 0x02, 0xBE, 0xEF]);
        // The real response.
        mock.push_response(&[0x05, 0x03, 0x02, 0x12, 0x34]);

        let mut master = ModbusMaster::new(mock);
        let values = master.read_03(5, 0, 1, TIMEOUT).await.unwrap();
        assert_eq!(values, vec![0x1234]);
        assert!(master.transport().inbound.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_frame_purges_input_and_retries() {
        let mut mock = MockTransport::new();
        mock.push_response(CORRUPT);
        mock.push_response(&[0x01, 0x03, 0x02, 0x00, 0x2A]);

        let mut master = ModbusMaster::new(mock);
        let values = master.read_03(1, 0, 1, TIMEOUT).await.unwrap();
        assert_eq!(values, vec![0x002A]);
        assert_eq!(master.transport().cleared, 1);
    }

    #[tokio::test]
    async fn test_timeout_without_response() {
        let mock = MockTransport::new();
        let mut master = ModbusMaster::new(mock);
        let err = master.read_03(1, 0, 1, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ModbusError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_broadcast_write_expects_no_response() {
        let mock = MockTransport::new();
        let mut master = ModbusMaster::new(mock);

        // No inbound frame prepared; broadcast still succeeds.
        master.write_05(0, 10, true, TIMEOUT).await.unwrap();
        assert_eq!(
            master.transport().sent,
            vec![vec![0x00, 0x05, 0x00, 0x0A, 0xFF, 0x00]]
        );
    }

    #[tokio::test]
    async fn test_quantity_validation_precedes_io() {
        let mock = MockTransport::new();
        let mut master = ModbusMaster::new(mock);

        assert!(master.read_03(1, 0, 0, TIMEOUT).await.is_err());
        assert!(master.read_03(1, 0, 126, TIMEOUT).await.is_err());
        assert!(master.read_01(1, 0, 2001, TIMEOUT).await.is_err());
        assert!(master.write_10(1, 0, &[], TIMEOUT).await.is_err());
        assert!(
            master
                .read_write_17(1, 0, 122, 0, &[1], TIMEOUT)
                .await
                .is_err()
        );
        // Nothing touched the wire.
        assert!(master.transport().sent.is_empty());
    }

    #[tokio::test]
    async fn test_write_10_checks_echo() {
        let mut mock = MockTransport::new();
        mock.push_response(&[0x01, 0x10, 0x00, 0x05, 0x00, 0x02]);
        let mut master = ModbusMaster::new(mock);
        master
            .write_10(1, 5, &[0x1234, 0x5678], TIMEOUT)
            .await
            .unwrap();

        // Echo naming a different start address is a protocol error.
        let mut mock = MockTransport::new();
        mock.push_response(&[0x01, 0x10, 0x00, 0x09, 0x00, 0x02]);
        let mut master = ModbusMaster::new(mock);
        assert!(master.write_10(1, 5, &[0x1234, 0x5678], TIMEOUT).await.is_err());
    }

    #[tokio::test]
    async fn test_read_exception_status() {
        let mut mock = MockTransport::new();
        mock.push_response(&[0x01, 0x07, 0x6D]);
        let mut master = ModbusMaster::new(mock);
        assert_eq!(master.read_exception_status(1, TIMEOUT).await.unwrap(), 0x6D);
    }

    #[tokio::test]
    async fn test_diagnostics_echo() {
        let mut mock = MockTransport::new();
        mock.push_response(&[0x01, 0x08, 0x00, 0x00, 0xA5, 0x37]);
        let mut master = ModbusMaster::new(mock);
        assert_eq!(
            master.diagnostics(1, 0x0000, 0xA537, TIMEOUT).await.unwrap(),
            0xA537
        );

        // Mismatched sub-function in the echo.
        let mut mock = MockTransport::new();
        mock.push_response(&[0x01, 0x08, 0x00, 0x01, 0xA5, 0x37]);
        let mut master = ModbusMaster::new(mock);
        assert!(master.diagnostics(1, 0x0000, 0xA537, TIMEOUT).await.is_err());
    }

    #[tokio::test]
    async fn test_comm_event_counter_and_log() {
        let mut mock = MockTransport::new();
        mock.push_response(&[0x01, 0x0B, 0xFF, 0xFF, 0x01, 0x08]);
        let mut master = ModbusMaster::new(mock);
        assert_eq!(
            master.get_comm_event_counter(1, TIMEOUT).await.unwrap(),
            (0xFFFF, 0x0108)
        );

        let mut mock = MockTransport::new();
        // byte_count=8: status 0000, event_count 0108, message_count 0121,
        // events 20 00
        mock.push_response(&[
            0x01, 0x0C, 0x08, 0x00, 0x00, 0x01, 0x08, 0x01, 0x21, 0x20, 0x00,
        ]);
        let mut master = ModbusMaster::new(mock);
        let log = master.get_comm_event_log(1, TIMEOUT).await.unwrap();
        assert_eq!(
            log,
            CommEventLog {
                status: 0x0000,
                event_count: 0x0108,
                message_count: 0x0121,
                events: vec![0x20, 0x00],
            }
        );
    }

    #[tokio::test]
    async fn test_device_identification_paging() {
        let mut mock = MockTransport::new();
        // Page 1: more_follows, continue at object 0x02.
        mock.push_response(&[
            0x01, 0x2B, 0x0E, 0x01, 0x81, 0xFF, 0x02, 0x02, // metadata
            0x00, 0x04, b'A', b'C', b'M', b'E', // vendor
            0x01, 0x06, b'A', b'X', b'-', b'1', b'0', b'0', // product
        ]);
        // Page 2: final.
        mock.push_response(&[
            0x01, 0x2B, 0x0E, 0x01, 0x81, 0x00, 0x00, 0x01, // metadata
            0x02, 0x04, b'1', b'.', b'0', b'2', // revision
        ]);

        let mut master = ModbusMaster::new(mock);
        let ident = master
            .read_device_identification(1, ReadDeviceIdCode::Basic, 0, TIMEOUT)
            .await
            .unwrap();

        assert_eq!(ident.conformity_level, 0x81);
        assert_eq!(ident.vendor_name(), Some("ACME"));
        assert_eq!(ident.product_code(), Some("AX-100"));
        assert_eq!(ident.revision(), Some("1.02"));
        // Two request frames, the second resuming at object 2.
        let sent = &master.transport().sent;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], vec![0x01, 0x2B, 0x0E, 0x01, 0x00]);
        assert_eq!(sent[1], vec![0x01, 0x2B, 0x0E, 0x01, 0x02]);
    }

    #[tokio::test]
    async fn test_logger_sees_traffic() {
        use crate::logging::{CallbackLogger, LogLevel};
        use std::sync::{Arc, Mutex};

        let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let logger = CallbackLogger::with_callback(Arc::new(move |_: LogLevel, msg: &str| {
            sink.lock().unwrap().push(msg.to_string());
        }));

        let mut mock = MockTransport::new();
        mock.push_response(&[0x01, 0x03, 0x02, 0x00, 0x2A]);
        let mut master = ModbusMaster::with_logger(mock, logger);
        master.read_03(1, 0, 1, TIMEOUT).await.unwrap();

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("request"));
        assert!(lines[1].starts_with("response"));
    }
}
