//! Modbus server dispatcher
//!
//! A [`ModbusServer`] owns an ordered set of framed transports and drives
//! them from a single polling worker: sweep the transports highest index
//! first (so removal mid-sweep stays safe), pull one frame from each
//! transport that has data, route by device address, decode the function
//! code into typed arguments, invoke the [`DeviceHandler`], and emit the
//! response or exception frame. Malformed frames are dropped and the
//! transport's input purged so the line resynchronizes at the next frame
//! boundary; a handler can never take the loop down.
//!
//! Address routing: broadcast (0) executes the request but never answers;
//! unicast frames are answered only when the address matches; a server
//! constructed with [`ANY_DEVICE_ADDRESS`] (248, the Modbus/TCP convention)
//! answers every unit id. Exception responses are never sent for broadcast
//! or foreign addresses.
//!
//! Handlers follow the specification's subclass-override model as a trait:
//! every function-code method defaults to `IllegalFunction`, implementations
//! override what the device supports, and unknown function codes fall
//! through to [`DeviceHandler::custom_request`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{bytes_to_registers, get_u16_be, pack_bits, registers_to_bytes, unpack_bits};
use crate::constants::{
    ANY_DEVICE_ADDRESS, BROADCAST_ADDRESS, COIL_OFF, COIL_ON, EXCEPTION_FLAG,
    FC_ENCAPSULATED_INTERFACE, FC_READ_COILS, FC_READ_DISCRETE_INPUTS, FC_READ_HOLDING_REGISTERS,
    FC_READ_INPUT_REGISTERS, FC_READ_WRITE_MULTIPLE_REGISTERS, FC_WRITE_MULTIPLE_COILS,
    FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER,
    MAX_READ_COILS, MAX_READ_REGISTERS, MAX_READ_WRITE_REGISTERS, MAX_UNICAST_ADDRESS,
    MAX_WRITE_COILS, MAX_WRITE_REGISTERS, MEI_READ_DEVICE_ID, SERVER_POLL_INTERVAL_MS,
    SERVER_RECEIVE_TIMEOUT_MS,
};
use crate::error::{ExceptionCode, ModbusError, ModbusResult};
use crate::identity::{DeviceIdentity, ReadDeviceIdCode, MORE_FOLLOWS, NO_MORE_FOLLOWS};
use crate::transport::FrameTransport;

/// Metadata bytes of a device-identification response ahead of the object
/// triples: MEI type, read code, conformity level, more-follows, next object
/// id, object count.
const DEVICE_ID_METADATA_LEN: usize = 6;

/// User-supplied request handlers.
///
/// Every method defaults to refusing with
/// [`ExceptionCode::IllegalFunction`]; a device implements the subset it
/// supports. Read handlers fill the output slice the dispatcher sized from
/// the validated request; write handlers receive decoded typed values.
/// Errors returned here become exception responses on the wire (broadcast
/// excepted), so a failing handler reports
/// [`ExceptionCode::ServerDeviceFailure`] rather than panicking.
#[allow(unused_variables)]
pub trait DeviceHandler: Send + 'static {
    /// FC 0x01: fill `coils` with the states starting at `start`.
    fn read_coils(&mut self, start: u16, coils: &mut [bool]) -> Result<(), ExceptionCode> {
        Err(ExceptionCode::IllegalFunction)
    }

    /// FC 0x02: fill `inputs` with the states starting at `start`.
    fn read_discrete_inputs(
        &mut self,
        start: u16,
        inputs: &mut [bool],
    ) -> Result<(), ExceptionCode> {
        Err(ExceptionCode::IllegalFunction)
    }

    /// FC 0x03: fill `registers` starting at `start`.
    fn read_holding_registers(
        &mut self,
        start: u16,
        registers: &mut [u16],
    ) -> Result<(), ExceptionCode> {
        Err(ExceptionCode::IllegalFunction)
    }

    /// FC 0x04: fill `registers` starting at `start`.
    fn read_input_registers(
        &mut self,
        start: u16,
        registers: &mut [u16],
    ) -> Result<(), ExceptionCode> {
        Err(ExceptionCode::IllegalFunction)
    }

    /// FC 0x05: set one coil.
    fn write_single_coil(&mut self, address: u16, value: bool) -> Result<(), ExceptionCode> {
        Err(ExceptionCode::IllegalFunction)
    }

    /// FC 0x06: set one holding register.
    fn write_single_register(&mut self, address: u16, value: u16) -> Result<(), ExceptionCode> {
        Err(ExceptionCode::IllegalFunction)
    }

    /// FC 0x0F: set a run of coils.
    fn write_multiple_coils(&mut self, start: u16, values: &[bool]) -> Result<(), ExceptionCode> {
        Err(ExceptionCode::IllegalFunction)
    }

    /// FC 0x10: set a run of holding registers.
    fn write_multiple_registers(
        &mut self,
        start: u16,
        values: &[u16],
    ) -> Result<(), ExceptionCode> {
        Err(ExceptionCode::IllegalFunction)
    }

    /// FC 0x17: write `values` at `write_start`, then fill `registers` from
    /// `read_start`. The default composes the two plain handlers, write
    /// first as the specification orders.
    fn read_write_multiple_registers(
        &mut self,
        read_start: u16,
        registers: &mut [u16],
        write_start: u16,
        values: &[u16],
    ) -> Result<(), ExceptionCode> {
        self.write_multiple_registers(write_start, values)?;
        self.read_holding_registers(read_start, registers)
    }

    /// FC 0x2B/0x0E: the identification objects this device exposes, or
    /// `None` to refuse the function.
    fn device_identity(&self) -> Option<&DeviceIdentity> {
        None
    }

    /// Fallback for function codes without a dedicated handler. Return
    /// `Ok(Some(response_data))` to answer, `Ok(None)` to refuse with
    /// `IllegalFunction`.
    fn custom_request(
        &mut self,
        function: u8,
        data: &[u8],
    ) -> Result<Option<Vec<u8>>, ExceptionCode> {
        Ok(None)
    }

    /// Observability hook invoked for every parsed frame, before address
    /// filtering. Must not alter behavior.
    fn on_message_received(&mut self, address: u8, function: u8) {}
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    /// Frames that parsed cleanly.
    pub frames_received: u64,
    /// Frames dropped for framing or checksum errors.
    pub dropped_frames: u64,
    /// Requests routed to the handler (broadcast included).
    pub requests_dispatched: u64,
    /// Normal responses sent.
    pub responses_sent: u64,
    /// Exception responses sent.
    pub exceptions_sent: u64,
}

/// Token identifying a registered transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportId(u64);

struct RegisteredTransport {
    id: u64,
    transport: Box<dyn FrameTransport>,
}

struct ServerShared {
    transports: Vec<RegisteredTransport>,
    /// Receive/transmit scratch, sized to the largest registered ADU.
    buffer: Vec<u8>,
    next_transport_id: u64,
    stats: ServerStats,
}

/// Multi-transport Modbus server.
///
/// ```rust,no_run
/// use ferrite_modbus::{DeviceHandler, ExceptionCode, ModbusServer, TcpFrameTransport};
///
/// struct Plc {
///     holding: [u16; 16],
/// }
///
/// impl DeviceHandler for Plc {
///     fn read_holding_registers(
///         &mut self,
///         start: u16,
///         registers: &mut [u16],
///     ) -> Result<(), ExceptionCode> {
///         let start = start as usize;
///         let end = start + registers.len();
///         let slice = self.holding.get(start..end).ok_or(ExceptionCode::IllegalDataAddress)?;
///         registers.copy_from_slice(slice);
///         Ok(())
///     }
/// }
///
/// # async fn example() -> ferrite_modbus::ModbusResult<()> {
/// let mut server = ModbusServer::new(1, Plc { holding: [0; 16] })?;
/// server.start()?;
/// let listener = tokio::net::TcpListener::bind("127.0.0.1:502").await?;
/// loop {
///     let (stream, _) = listener.accept().await?;
///     server
///         .add_transport(Box::new(TcpFrameTransport::from_stream(stream)))
///         .await?;
/// }
/// # }
/// ```
pub struct ModbusServer<H: DeviceHandler> {
    address: u8,
    shared: Arc<Mutex<ServerShared>>,
    handler: Arc<Mutex<H>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl<H: DeviceHandler> ModbusServer<H> {
    /// Create a server answering as `address`.
    ///
    /// `address` is a unicast device address (1..=247) or
    /// [`ANY_DEVICE_ADDRESS`] to accept every unit id (TCP convention).
    pub fn new(address: u8, handler: H) -> ModbusResult<Self> {
        if address == BROADCAST_ADDRESS
            || (address > MAX_UNICAST_ADDRESS && address != ANY_DEVICE_ADDRESS)
        {
            return Err(ModbusError::configuration(format!(
                "device address {address} outside 1..={MAX_UNICAST_ADDRESS} (or {ANY_DEVICE_ADDRESS})"
            )));
        }
        Ok(Self {
            address,
            shared: Arc::new(Mutex::new(ServerShared {
                transports: Vec::new(),
                buffer: Vec::new(),
                next_transport_id: 0,
                stats: ServerStats::default(),
            })),
            handler: Arc::new(Mutex::new(handler)),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    /// The device address this server answers as.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Shared access to the handler, for mutating device state while the
    /// server runs.
    pub fn handler(&self) -> Arc<Mutex<H>> {
        self.handler.clone()
    }

    /// Register a transport. The transport is switched to idle read and
    /// polled from the next sweep on.
    pub async fn add_transport(
        &self,
        mut transport: Box<dyn FrameTransport>,
    ) -> ModbusResult<TransportId> {
        transport.prepare_read().await?;
        let mut shared = self.shared.lock().await;
        let needed = transport.max_adu_len() as usize;
        if shared.buffer.len() < needed {
            shared.buffer.resize(needed, 0);
        }
        shared.next_transport_id += 1;
        let id = shared.next_transport_id;
        shared.transports.push(RegisteredTransport { id, transport });
        debug!("transport {id} registered ({} total)", shared.transports.len());
        Ok(TransportId(id))
    }

    /// Deregister and close a transport.
    pub async fn remove_transport(&self, id: TransportId) -> ModbusResult<()> {
        let mut shared = self.shared.lock().await;
        let pos = shared
            .transports
            .iter()
            .position(|entry| entry.id == id.0)
            .ok_or_else(|| ModbusError::invalid_data("unknown transport id"))?;
        let mut entry = shared.transports.remove(pos);
        entry.transport.close().await?;
        debug!("transport {} removed", id.0);
        Ok(())
    }

    /// Number of registered transports.
    pub async fn transport_count(&self) -> usize {
        self.shared.lock().await.transports.len()
    }

    /// Snapshot of the server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.shared.lock().await.stats.clone()
    }

    /// Start the polling worker.
    pub fn start(&mut self) -> ModbusResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ModbusError::protocol("server is already running"));
        }
        info!("Modbus server starting, device address {}", self.address);

        let address = self.address;
        let shared = self.shared.clone();
        let handler = self.handler.clone();
        let running = self.running.clone();
        self.worker = Some(tokio::spawn(async move {
            Self::poll_loop(address, shared, handler, running).await;
        }));
        Ok(())
    }

    /// Stop the polling worker. The in-flight receive, if any, completes or
    /// times out before this returns.
    pub async fn stop(&mut self) -> ModbusResult<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
        info!("Modbus server stopped");
        Ok(())
    }

    /// Whether the polling worker is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn poll_loop(
        address: u8,
        shared: Arc<Mutex<ServerShared>>,
        handler: Arc<Mutex<H>>,
        running: Arc<AtomicBool>,
    ) {
        while running.load(Ordering::SeqCst) {
            {
                let mut guard = shared.lock().await;
                let shared = &mut *guard;
                // Highest index first: removal cannot shift unvisited
                // entries.
                let mut idx = shared.transports.len();
                while idx > 0 {
                    idx -= 1;
                    let entry = &mut shared.transports[idx];
                    if entry.transport.data_available() {
                        Self::service_transport(
                            address,
                            &handler,
                            entry.transport.as_mut(),
                            &mut shared.buffer,
                            &mut shared.stats,
                        )
                        .await;
                    }
                    if !shared.transports[idx].transport.is_connected() {
                        let mut dead = shared.transports.remove(idx);
                        let _ = dead.transport.close().await;
                        debug!("transport {} disconnected, removed", dead.id);
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(SERVER_POLL_INTERVAL_MS)).await;
        }
    }

    async fn service_transport(
        our_address: u8,
        handler: &Arc<Mutex<H>>,
        transport: &mut dyn FrameTransport,
        buffer: &mut [u8],
        stats: &mut ServerStats,
    ) {
        let len = match transport
            .receive(
                buffer,
                None,
                Duration::from_millis(SERVER_RECEIVE_TIMEOUT_MS),
            )
            .await
        {
            Ok(len) => len,
            Err(e) => {
                debug!("receive failed: {e}");
                return;
            }
        };

        let mut ctx = transport.context();
        let frame = match transport.parse(buffer, len, false, &mut ctx) {
            Ok(frame) => frame,
            Err(e) => {
                stats.dropped_frames += 1;
                debug!("dropping unparseable frame: {e}");
                let _ = transport.clear_input().await;
                return;
            }
        };
        stats.frames_received += 1;

        if let Err(e) = transport.prepare_write().await {
            warn!("prepare_write failed: {e}");
            return;
        }

        let mut handler_guard = handler.lock().await;
        handler_guard.on_message_received(frame.address, frame.function);

        let is_broadcast = frame.address == BROADCAST_ADDRESS;
        let for_us =
            is_broadcast || our_address == ANY_DEVICE_ADDRESS || frame.address == our_address;

        if for_us {
            let data = frame.data(buffer).to_vec();
            let max_pdu_data = transport.max_pdu_data_len() as usize;
            let result =
                dispatch_request(&mut *handler_guard, frame.function, &data, max_pdu_data);
            drop(handler_guard);
            stats.requests_dispatched += 1;

            // Broadcast requests execute their side effects silently.
            if !is_broadcast {
                let (function, response_data) = match result {
                    Ok(data) => (frame.function, data),
                    Err(code) => {
                        stats.exceptions_sent += 1;
                        (frame.function | EXCEPTION_FLAG, vec![code.to_u8()])
                    }
                };
                match transport.build(
                    buffer,
                    frame.address,
                    function,
                    response_data.len(),
                    true,
                    &mut ctx,
                ) {
                    Ok(slot) => {
                        buffer[slot.data_pos..slot.data_pos + response_data.len()]
                            .copy_from_slice(&response_data);
                        match transport.send(buffer, slot.frame_len).await {
                            Ok(()) => stats.responses_sent += 1,
                            Err(e) => warn!("response send failed: {e}"),
                        }
                    }
                    Err(e) => warn!("response build failed: {e}"),
                }
            }
        }

        let _ = transport.prepare_read().await;
    }
}

/// Decode and execute one request PDU; the returned bytes are the response
/// PDU data (function code excluded).
fn dispatch_request<H: DeviceHandler>(
    handler: &mut H,
    function: u8,
    data: &[u8],
    max_pdu_data: usize,
) -> Result<Vec<u8>, ExceptionCode> {
    match function {
        FC_READ_COILS | FC_READ_DISCRETE_INPUTS => {
            if data.len() < 4 {
                return Err(ExceptionCode::IllegalDataValue);
            }
            let start = get_u16_be(data, 0);
            let count = get_u16_be(data, 2);
            if count == 0 || count > MAX_READ_COILS {
                return Err(ExceptionCode::IllegalDataValue);
            }
            if start as u32 + count as u32 > 0x1_0000 {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            let mut bits = vec![false; count as usize];
            if function == FC_READ_COILS {
                handler.read_coils(start, &mut bits)?;
            } else {
                handler.read_discrete_inputs(start, &mut bits)?;
            }
            let packed = pack_bits(&bits);
            let mut out = Vec::with_capacity(1 + packed.len());
            out.push(packed.len() as u8);
            out.extend_from_slice(&packed);
            Ok(out)
        }

        FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS => {
            if data.len() < 4 {
                return Err(ExceptionCode::IllegalDataValue);
            }
            let start = get_u16_be(data, 0);
            let count = get_u16_be(data, 2);
            if count == 0 || count > MAX_READ_REGISTERS {
                return Err(ExceptionCode::IllegalDataValue);
            }
            if start as u32 + count as u32 > 0x1_0000 {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            let mut registers = vec![0u16; count as usize];
            if function == FC_READ_HOLDING_REGISTERS {
                handler.read_holding_registers(start, &mut registers)?;
            } else {
                handler.read_input_registers(start, &mut registers)?;
            }
            let mut out = Vec::with_capacity(1 + registers.len() * 2);
            out.push((registers.len() * 2) as u8);
            out.extend_from_slice(&registers_to_bytes(&registers));
            Ok(out)
        }

        FC_WRITE_SINGLE_COIL => {
            if data.len() < 4 {
                return Err(ExceptionCode::IllegalDataValue);
            }
            let address = get_u16_be(data, 0);
            let value = match get_u16_be(data, 2) {
                COIL_ON => true,
                COIL_OFF => false,
                _ => return Err(ExceptionCode::IllegalDataValue),
            };
            handler.write_single_coil(address, value)?;
            Ok(data[..4].to_vec())
        }

        FC_WRITE_SINGLE_REGISTER => {
            if data.len() < 4 {
                return Err(ExceptionCode::IllegalDataValue);
            }
            let address = get_u16_be(data, 0);
            let value = get_u16_be(data, 2);
            handler.write_single_register(address, value)?;
            Ok(data[..4].to_vec())
        }

        FC_WRITE_MULTIPLE_COILS => {
            if data.len() < 5 {
                return Err(ExceptionCode::IllegalDataValue);
            }
            let start = get_u16_be(data, 0);
            let count = get_u16_be(data, 2);
            let byte_count = data[4] as usize;
            if count == 0
                || count > MAX_WRITE_COILS
                || byte_count != (count as usize).div_ceil(8)
                || data.len() < 5 + byte_count
            {
                return Err(ExceptionCode::IllegalDataValue);
            }
            if start as u32 + count as u32 > 0x1_0000 {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            let values = unpack_bits(&data[5..5 + byte_count], count as usize);
            handler.write_multiple_coils(start, &values)?;
            Ok(data[..4].to_vec())
        }

        FC_WRITE_MULTIPLE_REGISTERS => {
            if data.len() < 5 {
                return Err(ExceptionCode::IllegalDataValue);
            }
            let start = get_u16_be(data, 0);
            let count = get_u16_be(data, 2);
            let byte_count = data[4] as usize;
            if count == 0
                || count > MAX_WRITE_REGISTERS
                || byte_count != count as usize * 2
                || data.len() < 5 + byte_count
            {
                return Err(ExceptionCode::IllegalDataValue);
            }
            if start as u32 + count as u32 > 0x1_0000 {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            let values = bytes_to_registers(&data[5..5 + byte_count])
                .map_err(|_| ExceptionCode::IllegalDataValue)?;
            handler.write_multiple_registers(start, &values)?;
            Ok(data[..4].to_vec())
        }

        FC_READ_WRITE_MULTIPLE_REGISTERS => {
            if data.len() < 9 {
                return Err(ExceptionCode::IllegalDataValue);
            }
            let read_start = get_u16_be(data, 0);
            let read_count = get_u16_be(data, 2);
            let write_start = get_u16_be(data, 4);
            let write_count = get_u16_be(data, 6);
            let byte_count = data[8] as usize;
            if read_count == 0
                || read_count > MAX_READ_WRITE_REGISTERS
                || write_count == 0
                || write_count > MAX_READ_WRITE_REGISTERS
                || byte_count != write_count as usize * 2
                || data.len() < 9 + byte_count
            {
                return Err(ExceptionCode::IllegalDataValue);
            }
            if read_start as u32 + read_count as u32 > 0x1_0000
                || write_start as u32 + write_count as u32 > 0x1_0000
            {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            // Write payload sits after the five header fields, offset 9.
            let values = bytes_to_registers(&data[9..9 + byte_count])
                .map_err(|_| ExceptionCode::IllegalDataValue)?;
            let mut registers = vec![0u16; read_count as usize];
            handler.read_write_multiple_registers(read_start, &mut registers, write_start, &values)?;
            let mut out = Vec::with_capacity(1 + registers.len() * 2);
            out.push((registers.len() * 2) as u8);
            out.extend_from_slice(&registers_to_bytes(&registers));
            Ok(out)
        }

        FC_ENCAPSULATED_INTERFACE => {
            if data.len() < 3 {
                return Err(ExceptionCode::IllegalDataValue);
            }
            if data[0] != MEI_READ_DEVICE_ID {
                return Err(ExceptionCode::IllegalFunction);
            }
            let code = ReadDeviceIdCode::from_u8(data[1])
                .map_err(|_| ExceptionCode::IllegalDataValue)?;
            let identity = handler
                .device_identity()
                .ok_or(ExceptionCode::IllegalFunction)?;
            build_device_id_response(identity, code, data[2], max_pdu_data)
        }

        _ => match handler.custom_request(function, data)? {
            Some(response) => Ok(response),
            None => Err(ExceptionCode::IllegalFunction),
        },
    }
}

/// Build one page of a device-identification response.
fn build_device_id_response(
    identity: &DeviceIdentity,
    code: ReadDeviceIdCode,
    object_id: u8,
    max_pdu_data: usize,
) -> Result<Vec<u8>, ExceptionCode> {
    let mut out = vec![
        MEI_READ_DEVICE_ID,
        code.to_u8(),
        identity.conformity_level(),
        NO_MORE_FOLLOWS,
        0, // next object id
        0, // object count
    ];

    match code.highest_object_id() {
        None => {
            // Specific access: exactly the requested object.
            let value = identity
                .object(object_id)
                .ok_or(ExceptionCode::IllegalDataAddress)?;
            if value.len() > u8::MAX as usize {
                return Err(ExceptionCode::ServerDeviceFailure);
            }
            out.push(object_id);
            out.push(value.len() as u8);
            out.extend_from_slice(value);
            out[5] = 1;
        }
        Some(highest) => {
            if object_id > highest {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            let budget = max_pdu_data.saturating_sub(DEVICE_ID_METADATA_LEN);
            let mut used = 0usize;
            let mut emitted = 0u8;
            for (id, value) in identity.objects_in_range(object_id, highest) {
                if value.len() > u8::MAX as usize {
                    return Err(ExceptionCode::ServerDeviceFailure);
                }
                let triple_len = 2 + value.len();
                if used + triple_len > budget {
                    if emitted == 0 {
                        // Not even one object fits; paging cannot progress.
                        return Err(ExceptionCode::ServerDeviceFailure);
                    }
                    out[3] = MORE_FOLLOWS;
                    out[4] = id;
                    break;
                }
                out.push(id);
                out.push(value.len() as u8);
                out.extend_from_slice(value);
                used += triple_len;
                emitted += 1;
            }
            if emitted == 0 {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            out[5] = emitted;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory device with a small data model, for dispatch tests.
    struct TestDevice {
        coils: Vec<bool>,
        discrete: Vec<bool>,
        holding: Vec<u16>,
        input: Vec<u16>,
        identity: Option<DeviceIdentity>,
        seen: Vec<(u8, u8)>,
    }

    impl TestDevice {
        fn new() -> Self {
            Self {
                coils: vec![false; 64],
                discrete: vec![false; 64],
                holding: vec![0; 64],
                input: vec![0; 64],
                identity: None,
                seen: Vec::new(),
            }
        }
    }

    impl DeviceHandler for TestDevice {
        fn read_coils(&mut self, start: u16, coils: &mut [bool]) -> Result<(), ExceptionCode> {
            let start = start as usize;
            let slice = self
                .coils
                .get(start..start + coils.len())
                .ok_or(ExceptionCode::IllegalDataAddress)?;
            coils.copy_from_slice(slice);
            Ok(())
        }

        fn read_discrete_inputs(
            &mut self,
            start: u16,
            inputs: &mut [bool],
        ) -> Result<(), ExceptionCode> {
            let start = start as usize;
            let slice = self
                .discrete
                .get(start..start + inputs.len())
                .ok_or(ExceptionCode::IllegalDataAddress)?;
            inputs.copy_from_slice(slice);
            Ok(())
        }

        fn read_holding_registers(
            &mut self,
            start: u16,
            registers: &mut [u16],
        ) -> Result<(), ExceptionCode> {
            let start = start as usize;
            let slice = self
                .holding
                .get(start..start + registers.len())
                .ok_or(ExceptionCode::IllegalDataAddress)?;
            registers.copy_from_slice(slice);
            Ok(())
        }

        fn read_input_registers(
            &mut self,
            start: u16,
            registers: &mut [u16],
        ) -> Result<(), ExceptionCode> {
            let start = start as usize;
            let slice = self
                .input
                .get(start..start + registers.len())
                .ok_or(ExceptionCode::IllegalDataAddress)?;
            registers.copy_from_slice(slice);
            Ok(())
        }

        fn write_single_coil(&mut self, address: u16, value: bool) -> Result<(), ExceptionCode> {
            let slot = self
                .coils
                .get_mut(address as usize)
                .ok_or(ExceptionCode::IllegalDataAddress)?;
            *slot = value;
            Ok(())
        }

        fn write_single_register(&mut self, address: u16, value: u16) -> Result<(), ExceptionCode> {
            let slot = self
                .holding
                .get_mut(address as usize)
                .ok_or(ExceptionCode::IllegalDataAddress)?;
            *slot = value;
            Ok(())
        }

        fn write_multiple_coils(
            &mut self,
            start: u16,
            values: &[bool],
        ) -> Result<(), ExceptionCode> {
            let start = start as usize;
            let slice = self
                .coils
                .get_mut(start..start + values.len())
                .ok_or(ExceptionCode::IllegalDataAddress)?;
            slice.copy_from_slice(values);
            Ok(())
        }

        fn write_multiple_registers(
            &mut self,
            start: u16,
            values: &[u16],
        ) -> Result<(), ExceptionCode> {
            let start = start as usize;
            let slice = self
                .holding
                .get_mut(start..start + values.len())
                .ok_or(ExceptionCode::IllegalDataAddress)?;
            slice.copy_from_slice(values);
            Ok(())
        }

        fn device_identity(&self) -> Option<&DeviceIdentity> {
            self.identity.as_ref()
        }

        fn custom_request(
            &mut self,
            function: u8,
            _data: &[u8],
        ) -> Result<Option<Vec<u8>>, ExceptionCode> {
            if function == 0x41 {
                Ok(Some(vec![0xAA]))
            } else {
                Ok(None)
            }
        }

        fn on_message_received(&mut self, address: u8, function: u8) {
            self.seen.push((address, function));
        }
    }

    #[test]
    fn test_read_holding_registers_response_shape() {
        let mut device = TestDevice::new();
        device.holding[0] = 0x1234;
        device.holding[1] = 0x5678;

        let response =
            dispatch_request(&mut device, 0x03, &[0x00, 0x00, 0x00, 0x02], 252).unwrap();
        assert_eq!(response, vec![0x04, 0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn test_read_coils_bit_packing() {
        let mut device = TestDevice::new();
        for k in [0usize, 2, 3, 8, 10] {
            device.coils[k] = true;
        }

        // 11 coils -> 2 payload bytes, LSB first, tail bits zero.
        let response =
            dispatch_request(&mut device, 0x01, &[0x00, 0x00, 0x00, 0x0B], 252).unwrap();
        assert_eq!(response, vec![0x02, 0b0000_1101, 0b0000_0101]);
    }

    #[test]
    fn test_read_coils_count_bounds() {
        let mut device = TestDevice::new();
        // count 0
        assert_eq!(
            dispatch_request(&mut device, 0x01, &[0x00, 0x00, 0x00, 0x00], 252),
            Err(ExceptionCode::IllegalDataValue)
        );
        // count 2001
        assert_eq!(
            dispatch_request(&mut device, 0x01, &[0x00, 0x00, 0x07, 0xD1], 252),
            Err(ExceptionCode::IllegalDataValue)
        );
        // short request
        assert_eq!(
            dispatch_request(&mut device, 0x01, &[0x00, 0x00, 0x00], 252),
            Err(ExceptionCode::IllegalDataValue)
        );
        // start + count past the address space
        assert_eq!(
            dispatch_request(&mut device, 0x01, &[0xFF, 0xFF, 0x00, 0x02], 252),
            Err(ExceptionCode::IllegalDataAddress)
        );
    }

    #[test]
    fn test_register_read_count_bounds() {
        let mut device = TestDevice::new();
        assert_eq!(
            dispatch_request(&mut device, 0x03, &[0x00, 0x00, 0x00, 0x7E], 252),
            Err(ExceptionCode::IllegalDataValue)
        );
        // 125 starting at 0 is within the PDU limit but past this device's
        // 64 registers, so the handler refuses with IllegalDataAddress.
        assert_eq!(
            dispatch_request(&mut device, 0x03, &[0x00, 0x00, 0x00, 0x7D], 252),
            Err(ExceptionCode::IllegalDataAddress)
        );
    }

    #[test]
    fn test_write_single_coil_echo_and_value_check() {
        let mut device = TestDevice::new();

        let response =
            dispatch_request(&mut device, 0x05, &[0x00, 0x0A, 0xFF, 0x00], 252).unwrap();
        assert_eq!(response, vec![0x00, 0x0A, 0xFF, 0x00]);
        assert!(device.coils[10]);

        let response =
            dispatch_request(&mut device, 0x05, &[0x00, 0x0A, 0x00, 0x00], 252).unwrap();
        assert_eq!(response, vec![0x00, 0x0A, 0x00, 0x00]);
        assert!(!device.coils[10]);

        // Anything but 0x0000/0xFF00 is refused.
        assert_eq!(
            dispatch_request(&mut device, 0x05, &[0x00, 0x0A, 0x12, 0x34], 252),
            Err(ExceptionCode::IllegalDataValue)
        );
    }

    #[test]
    fn test_write_multiple_registers() {
        let mut device = TestDevice::new();
        let response = dispatch_request(
            &mut device,
            0x10,
            &[0x00, 0x05, 0x00, 0x02, 0x04, 0x12, 0x34, 0x56, 0x78],
            252,
        )
        .unwrap();
        assert_eq!(response, vec![0x00, 0x05, 0x00, 0x02]);
        assert_eq!(device.holding[5], 0x1234);
        assert_eq!(device.holding[6], 0x5678);

        // byte count disagreeing with the quantity
        assert_eq!(
            dispatch_request(
                &mut device,
                0x10,
                &[0x00, 0x05, 0x00, 0x02, 0x02, 0x12, 0x34],
                252
            ),
            Err(ExceptionCode::IllegalDataValue)
        );
    }

    #[test]
    fn test_write_multiple_coils() {
        let mut device = TestDevice::new();
        // 10 coils: 1,0,1,1,0,0,1,1 | 1,0
        let response = dispatch_request(
            &mut device,
            0x0F,
            &[0x00, 0x00, 0x00, 0x0A, 0x02, 0b1100_1101, 0b0000_0001],
            252,
        )
        .unwrap();
        assert_eq!(response, vec![0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(
            &device.coils[..10],
            &[true, false, true, true, false, false, true, true, true, false]
        );
    }

    #[test]
    fn test_read_write_multiple_registers_order_and_offsets() {
        let mut device = TestDevice::new();
        device.holding[3] = 0xAAAA;
        // Read 2 regs from 3 while writing 1 reg at 3: the write lands
        // before the read, so the response reflects the new value.
        let response = dispatch_request(
            &mut device,
            0x17,
            &[
                0x00, 0x03, 0x00, 0x02, // read start 3, count 2
                0x00, 0x03, 0x00, 0x01, // write start 3, count 1
                0x02, 0x5A, 0x5A, // byte count + write payload at offset 9
            ],
            252,
        )
        .unwrap();
        assert_eq!(response, vec![0x04, 0x5A, 0x5A, 0x00, 0x00]);
        assert_eq!(device.holding[3], 0x5A5A);
    }

    #[test]
    fn test_read_write_multiple_registers_bounds() {
        let mut device = TestDevice::new();
        // 122 read registers exceeds the FC23 limit of 121.
        assert_eq!(
            dispatch_request(
                &mut device,
                0x17,
                &[0x00, 0x00, 0x00, 0x7A, 0x00, 0x00, 0x00, 0x01, 0x02, 0x00, 0x01],
                252
            ),
            Err(ExceptionCode::IllegalDataValue)
        );
        // Truncated request
        assert_eq!(
            dispatch_request(&mut device, 0x17, &[0x00, 0x00, 0x00, 0x01], 252),
            Err(ExceptionCode::IllegalDataValue)
        );
    }

    #[test]
    fn test_unsupported_function_reaches_custom_hook() {
        let mut device = TestDevice::new();
        assert_eq!(
            dispatch_request(&mut device, 0x41, &[], 252).unwrap(),
            vec![0xAA]
        );
        assert_eq!(
            dispatch_request(&mut device, 0x42, &[], 252),
            Err(ExceptionCode::IllegalFunction)
        );
    }

    #[test]
    fn test_input_register_default_refuses() {
        struct Bare;
        impl DeviceHandler for Bare {}
        let mut bare = Bare;
        assert_eq!(
            dispatch_request(&mut bare, 0x04, &[0x00, 0x00, 0x00, 0x01], 252),
            Err(ExceptionCode::IllegalFunction)
        );
    }

    #[test]
    fn test_device_id_single_page() {
        let mut device = TestDevice::new();
        device.identity = Some(DeviceIdentity::basic("ACME", "AX-100", "1.02"));

        let response =
            dispatch_request(&mut device, 0x2B, &[0x0E, 0x01, 0x00], 252).unwrap();
        assert_eq!(response[0], 0x0E);
        assert_eq!(response[1], 0x01);
        assert_eq!(response[2], 0x81);
        assert_eq!(response[3], NO_MORE_FOLLOWS);
        assert_eq!(response[5], 3);
        // First triple: object 0, length 4, "ACME"
        assert_eq!(&response[6..12], &[0x00, 0x04, b'A', b'C', b'M', b'E']);
    }

    #[test]
    fn test_device_id_paging() {
        let mut device = TestDevice::new();
        let mut identity = DeviceIdentity::basic("ACME", "AX-100", "1.02");
        for id in 0x10u8..0x28 {
            identity = identity.with_object(id, vec![id; 20]);
        }
        device.identity = Some(identity);

        // First page fills up and names the continuation object.
        let first = dispatch_request(&mut device, 0x2B, &[0x0E, 0x02, 0x00], 252).unwrap();
        assert_eq!(first[3], MORE_FOLLOWS);
        let next_id = first[4];
        assert!(next_id > 0x00);

        // Resuming at the continuation object eventually terminates.
        let mut resume = next_id;
        for _ in 0..16 {
            let page =
                dispatch_request(&mut device, 0x2B, &[0x0E, 0x02, resume], 252).unwrap();
            if page[3] == NO_MORE_FOLLOWS {
                return;
            }
            assert!(page[4] > resume);
            resume = page[4];
        }
        panic!("paging never terminated");
    }

    #[test]
    fn test_device_id_specific_object() {
        let mut device = TestDevice::new();
        device.identity = Some(DeviceIdentity::basic("ACME", "AX-100", "1.02"));

        let response =
            dispatch_request(&mut device, 0x2B, &[0x0E, 0x04, 0x01], 252).unwrap();
        assert_eq!(response[5], 1);
        assert_eq!(&response[6..8], &[0x01, 0x06]);
        assert_eq!(&response[8..], b"AX-100");

        assert_eq!(
            dispatch_request(&mut device, 0x2B, &[0x0E, 0x04, 0x30], 252),
            Err(ExceptionCode::IllegalDataAddress)
        );
    }

    #[test]
    fn test_device_id_without_identity_refuses() {
        let mut device = TestDevice::new();
        assert_eq!(
            dispatch_request(&mut device, 0x2B, &[0x0E, 0x01, 0x00], 252),
            Err(ExceptionCode::IllegalFunction)
        );
        // Unknown MEI type
        assert_eq!(
            dispatch_request(&mut device, 0x2B, &[0x0D, 0x01, 0x00], 252),
            Err(ExceptionCode::IllegalFunction)
        );
    }

    #[test]
    fn test_server_address_validation() {
        assert!(ModbusServer::new(0, TestDevice::new()).is_err());
        assert!(ModbusServer::new(1, TestDevice::new()).is_ok());
        assert!(ModbusServer::new(247, TestDevice::new()).is_ok());
        assert!(ModbusServer::new(ANY_DEVICE_ADDRESS, TestDevice::new()).is_ok());
        assert!(ModbusServer::new(250, TestDevice::new()).is_err());
    }

    #[tokio::test]
    async fn test_server_lifecycle() {
        let mut server = ModbusServer::new(1, TestDevice::new()).unwrap();
        assert!(!server.is_running());

        server.start().unwrap();
        assert!(server.is_running());
        assert!(server.start().is_err());

        server.stop().await.unwrap();
        assert!(!server.is_running());
    }
}
