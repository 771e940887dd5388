//! Modbus PDU data structure and request builders
//!
//! A PDU is `function code | data`, at most 253 bytes. The structure uses a
//! fixed-size stack array to avoid heap allocation on the hot path; the
//! builders produce request PDUs for every function code the master issues.

use tracing::debug;

use crate::codec::pack_bits;
use crate::constants::{
    COIL_OFF, COIL_ON, FC_DIAGNOSTICS, FC_ENCAPSULATED_INTERFACE, FC_GET_COMM_EVENT_COUNTER,
    FC_GET_COMM_EVENT_LOG, FC_READ_EXCEPTION_STATUS, FC_READ_WRITE_MULTIPLE_REGISTERS,
    FC_WRITE_MULTIPLE_COILS, FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL,
    FC_WRITE_SINGLE_REGISTER, MAX_PDU_SIZE, MEI_READ_DEVICE_ID,
};
use crate::error::{ModbusError, ModbusResult};

/// PDU with stack-allocated fixed storage.
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    /// Create an empty PDU
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Create a PDU from a byte slice
    #[inline]
    pub fn from_slice(data: &[u8]) -> ModbusResult<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(ModbusError::Protocol {
                message: format!("PDU too large: {} bytes (max {})", data.len(), MAX_PDU_SIZE),
            });
        }

        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();
        Ok(pdu)
    }

    /// Push a single byte
    #[inline]
    pub fn push(&mut self, byte: u8) -> ModbusResult<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(ModbusError::Protocol {
                message: "PDU buffer full".to_string(),
            });
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> ModbusResult<()> {
        self.push((value >> 8) as u8)?;
        self.push((value & 0xFF) as u8)?;
        Ok(())
    }

    /// Extend with a byte slice
    #[inline]
    pub fn extend(&mut self, data: &[u8]) -> ModbusResult<()> {
        if self.len + data.len() > MAX_PDU_SIZE {
            return Err(ModbusError::Protocol {
                message: format!(
                    "PDU would exceed max size: {} + {} > {}",
                    self.len,
                    data.len(),
                    MAX_PDU_SIZE
                ),
            });
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    /// Get immutable data slice
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Get current length
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Clear PDU
    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Get function code (first byte)
    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        if self.len > 0 {
            Some(self.data[0])
        } else {
            None
        }
    }

    /// PDU data (everything after the function code)
    #[inline]
    pub fn payload(&self) -> &[u8] {
        if self.len > 1 {
            &self.data[1..self.len]
        } else {
            &[]
        }
    }

    /// Check if exception response
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(|fc| fc & 0x80 != 0)
            .unwrap_or(false)
    }

    /// Get exception code
    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() && self.len > 1 {
            Some(self.data[1])
        } else {
            None
        }
    }

    /// Get human-readable function code description
    pub fn function_code_description(fc: u8) -> &'static str {
        match fc & 0x7F {
            0x01 => "Read Coils",
            0x02 => "Read Discrete Inputs",
            0x03 => "Read Holding Registers",
            0x04 => "Read Input Registers",
            0x05 => "Write Single Coil",
            0x06 => "Write Single Register",
            0x07 => "Read Exception Status",
            0x08 => "Diagnostics",
            0x0B => "Get Comm Event Counter",
            0x0C => "Get Comm Event Log",
            0x0F => "Write Multiple Coils",
            0x10 => "Write Multiple Registers",
            0x17 => "Read/Write Multiple Registers",
            0x2B => "Encapsulated Interface Transport",
            _ => "Unknown Function",
        }
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// PDU builder - fluent API
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl Default for PduBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PduBuilder {
    /// Create a new builder
    #[inline]
    pub fn new() -> Self {
        Self {
            pdu: ModbusPdu::new(),
        }
    }

    /// Set function code
    #[inline]
    pub fn function_code(mut self, fc: u8) -> ModbusResult<Self> {
        self.pdu.push(fc)?;
        Ok(self)
    }

    /// Add address
    #[inline]
    pub fn address(mut self, addr: u16) -> ModbusResult<Self> {
        self.pdu.push_u16(addr)?;
        Ok(self)
    }

    /// Add quantity
    #[inline]
    pub fn quantity(mut self, qty: u16) -> ModbusResult<Self> {
        self.pdu.push_u16(qty)?;
        Ok(self)
    }

    /// Add a byte
    #[inline]
    pub fn byte(mut self, b: u8) -> ModbusResult<Self> {
        self.pdu.push(b)?;
        Ok(self)
    }

    /// Add data
    #[inline]
    pub fn data(mut self, data: &[u8]) -> ModbusResult<Self> {
        self.pdu.extend(data)?;
        Ok(self)
    }

    /// Build the PDU
    #[inline]
    pub fn build(self) -> ModbusPdu {
        if let Some(fc) = self.pdu.function_code() {
            debug!(
                "PDU built: FC={:02X} ({}), total_len={}",
                fc,
                ModbusPdu::function_code_description(fc),
                self.pdu.len()
            );
        }
        self.pdu
    }

    /// Build a read request PDU for FC01-04
    pub fn build_read_request(fc: u8, start_address: u16, quantity: u16) -> ModbusResult<ModbusPdu> {
        if !matches!(fc, 0x01..=0x04) {
            return Err(ModbusError::InvalidFunction { code: fc });
        }
        Ok(PduBuilder::new()
            .function_code(fc)?
            .address(start_address)?
            .quantity(quantity)?
            .build())
    }

    /// Build a write single coil PDU (FC05)
    pub fn build_write_single_coil(address: u16, value: bool) -> ModbusResult<ModbusPdu> {
        let coil_value = if value { COIL_ON } else { COIL_OFF };
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_SINGLE_COIL)?
            .address(address)?
            .quantity(coil_value)?
            .build())
    }

    /// Build a write single register PDU (FC06)
    pub fn build_write_single_register(address: u16, value: u16) -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_SINGLE_REGISTER)?
            .address(address)?
            .quantity(value)?
            .build())
    }

    /// Build a read exception status PDU (FC07). Carries no data.
    pub fn build_read_exception_status() -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(FC_READ_EXCEPTION_STATUS)?
            .build())
    }

    /// Build a diagnostics PDU (FC08): sub-function plus one data word.
    pub fn build_diagnostics(sub_function: u16, data: u16) -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(FC_DIAGNOSTICS)?
            .address(sub_function)?
            .quantity(data)?
            .build())
    }

    /// Build a get comm event counter PDU (FC11). Carries no data.
    pub fn build_comm_event_counter() -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(FC_GET_COMM_EVENT_COUNTER)?
            .build())
    }

    /// Build a get comm event log PDU (FC12). Carries no data.
    pub fn build_comm_event_log() -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(FC_GET_COMM_EVENT_LOG)?
            .build())
    }

    /// Build a write multiple coils PDU (FC15)
    pub fn build_write_multiple_coils(address: u16, values: &[bool]) -> ModbusResult<ModbusPdu> {
        let coil_bytes = pack_bits(values);
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_MULTIPLE_COILS)?
            .address(address)?
            .quantity(values.len() as u16)?
            .byte(coil_bytes.len() as u8)?
            .data(&coil_bytes)?
            .build())
    }

    /// Build a write multiple registers PDU (FC16)
    pub fn build_write_multiple_registers(address: u16, values: &[u16]) -> ModbusResult<ModbusPdu> {
        let mut builder = PduBuilder::new()
            .function_code(FC_WRITE_MULTIPLE_REGISTERS)?
            .address(address)?
            .quantity(values.len() as u16)?
            .byte((values.len() * 2) as u8)?;

        for &value in values {
            builder = builder
                .byte((value >> 8) as u8)?
                .byte((value & 0xFF) as u8)?;
        }

        Ok(builder.build())
    }

    /// Build a read/write multiple registers PDU (FC23)
    pub fn build_read_write_multiple_registers(
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        write_values: &[u16],
    ) -> ModbusResult<ModbusPdu> {
        let mut builder = PduBuilder::new()
            .function_code(FC_READ_WRITE_MULTIPLE_REGISTERS)?
            .address(read_address)?
            .quantity(read_quantity)?
            .address(write_address)?
            .quantity(write_values.len() as u16)?
            .byte((write_values.len() * 2) as u8)?;

        for &value in write_values {
            builder = builder
                .byte((value >> 8) as u8)?
                .byte((value & 0xFF) as u8)?;
        }

        Ok(builder.build())
    }

    /// Build a read device identification PDU (FC43 / MEI 0x0E)
    pub fn build_read_device_identification(
        read_device_id_code: u8,
        object_id: u8,
    ) -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(FC_ENCAPSULATED_INTERFACE)?
            .byte(MEI_READ_DEVICE_ID)?
            .byte(read_device_id_code)?
            .byte(object_id)?
            .build())
    }
}
