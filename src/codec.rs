//! Wire-level byte utilities shared by all framers
//!
//! Everything here operates on raw ADU/PDU bytes:
//!
//! - big-endian `u16` access at arbitrary buffer positions
//! - CRC-16 for RTU (reflected polynomial 0xA001, init 0xFFFF, no final XOR;
//!   transmitted low byte first)
//! - LRC-8 for ASCII (two's complement of the summed raw bytes)
//! - the hex nibble codec used by the ASCII framing
//! - LSB-first bit packing for coil payloads

use crc::{Crc, CRC_16_MODBUS};

use crate::error::{ModbusError, ModbusResult};

/// CRC calculator for RTU framing.
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Write `value` big-endian at `buf[pos..pos + 2]`.
#[inline]
pub fn put_u16_be(buf: &mut [u8], pos: usize, value: u16) {
    buf[pos] = (value >> 8) as u8;
    buf[pos + 1] = (value & 0xFF) as u8;
}

/// Read a big-endian `u16` from `buf[pos..pos + 2]`.
#[inline]
pub fn get_u16_be(buf: &[u8], pos: usize) -> u16 {
    u16::from_be_bytes([buf[pos], buf[pos + 1]])
}

/// CRC-16 over `data` as used by Modbus RTU.
///
/// The result is appended to the frame low byte first.
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// LRC-8 over the raw (not hex-encoded) bytes of an ASCII frame.
#[inline]
pub fn lrc8(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    sum.wrapping_neg()
}

/// Upper-case hex character for a nibble in `0..=15`.
#[inline]
pub fn nibble_to_hex(nibble: u8) -> u8 {
    debug_assert!(nibble <= 0x0F);
    if nibble < 10 {
        b'0' + nibble
    } else {
        b'A' + (nibble - 10)
    }
}

/// Nibble value of a hex character. Accepts both cases.
#[inline]
pub fn hex_to_nibble(c: u8) -> ModbusResult<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        _ => Err(ModbusError::invalid_data(format!(
            "invalid hex character: 0x{c:02X}"
        ))),
    }
}

/// Encode a byte as two upper-case hex characters.
#[inline]
pub fn byte_to_hex_pair(byte: u8) -> [u8; 2] {
    [nibble_to_hex(byte >> 4), nibble_to_hex(byte & 0x0F)]
}

/// Decode two hex characters into a byte.
#[inline]
pub fn hex_pair_to_byte(high: u8, low: u8) -> ModbusResult<u8> {
    Ok((hex_to_nibble(high)? << 4) | hex_to_nibble(low)?)
}

/// Pack coil states into bytes, LSB first within each byte; unused high bits
/// of the final byte stay zero.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; bits.len().div_ceil(8)];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Unpack `bit_count` coil states from LSB-first packed bytes. Bits beyond
/// the payload read as false.
pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
    (0..bit_count)
        .map(|i| {
            bytes
                .get(i / 8)
                .map(|b| b & (1 << (i % 8)) != 0)
                .unwrap_or(false)
        })
        .collect()
}

/// Serialize registers big-endian.
pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(registers.len() * 2);
    for &register in registers {
        bytes.extend_from_slice(&register.to_be_bytes());
    }
    bytes
}

/// Deserialize big-endian registers.
pub fn bytes_to_registers(bytes: &[u8]) -> ModbusResult<Vec<u16>> {
    if bytes.len() % 2 != 0 {
        return Err(ModbusError::invalid_data(
            "register payload length must be even",
        ));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u16_be_round_trip() {
        let mut buf = [0u8; 4];
        put_u16_be(&mut buf, 1, 0x1234);
        assert_eq!(buf, [0x00, 0x12, 0x34, 0x00]);
        assert_eq!(get_u16_be(&buf, 1), 0x1234);
    }

    #[test]
    fn test_crc16_known_vectors() {
        // Reference frames with their wire CRCs (low byte first on the wire).
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]), 0x0BC4);
        assert_eq!(
            crc16(&[0x01, 0x03, 0x04, 0x12, 0x34, 0x56, 0x78]),
            0xA7B5
        );
        assert_eq!(crc16(&[0x00, 0x05, 0x00, 0x0A, 0xFF, 0x00]), 0x99AD);
    }

    #[test]
    fn test_crc16_wire_order() {
        let crc = crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]);
        assert_eq!(crc.to_le_bytes(), [0xC4, 0x0B]);
    }

    #[test]
    fn test_lrc8_known_vectors() {
        // addr=1 fc=1 start=0 count=10 -> 0xF4
        assert_eq!(lrc8(&[0x01, 0x01, 0x00, 0x00, 0x00, 0x0A]), 0xF4);
        // addr=1 fc=1 byte_count=2 bits=00 00 -> 0xFC
        assert_eq!(lrc8(&[0x01, 0x01, 0x02, 0x00, 0x00]), 0xFC);
        // addr=1 fc=3 start=0 count=2 -> 0xFA
        assert_eq!(lrc8(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]), 0xFA);
    }

    #[test]
    fn test_lrc8_sum_is_zero() {
        let data = [0x11u8, 0x03, 0x00, 0x6B, 0x00, 0x03];
        let lrc = lrc8(&data);
        let total = data.iter().fold(lrc, |acc, &b| acc.wrapping_add(b));
        assert_eq!(total, 0);
    }

    #[test]
    fn test_hex_codec() {
        assert_eq!(byte_to_hex_pair(0x1A), [b'1', b'A']);
        assert_eq!(byte_to_hex_pair(0x0F), [b'0', b'F']);
        assert_eq!(hex_pair_to_byte(b'1', b'A').unwrap(), 0x1A);
        assert_eq!(hex_pair_to_byte(b'a', b'f').unwrap(), 0xAF);
        assert!(hex_pair_to_byte(b'G', b'0').is_err());
        assert!(hex_to_nibble(b':').is_err());
    }

    #[test]
    fn test_bit_packing() {
        let bits = [true, false, true, true, false, false, false, false, true];
        let packed = pack_bits(&bits);
        assert_eq!(packed, vec![0b0000_1101, 0b0000_0001]);
        assert_eq!(unpack_bits(&packed, bits.len()), bits);
    }

    #[test]
    fn test_bit_packing_pads_with_zero() {
        for count in 1..=17usize {
            let bits = vec![true; count];
            let packed = pack_bits(&bits);
            assert_eq!(packed.len(), count.div_ceil(8));
            // All bits past `count` must be zero in the final byte.
            let tail_bits = packed.len() * 8 - count;
            if tail_bits > 0 {
                let last = *packed.last().unwrap();
                assert_eq!(last >> (8 - tail_bits), 0);
            }
        }
    }

    #[test]
    fn test_register_serialization() {
        let registers = vec![0x1234, 0x5678];
        let bytes = registers_to_bytes(&registers);
        assert_eq!(bytes, vec![0x12, 0x34, 0x56, 0x78]);
        assert_eq!(bytes_to_registers(&bytes).unwrap(), registers);
        assert!(bytes_to_registers(&[0x01]).is_err());
    }
}
