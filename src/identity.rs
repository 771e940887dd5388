//! Device identification (function 0x2B / MEI 0x0E)
//!
//! A device exposes a set of `(object id, value)` pairs: three mandatory
//! basic objects (vendor name, product code, revision), optional regular
//! objects up to 0x7F and extended objects up to 0xFF. A reader names a
//! category and a starting object; the device streams objects upward from
//! there, flagging `more_follows` with the next object id whenever a
//! response fills up, so large identification sets page across several
//! exchanges.

use std::collections::BTreeMap;

use crate::error::{ModbusError, ModbusResult};

/// Object id of the mandatory vendor name.
pub const OBJECT_VENDOR_NAME: u8 = 0x00;

/// Object id of the mandatory product code.
pub const OBJECT_PRODUCT_CODE: u8 = 0x01;

/// Object id of the mandatory major/minor revision.
pub const OBJECT_MAJOR_MINOR_REVISION: u8 = 0x02;

/// Highest object id of the regular category.
pub const MAX_REGULAR_OBJECT_ID: u8 = 0x7F;

/// Bit 7 of the conformity level: stream access supported.
pub const CONFORMITY_STREAM_ACCESS: u8 = 0x80;

/// `more_follows` value announcing a continuation.
pub const MORE_FOLLOWS: u8 = 0xFF;

/// `more_follows` value ending the stream.
pub const NO_MORE_FOLLOWS: u8 = 0x00;

/// Read Device Identification access codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadDeviceIdCode {
    /// Stream the basic objects (0x00..=0x02).
    Basic = 0x01,
    /// Stream the regular objects (up to 0x7F).
    Regular = 0x02,
    /// Stream the extended objects (up to 0xFF).
    Extended = 0x03,
    /// Fetch one specific object.
    Specific = 0x04,
}

impl ReadDeviceIdCode {
    /// Convert from the wire byte.
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(Self::Basic),
            0x02 => Ok(Self::Regular),
            0x03 => Ok(Self::Extended),
            0x04 => Ok(Self::Specific),
            _ => Err(ModbusError::invalid_data(format!(
                "invalid read device id code: 0x{value:02X}"
            ))),
        }
    }

    /// The wire byte.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Highest object id this access code streams, `None` for
    /// [`Specific`](Self::Specific).
    pub fn highest_object_id(self) -> Option<u8> {
        match self {
            Self::Basic => Some(OBJECT_MAJOR_MINOR_REVISION),
            Self::Regular => Some(MAX_REGULAR_OBJECT_ID),
            Self::Extended => Some(0xFF),
            Self::Specific => None,
        }
    }
}

/// The identification object set a server exposes.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    objects: BTreeMap<u8, Vec<u8>>,
    conformity_override: Option<u8>,
}

impl DeviceIdentity {
    /// Build an identity carrying the three mandatory basic objects.
    pub fn basic(vendor_name: &str, product_code: &str, revision: &str) -> Self {
        let mut objects = BTreeMap::new();
        objects.insert(OBJECT_VENDOR_NAME, vendor_name.as_bytes().to_vec());
        objects.insert(OBJECT_PRODUCT_CODE, product_code.as_bytes().to_vec());
        objects.insert(OBJECT_MAJOR_MINOR_REVISION, revision.as_bytes().to_vec());
        Self {
            objects,
            conformity_override: None,
        }
    }

    /// Add or replace an object.
    pub fn with_object(mut self, object_id: u8, value: impl Into<Vec<u8>>) -> Self {
        self.objects.insert(object_id, value.into());
        self
    }

    /// Force a specific conformity level byte instead of the derived one.
    pub fn with_conformity_level(mut self, level: u8) -> Self {
        self.conformity_override = Some(level);
        self
    }

    /// Object value, if present.
    pub fn object(&self, object_id: u8) -> Option<&[u8]> {
        self.objects.get(&object_id).map(|v| v.as_slice())
    }

    /// All objects in ascending id order.
    pub fn objects(&self) -> impl Iterator<Item = (u8, &[u8])> {
        self.objects.iter().map(|(&id, v)| (id, v.as_slice()))
    }

    /// Objects of `[from_id, to_id]` in ascending order.
    pub fn objects_in_range(
        &self,
        from_id: u8,
        to_id: u8,
    ) -> impl Iterator<Item = (u8, &[u8])> {
        self.objects
            .range(from_id..=to_id)
            .map(|(&id, v)| (id, v.as_slice()))
    }

    /// Conformity level byte: derived from the highest populated object
    /// unless overridden. Stream access (bit 7) is always advertised since
    /// the server implements it.
    pub fn conformity_level(&self) -> u8 {
        if let Some(level) = self.conformity_override {
            return level;
        }
        let highest = self.objects.keys().next_back().copied().unwrap_or(0);
        let category = if highest <= OBJECT_MAJOR_MINOR_REVISION {
            0x01
        } else if highest <= MAX_REGULAR_OBJECT_ID {
            0x02
        } else {
            0x03
        };
        category | CONFORMITY_STREAM_ACCESS
    }
}

/// Result of a (possibly paged) master-side identification read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentification {
    /// Conformity level reported by the device.
    pub conformity_level: u8,
    /// Objects collected across all pages, keyed by object id.
    pub objects: BTreeMap<u8, Vec<u8>>,
}

impl DeviceIdentification {
    /// Object value decoded as UTF-8, if present and valid.
    pub fn object_str(&self, object_id: u8) -> Option<&str> {
        self.objects
            .get(&object_id)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Convenience accessor for the vendor name object.
    pub fn vendor_name(&self) -> Option<&str> {
        self.object_str(OBJECT_VENDOR_NAME)
    }

    /// Convenience accessor for the product code object.
    pub fn product_code(&self) -> Option<&str> {
        self.object_str(OBJECT_PRODUCT_CODE)
    }

    /// Convenience accessor for the revision object.
    pub fn revision(&self) -> Option<&str> {
        self.object_str(OBJECT_MAJOR_MINOR_REVISION)
    }

    /// Whether the device reports stream access capability.
    pub fn supports_stream_access(&self) -> bool {
        self.conformity_level & CONFORMITY_STREAM_ACCESS != 0
    }
}
