//! Opaque transaction payload container.
//!
//! A [`Parcel`] is the byte-buffer contract shared with the driver: a flat
//! data buffer plus an array of offsets marking embedded object references
//! within it. Marshalling of rich types is out of scope for this crate; the
//! accessors here cover only what the core itself needs (status codes, the
//! interface-descriptor string, and tests).

use bytes::{Buf, BufMut};

use crate::error::IpcError;

/// Flat payload buffer with an object-offset side array.
#[derive(Debug, Default, Clone)]
pub struct Parcel {
    data: Vec<u8>,
    offsets: Vec<u64>,
    read_pos: usize,
}

impl Parcel {
    /// Creates an empty parcel.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a parcel around raw buffer contents received from the driver.
    #[must_use]
    pub(crate) fn from_raw(data: Vec<u8>, offsets: Vec<u64>) -> Self {
        Self {
            data,
            offsets,
            read_pos: 0,
        }
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    /// Raw payload bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Offsets of embedded object references within the payload.
    #[must_use]
    pub fn object_offsets(&self) -> &[u64] {
        &self.offsets
    }

    /// Clears the payload and rewinds the read position.
    pub fn clear(&mut self) {
        self.data.clear();
        self.offsets.clear();
        self.read_pos = 0;
    }

    /// Appends a little-endian `i32`.
    pub fn write_i32(&mut self, value: i32) {
        self.data.put_i32_le(value);
    }

    /// Appends a little-endian `u32`.
    pub fn write_u32(&mut self, value: u32) {
        self.data.put_u32_le(value);
    }

    /// Appends a little-endian `u64`.
    pub fn write_u64(&mut self, value: u64) {
        self.data.put_u64_le(value);
    }

    /// Appends a length-prefixed UTF-8 string, padded to 4 bytes.
    pub fn write_string(&mut self, value: &str) {
        self.write_u32(value.len() as u32);
        self.data.put_slice(value.as_bytes());
        let pad = (4 - value.len() % 4) % 4;
        self.data.put_bytes(0, pad);
    }

    /// Reads a little-endian `i32`.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Protocol`] when fewer than four bytes remain.
    pub fn read_i32(&mut self) -> Result<i32, IpcError> {
        let mut rest = self.remaining_slice(4)?;
        let value = rest.get_i32_le();
        self.read_pos += 4;
        Ok(value)
    }

    /// Reads a little-endian `u32`.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Protocol`] when fewer than four bytes remain.
    pub fn read_u32(&mut self) -> Result<u32, IpcError> {
        let mut rest = self.remaining_slice(4)?;
        let value = rest.get_u32_le();
        self.read_pos += 4;
        Ok(value)
    }

    /// Reads a little-endian `u64`.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Protocol`] when fewer than eight bytes remain.
    pub fn read_u64(&mut self) -> Result<u64, IpcError> {
        let mut rest = self.remaining_slice(8)?;
        let value = rest.get_u64_le();
        self.read_pos += 8;
        Ok(value)
    }

    /// Reads a string written by [`Parcel::write_string`].
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Protocol`] on truncation or invalid UTF-8.
    pub fn read_string(&mut self) -> Result<String, IpcError> {
        let len = self.read_u32()? as usize;
        let padded = len + (4 - len % 4) % 4;
        let rest = self.remaining_slice(padded)?;
        let value = std::str::from_utf8(&rest[..len])
            .map_err(|e| IpcError::Protocol(format!("invalid UTF-8 in parcel string: {e}")))?
            .to_string();
        self.read_pos += padded;
        Ok(value)
    }

    fn remaining_slice(&self, need: usize) -> Result<&[u8], IpcError> {
        let rest = &self.data[self.read_pos.min(self.data.len())..];
        if rest.len() < need {
            return Err(IpcError::Protocol(format!(
                "parcel truncated: need {need} bytes, {} remain",
                rest.len()
            )));
        }
        Ok(rest)
    }
}
