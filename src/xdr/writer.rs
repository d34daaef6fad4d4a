// Copyright 2022 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Implementation of the [`Writer`] type to write XDR data.

use std::mem;

use super::{padding, Encode, Error, Result};

/// Serializes XDR data into a growable buffer with a size limit.
///
/// Writes that would take the buffer past its limit fail with
/// [`Error::Truncation`] and leave the buffer unchanged. For streamed
/// replies, [`Writer::take`] hands the data written so far to the
/// caller and starts a fresh buffer with the same limit.
#[derive(Clone, Debug)]
pub struct Writer {
    octets: Vec<u8>,
    limit: usize,
}

impl Writer {
    /// Creates a new `Writer` that will not grow beyond `limit` octets.
    pub fn new(limit: usize) -> Self {
        Self {
            octets: Vec::new(),
            limit,
        }
    }

    /// Returns the number of octets written so far.
    pub fn len(&self) -> usize {
        self.octets.len()
    }

    /// Returns whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.octets.is_empty()
    }

    /// Returns the data written so far.
    pub fn octets(&self) -> &[u8] {
        &self.octets
    }

    /// Consumes the `Writer`, returning the data written.
    pub fn finish(self) -> Vec<u8> {
        self.octets
    }

    /// Removes and returns the data written so far.
    pub fn take(&mut self) -> Vec<u8> {
        mem::take(&mut self.octets)
    }

    /// Discards everything after the first `len` octets.
    pub fn truncate(&mut self, len: usize) {
        self.octets.truncate(len);
    }

    /// Writes an unsigned 32-bit integer.
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.reserve(4)?;
        self.octets.extend_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Writes a signed 32-bit integer.
    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.write_u32(value as u32)
    }

    /// Writes a boolean.
    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_u32(value as u32)
    }

    /// Writes fixed-length opaque data (plus padding).
    pub fn write_fixed(&mut self, data: &[u8]) -> Result<()> {
        let pad = padding(data.len());
        self.reserve(data.len() + pad)?;
        self.octets.extend_from_slice(data);
        self.octets.extend_from_slice(&[0; 3][..pad]);
        Ok(())
    }

    /// Writes variable-length opaque data.
    pub fn write_opaque(&mut self, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len()).map_err(|_| Error::Truncation)?;
        self.reserve(4 + data.len() + padding(data.len()))?;
        self.write_u32(len)?;
        self.write_fixed(data)
    }

    /// Writes a string.
    pub fn write_string(&mut self, s: &str) -> Result<()> {
        self.write_opaque(s.as_bytes())
    }

    /// Writes any [`Encode`] value. If encoding fails partway through,
    /// the partial output is discarded.
    pub fn write<T: Encode + ?Sized>(&mut self, value: &T) -> Result<()> {
        let start = self.octets.len();
        value.encode(self).map_err(|e| {
            self.octets.truncate(start);
            e
        })
    }

    /// Checks that `len` more octets fit within the limit.
    fn reserve(&self, len: usize) -> Result<()> {
        if self.octets.len() + len > self.limit {
            Err(Error::Truncation)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xdr::Reader;

    #[test]
    fn writer_pads_opaque_data() {
        let mut writer = Writer::new(64);
        writer.write_opaque(b"abcde").unwrap();
        assert_eq!(
            writer.octets(),
            &[0, 0, 0, 5, b'a', b'b', b'c', b'd', b'e', 0, 0, 0]
        );
    }

    #[test]
    fn writer_enforces_limit_without_partial_writes() {
        let mut writer = Writer::new(8);
        writer.write_u32(1).unwrap();
        assert_eq!(writer.write_opaque(b"a"), Err(Error::Truncation));
        assert_eq!(writer.len(), 4);
    }

    #[test]
    fn writer_output_is_readable() {
        let mut writer = Writer::new(64);
        writer.write_i32(-7).unwrap();
        writer.write_bool(false).unwrap();
        writer.write_string("passwd.byname").unwrap();
        let octets = writer.finish();
        let mut reader = Reader::new(&octets);
        assert_eq!(reader.read_i32(), Ok(-7));
        assert_eq!(reader.read_bool(), Ok(false));
        assert_eq!(reader.read_string(64).unwrap(), "passwd.byname");
        assert!(reader.at_end());
    }

    #[test]
    fn writer_take_resets_buffer() {
        let mut writer = Writer::new(8);
        writer.write_u32(1).unwrap();
        writer.write_u32(2).unwrap();
        assert_eq!(writer.take().len(), 8);
        assert!(writer.is_empty());
        writer.write_u32(3).unwrap();
    }
}
