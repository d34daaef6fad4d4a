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

//! Implementation of the [`Reader`] type to read XDR data.

use super::{padding, Error, Result, UNIT};

/// A cursor over a buffer of XDR-encoded data.
///
/// Every read method is atomic: if it fails, the cursor is left where
/// it was.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reader<'a> {
    octets: &'a [u8],
    cursor: usize,
}

impl<'a> Reader<'a> {
    /// Creates a new `Reader` positioned at the start of `octets`.
    pub fn new(octets: &'a [u8]) -> Self {
        Self { octets, cursor: 0 }
    }

    /// Returns the number of octets not yet read.
    pub fn remaining(&self) -> usize {
        self.octets.len() - self.cursor
    }

    /// Returns whether all of the data has been read.
    pub fn at_end(&self) -> bool {
        self.cursor == self.octets.len()
    }

    /// Returns the data after the cursor without consuming it.
    pub fn rest(&self) -> &'a [u8] {
        &self.octets[self.cursor..]
    }

    /// Reads an unsigned 32-bit integer.
    pub fn read_u32(&mut self) -> Result<u32> {
        let unit = self.peek_fixed(UNIT)?;
        let value = u32::from_be_bytes([unit[0], unit[1], unit[2], unit[3]]);
        self.cursor += UNIT;
        Ok(value)
    }

    /// Reads a signed 32-bit integer. XDR enumerations are encoded
    /// this way.
    pub fn read_i32(&mut self) -> Result<i32> {
        self.read_u32().map(|v| v as i32)
    }

    /// Reads a boolean. Values other than 0 and 1 are rejected.
    pub fn read_bool(&mut self) -> Result<bool> {
        let start = self.cursor;
        match self.read_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => {
                self.cursor = start;
                Err(Error::InvalidBool(other))
            }
        }
    }

    /// Reads fixed-length opaque data of `len` octets (plus padding).
    pub fn read_fixed(&mut self, len: usize) -> Result<&'a [u8]> {
        let padded = len + padding(len);
        self.peek_fixed(padded)?;
        let data = &self.octets[self.cursor..self.cursor + len];
        self.cursor += padded;
        Ok(data)
    }

    /// Reads variable-length opaque data whose length may not exceed
    /// `max`.
    pub fn read_opaque(&mut self, max: usize) -> Result<&'a [u8]> {
        let start = self.cursor;
        let len = self.read_u32()? as usize;
        if len > max {
            self.cursor = start;
            return Err(Error::TooLong { len, max });
        }
        self.read_fixed(len).map_err(|e| {
            self.cursor = start;
            e
        })
    }

    /// Reads a string whose length may not exceed `max`.
    pub fn read_string(&mut self, max: usize) -> Result<String> {
        let start = self.cursor;
        let octets = self.read_opaque(max)?;
        match std::str::from_utf8(octets) {
            Ok(s) => Ok(s.to_owned()),
            Err(_) => {
                self.cursor = start;
                Err(Error::InvalidString)
            }
        }
    }

    /// Skips `len` octets of fixed-length data (plus padding).
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.read_fixed(len).map(|_| ())
    }

    /// Returns the next `len` octets without consuming them.
    fn peek_fixed(&self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            Err(Error::UnexpectedEnd)
        } else {
            Ok(&self.octets[self.cursor..self.cursor + len])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_reads_primitives() {
        let data = [
            0, 0, 0, 7, // u32
            0xff, 0xff, 0xff, 0xfe, // i32 -2
            0, 0, 0, 1, // true
            0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o', 0, 0, 0, // string
        ];
        let mut reader = Reader::new(&data);
        assert_eq!(reader.read_u32(), Ok(7));
        assert_eq!(reader.read_i32(), Ok(-2));
        assert_eq!(reader.read_bool(), Ok(true));
        assert_eq!(reader.read_string(64).unwrap(), "hello");
        assert!(reader.at_end());
    }

    #[test]
    fn reader_rejects_bad_bools_atomically() {
        let data = [0, 0, 0, 2];
        let mut reader = Reader::new(&data);
        assert_eq!(reader.read_bool(), Err(Error::InvalidBool(2)));
        assert_eq!(reader.remaining(), 4);
    }

    #[test]
    fn reader_enforces_length_limits() {
        let data = [0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o', 0, 0, 0];
        let mut reader = Reader::new(&data);
        assert_eq!(reader.read_opaque(4), Err(Error::TooLong { len: 5, max: 4 }));
        assert_eq!(reader.remaining(), data.len());
    }

    #[test]
    fn reader_detects_truncated_opaque_data() {
        // The padding is missing.
        let data = [0, 0, 0, 2, b'h', b'i'];
        let mut reader = Reader::new(&data);
        assert_eq!(reader.read_opaque(64), Err(Error::UnexpectedEnd));
        assert_eq!(reader.remaining(), data.len());
    }

    #[test]
    fn reader_rejects_invalid_utf8() {
        let data = [0, 0, 0, 1, 0xff, 0, 0, 0];
        let mut reader = Reader::new(&data);
        assert_eq!(reader.read_string(64), Err(Error::InvalidString));
    }
}
