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

//! Reading and writing XDR-encoded data.
//!
//! [RFC 4506] defines the External Data Representation used by every
//! program in the YP protocol suite. All quantities are encoded in
//! big-endian units of four octets; variable-length byte strings are
//! prefixed with their length and padded with zero octets to the next
//! four-octet boundary.
//!
//! The [`Reader`] and [`Writer`] types implement the primitive XDR
//! types. Compound protocol types implement [`Decode`] and [`Encode`]
//! on top of them (see [`crate::proto`]).
//!
//! [RFC 4506]: https://datatracker.ietf.org/doc/html/rfc4506

use std::fmt;

mod reader;
mod writer;

pub use reader::Reader;
pub use writer::Writer;

/// The size of an XDR unit in octets.
pub const UNIT: usize = 4;

/// Returns the number of zero octets needed to pad `len` octets to the
/// next XDR unit boundary.
pub fn padding(len: usize) -> usize {
    (UNIT - len % UNIT) % UNIT
}

/// A type that can be read from XDR-encoded data.
pub trait Decode: Sized {
    fn decode(reader: &mut Reader) -> Result<Self>;
}

/// A type that can be written as XDR-encoded data.
pub trait Encode {
    fn encode(&self, writer: &mut Writer) -> Result<()>;
}

/// The XDR `void` type, which encodes as nothing.
impl Encode for () {
    fn encode(&self, _writer: &mut Writer) -> Result<()> {
        Ok(())
    }
}

impl Decode for () {
    fn decode(_reader: &mut Reader) -> Result<Self> {
        Ok(())
    }
}

impl Decode for u32 {
    fn decode(reader: &mut Reader) -> Result<Self> {
        reader.read_u32()
    }
}

impl Encode for u32 {
    fn encode(&self, writer: &mut Writer) -> Result<()> {
        writer.write_u32(*self)
    }
}

impl Decode for bool {
    fn decode(reader: &mut Reader) -> Result<Self> {
        reader.read_bool()
    }
}

impl Encode for bool {
    fn encode(&self, writer: &mut Writer) -> Result<()> {
        writer.write_bool(*self)
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error encountered while reading or writing XDR data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// The data ended before the item being read was complete.
    UnexpectedEnd,

    /// A variable-length item declared a length greater than the limit
    /// imposed by the protocol.
    TooLong { len: usize, max: usize },

    /// A boolean was encoded as something other than 0 or 1.
    InvalidBool(u32),

    /// A string was not valid UTF-8.
    InvalidString,

    /// A value of an enumerated type was not recognized.
    InvalidEnum(i32),

    /// Writing would exceed the size limit of the [`Writer`].
    Truncation,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnexpectedEnd => f.write_str("unexpected end of XDR data"),
            Self::TooLong { len, max } => {
                write!(f, "item length {} exceeds the maximum of {}", len, max)
            }
            Self::InvalidBool(value) => write!(f, "{} is not a valid XDR boolean", value),
            Self::InvalidString => f.write_str("string is not valid UTF-8"),
            Self::InvalidEnum(value) => write!(f, "{} is not a recognized enumeration value", value),
            Self::Truncation => f.write_str("the message size limit was exceeded"),
        }
    }
}

impl std::error::Error for Error {}

/// The result type for XDR operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_works() {
        assert_eq!(padding(0), 0);
        assert_eq!(padding(1), 3);
        assert_eq!(padding(2), 2);
        assert_eq!(padding(3), 1);
        assert_eq!(padding(4), 0);
        assert_eq!(padding(9), 3);
    }
}
