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

//! The map file transfer program.
//!
//! A replica pulling a map may ask the master for the map's database
//! file as a whole rather than record by record. The reply to
//! `GETMAP` is a stream of [`XfrRecord`]s: blocks of file data
//! terminated by exactly one status record.

use std::fmt;

use super::{MAX_DOMAIN, MAX_MAP};
use crate::xdr::{self, Decode, Encode, Reader, Writer};

/// The file transfer program number.
pub const PROGRAM: u32 = 600100069;

/// The file transfer program version.
pub const VERSION: u32 = 1;

/// The `NULL` procedure.
pub const PROC_NULL: u32 = 0;

/// The `GETMAP` procedure.
pub const PROC_GETMAP: u32 = 1;

/// The size of each data block in a transfer.
pub const BLOCK_SIZE: usize = 32767;

/// The maximum length of a requested file name.
pub const MAX_FILENAME: usize = 1024;

////////////////////////////////////////////////////////////////////////
// DATABASE TYPE AND BYTE ORDER TAGS                                  //
////////////////////////////////////////////////////////////////////////

/// The kind of database file a replica expects to receive
/// (`xfr_db_type`).
///
/// This is a wrapper around the wire value, with constants for the
/// defined tags; unknown values are carried through unchanged.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct DbType(u32);

impl DbType {
    pub const ASCII: Self = Self(1);
    pub const BSD_HASH: Self = Self(2);
    pub const BSD_BTREE: Self = Self(3);
    pub const BSD_RECNO: Self = Self(4);
    pub const BSD_MPOOL: Self = Self(5);
    pub const BSD_NDBM: Self = Self(6);
    pub const GNU_GDBM: Self = Self(7);
    pub const DBM: Self = Self(8);
    pub const NDBM: Self = Self(9);
    pub const OPAQUE: Self = Self(10);
    pub const ANY: Self = Self(11);
    pub const UNKNOWN: Self = Self(12);
    pub const GNU_GDBM64: Self = Self(13);
}

impl From<u32> for DbType {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<DbType> for u32 {
    fn from(value: DbType) -> Self {
        value.0
    }
}

impl fmt::Debug for DbType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            Self::ASCII => "ASCII",
            Self::BSD_HASH => "BSD_HASH",
            Self::BSD_BTREE => "BSD_BTREE",
            Self::BSD_RECNO => "BSD_RECNO",
            Self::BSD_MPOOL => "BSD_MPOOL",
            Self::BSD_NDBM => "BSD_NDBM",
            Self::GNU_GDBM => "GNU_GDBM",
            Self::DBM => "DBM",
            Self::NDBM => "NDBM",
            Self::OPAQUE => "OPAQUE",
            Self::ANY => "ANY",
            Self::UNKNOWN => "UNKNOWN",
            Self::GNU_GDBM64 => "GNU_GDBM64",
            _ => return write!(f, "DbType({})", self.0),
        };
        f.write_str(name)
    }
}

/// The byte order of the database file a replica expects to receive
/// (`xfr_byte_order`).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ByteOrder {
    Big,
    Little,
    Any,
}

impl ByteOrder {
    /// Returns the byte order of the host.
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }
}

impl TryFrom<u32> for ByteOrder {
    type Error = xdr::Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Big),
            2 => Ok(Self::Little),
            3 => Ok(Self::Any),
            _ => Err(xdr::Error::InvalidEnum(value as i32)),
        }
    }
}

impl From<ByteOrder> for u32 {
    fn from(value: ByteOrder) -> Self {
        match value {
            ByteOrder::Big => 1,
            ByteOrder::Little => 2,
            ByteOrder::Any => 3,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TRANSFER STATUS                                                    //
////////////////////////////////////////////////////////////////////////

/// The status carried by the terminating record of a transfer
/// (`xfrstat`).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Status {
    RequestOk,
    Denied,
    NoFile,
    Access,
    BadDb,
    ReadOk,
    ReadErr,
    Done,
    EndianMismatch,
    TypeMismatch,
}

impl TryFrom<i32> for Status {
    type Error = xdr::Error;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::RequestOk),
            2 => Ok(Self::Denied),
            3 => Ok(Self::NoFile),
            4 => Ok(Self::Access),
            5 => Ok(Self::BadDb),
            6 => Ok(Self::ReadOk),
            7 => Ok(Self::ReadErr),
            8 => Ok(Self::Done),
            9 => Ok(Self::EndianMismatch),
            10 => Ok(Self::TypeMismatch),
            _ => Err(xdr::Error::InvalidEnum(value)),
        }
    }
}

impl From<Status> for i32 {
    fn from(value: Status) -> Self {
        match value {
            Status::RequestOk => 1,
            Status::Denied => 2,
            Status::NoFile => 3,
            Status::Access => 4,
            Status::BadDb => 5,
            Status::ReadOk => 6,
            Status::ReadErr => 7,
            Status::Done => 8,
            Status::EndianMismatch => 9,
            Status::TypeMismatch => 10,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// REQUESTS AND RESULTS                                               //
////////////////////////////////////////////////////////////////////////

/// The arguments of `GETMAP` (`ypxfr_mapname`).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MapName {
    pub map: String,
    pub domain: String,
    pub filename: String,
    pub db_type: DbType,
    pub byte_order: ByteOrder,
}

impl Decode for MapName {
    fn decode(reader: &mut Reader) -> xdr::Result<Self> {
        Ok(Self {
            map: reader.read_string(MAX_MAP)?,
            domain: reader.read_string(MAX_DOMAIN)?,
            filename: reader.read_string(MAX_FILENAME)?,
            db_type: reader.read_u32()?.into(),
            byte_order: reader.read_u32()?.try_into()?,
        })
    }
}

impl Encode for MapName {
    fn encode(&self, writer: &mut Writer) -> xdr::Result<()> {
        writer.write_string(&self.map)?;
        writer.write_string(&self.domain)?;
        writer.write_string(&self.filename)?;
        writer.write_u32(self.db_type.into())?;
        writer.write_u32(self.byte_order.into())
    }
}

/// One record of a `GETMAP` result stream (`xfr`).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum XfrRecord {
    /// A block of file data (`ok` is true).
    Block(Vec<u8>),
    /// The terminating status (`ok` is false).
    Status(Status),
}

impl Decode for XfrRecord {
    fn decode(reader: &mut Reader) -> xdr::Result<Self> {
        if reader.read_bool()? {
            Ok(Self::Block(reader.read_opaque(BLOCK_SIZE)?.to_vec()))
        } else {
            Ok(Self::Status(reader.read_i32()?.try_into()?))
        }
    }
}

impl Encode for XfrRecord {
    fn encode(&self, writer: &mut Writer) -> xdr::Result<()> {
        match self {
            Self::Block(data) => {
                writer.write_bool(true)?;
                writer.write_opaque(data)
            }
            Self::Status(status) => {
                writer.write_bool(false)?;
                writer.write_i32((*status).into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapname_rejects_unknown_byte_orders() {
        let mut writer = Writer::new(1024);
        writer.write_string("hosts.byname").unwrap();
        writer.write_string("example").unwrap();
        writer.write_string("hosts.byname").unwrap();
        writer.write_u32(11).unwrap();
        writer.write_u32(4).unwrap();
        let octets = writer.finish();
        assert_eq!(
            MapName::decode(&mut Reader::new(&octets)),
            Err(xdr::Error::InvalidEnum(4))
        );
    }

    #[test]
    fn status_records_are_not_ok() {
        let mut writer = Writer::new(64);
        XfrRecord::Status(Status::Done).encode(&mut writer).unwrap();
        assert_eq!(writer.octets(), &[0, 0, 0, 0, 0, 0, 0, 8]);
    }

    #[test]
    fn db_type_debug_names_known_tags() {
        assert_eq!(format!("{:?}", DbType::OPAQUE), "OPAQUE");
        assert_eq!(format!("{:?}", DbType::from(99)), "DbType(99)");
    }
}
