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

//! Procedure, argument, and result types of the YP protocol suite.
//!
//! Three RPC programs are implemented by this crate:
//!
//! * the YP server program (see [`yp`]), which answers lookups;
//! * the map file transfer program (see [`xfrd`]), which streams whole
//!   map files to replicas; and
//! * the push callback program (see [`push`]), through which a replica
//!   reports the outcome of a transfer to the coordinator that asked
//!   for it.
//!
//! The status enumerations shared between them live here.

use std::fmt;

use crate::xdr::{self, Decode, Encode, Reader, Writer};

pub mod push;
pub mod xfrd;
pub mod yp;

/// The maximum length of a domain name.
pub const MAX_DOMAIN: usize = 64;

/// The maximum length of a map name.
pub const MAX_MAP: usize = 64;

/// The maximum length of a host name in a map's master record.
pub const MAX_PEER: usize = 64;

/// The maximum length of a key or value.
pub const MAX_RECORD: usize = 16 * 1024 * 1024;

////////////////////////////////////////////////////////////////////////
// YP STATUS                                                          //
////////////////////////////////////////////////////////////////////////

/// The status of a YP server procedure (`ypstat`).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Stat {
    True,
    NoMore,
    False,
    NoMap,
    NoDom,
    NoKey,
    BadOp,
    BadDb,
    YpErr,
    BadArgs,
    Vers,
}

impl TryFrom<i32> for Stat {
    type Error = xdr::Error;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::True),
            2 => Ok(Self::NoMore),
            0 => Ok(Self::False),
            -1 => Ok(Self::NoMap),
            -2 => Ok(Self::NoDom),
            -3 => Ok(Self::NoKey),
            -4 => Ok(Self::BadOp),
            -5 => Ok(Self::BadDb),
            -6 => Ok(Self::YpErr),
            -7 => Ok(Self::BadArgs),
            -8 => Ok(Self::Vers),
            _ => Err(xdr::Error::InvalidEnum(value)),
        }
    }
}

impl From<Stat> for i32 {
    fn from(value: Stat) -> Self {
        match value {
            Stat::True => 1,
            Stat::NoMore => 2,
            Stat::False => 0,
            Stat::NoMap => -1,
            Stat::NoDom => -2,
            Stat::NoKey => -3,
            Stat::BadOp => -4,
            Stat::BadDb => -5,
            Stat::YpErr => -6,
            Stat::BadArgs => -7,
            Stat::Vers => -8,
        }
    }
}

impl Decode for Stat {
    fn decode(reader: &mut Reader) -> xdr::Result<Self> {
        reader.read_i32()?.try_into()
    }
}

impl Encode for Stat {
    fn encode(&self, writer: &mut Writer) -> xdr::Result<()> {
        writer.write_i32((*self).into())
    }
}

////////////////////////////////////////////////////////////////////////
// TRANSFER STATUS                                                    //
////////////////////////////////////////////////////////////////////////

/// The status of a map transfer (`ypxfrstat`). The same numbering is
/// used for the result a replica reports to the push coordinator,
/// which adds [`XfrStat::NoAlias`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum XfrStat {
    Succ,
    Age,
    NoMap,
    NoDom,
    Rsrc,
    Rpc,
    MAddr,
    YpErr,
    BadArgs,
    Dbm,
    File,
    Skew,
    Clear,
    Force,
    XfrErr,
    Refused,
    NoAlias,
}

impl XfrStat {
    /// Returns a human-readable description of the status.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Succ => "Success",
            Self::Age => "Master's version not newer",
            Self::NoMap => "Can't find server for map",
            Self::NoDom => "Domain not supported",
            Self::Rsrc => "Local resource alloc failure",
            Self::Rpc => "RPC failure talking to server",
            Self::MAddr => "Can't get master address",
            Self::YpErr => "YP server/map db error",
            Self::BadArgs => "Request arguments bad",
            Self::Dbm => "Local dbm operation failed",
            Self::File => "Local file I/O operation failed",
            Self::Skew => "Map version skew during transfer",
            Self::Clear => "Can't send \"Clear\" req to local ypserv",
            Self::Force => "No local order number in map use -f flag.",
            Self::XfrErr => "ypxfr error",
            Self::Refused => "Transfer request refused by ypserv",
            Self::NoAlias => "Alias not found for map or domain",
        }
    }
}

impl TryFrom<i32> for XfrStat {
    type Error = xdr::Error;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Succ),
            2 => Ok(Self::Age),
            -1 => Ok(Self::NoMap),
            -2 => Ok(Self::NoDom),
            -3 => Ok(Self::Rsrc),
            -4 => Ok(Self::Rpc),
            -5 => Ok(Self::MAddr),
            -6 => Ok(Self::YpErr),
            -7 => Ok(Self::BadArgs),
            -8 => Ok(Self::Dbm),
            -9 => Ok(Self::File),
            -10 => Ok(Self::Skew),
            -11 => Ok(Self::Clear),
            -12 => Ok(Self::Force),
            -13 => Ok(Self::XfrErr),
            -14 => Ok(Self::Refused),
            -15 => Ok(Self::NoAlias),
            _ => Err(xdr::Error::InvalidEnum(value)),
        }
    }
}

impl From<XfrStat> for i32 {
    fn from(value: XfrStat) -> Self {
        match value {
            XfrStat::Succ => 1,
            XfrStat::Age => 2,
            XfrStat::NoMap => -1,
            XfrStat::NoDom => -2,
            XfrStat::Rsrc => -3,
            XfrStat::Rpc => -4,
            XfrStat::MAddr => -5,
            XfrStat::YpErr => -6,
            XfrStat::BadArgs => -7,
            XfrStat::Dbm => -8,
            XfrStat::File => -9,
            XfrStat::Skew => -10,
            XfrStat::Clear => -11,
            XfrStat::Force => -12,
            XfrStat::XfrErr => -13,
            XfrStat::Refused => -14,
            XfrStat::NoAlias => -15,
        }
    }
}

impl fmt::Display for XfrStat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl Decode for XfrStat {
    fn decode(reader: &mut Reader) -> xdr::Result<Self> {
        reader.read_i32()?.try_into()
    }
}

impl Encode for XfrStat {
    fn encode(&self, writer: &mut Writer) -> xdr::Result<()> {
        writer.write_i32((*self).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_uses_wire_values() {
        assert_eq!(i32::from(Stat::NoMore), 2);
        assert_eq!(i32::from(Stat::BadArgs), -7);
        assert_eq!(Stat::try_from(-2), Ok(Stat::NoDom));
        assert_eq!(Stat::try_from(3), Err(xdr::Error::InvalidEnum(3)));
    }

    #[test]
    fn xfrstat_uses_wire_values() {
        assert_eq!(i32::from(XfrStat::Refused), -14);
        assert_eq!(XfrStat::try_from(-15), Ok(XfrStat::NoAlias));
        assert!(XfrStat::try_from(0).is_err());
    }

    #[test]
    fn xfrstat_describes_itself() {
        assert_eq!(XfrStat::Refused.to_string(), "Transfer request refused by ypserv");
    }
}
