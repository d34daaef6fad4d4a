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

//! The YP server program.

use super::{Stat, XfrStat, MAX_DOMAIN, MAX_MAP, MAX_PEER, MAX_RECORD};
use crate::xdr::{self, Decode, Encode, Reader, Writer};

/// The YP server program number.
pub const PROGRAM: u32 = 100004;

/// The YP server program version.
pub const VERSION: u32 = 2;

////////////////////////////////////////////////////////////////////////
// PROCEDURES AND REQUESTS                                            //
////////////////////////////////////////////////////////////////////////

/// The procedures of the YP server program.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Procedure {
    Null,
    Domain,
    DomainNonack,
    Match,
    First,
    Next,
    Xfr,
    Clear,
    All,
    Master,
    Order,
    Maplist,
    NewXfr,
}

impl Procedure {
    /// Returns the conventional name of the procedure, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Null => "ypproc_null",
            Self::Domain => "ypproc_domain",
            Self::DomainNonack => "ypproc_domain_nonack",
            Self::Match => "ypproc_match",
            Self::First => "ypproc_first",
            Self::Next => "ypproc_next",
            Self::Xfr => "ypproc_xfr",
            Self::Clear => "ypproc_clear",
            Self::All => "ypproc_all",
            Self::Master => "ypproc_master",
            Self::Order => "ypproc_order",
            Self::Maplist => "ypproc_maplist",
            Self::NewXfr => "ypproc_newxfr",
        }
    }
}

impl TryFrom<u32> for Procedure {
    type Error = RequestError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Null),
            1 => Ok(Self::Domain),
            2 => Ok(Self::DomainNonack),
            3 => Ok(Self::Match),
            4 => Ok(Self::First),
            5 => Ok(Self::Next),
            6 => Ok(Self::Xfr),
            7 => Ok(Self::Clear),
            8 => Ok(Self::All),
            9 => Ok(Self::Master),
            10 => Ok(Self::Order),
            11 => Ok(Self::Maplist),
            12 => Ok(Self::NewXfr),
            _ => Err(RequestError::ProcUnavail),
        }
    }
}

impl From<Procedure> for u32 {
    fn from(value: Procedure) -> Self {
        match value {
            Procedure::Null => 0,
            Procedure::Domain => 1,
            Procedure::DomainNonack => 2,
            Procedure::Match => 3,
            Procedure::First => 4,
            Procedure::Next => 5,
            Procedure::Xfr => 6,
            Procedure::Clear => 7,
            Procedure::All => 8,
            Procedure::Master => 9,
            Procedure::Order => 10,
            Procedure::Maplist => 11,
            Procedure::NewXfr => 12,
        }
    }
}

/// A decoded call to the YP server program, with one variant per
/// procedure.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Request {
    Null,
    Domain(String),
    DomainNonack(String),
    Match(ReqKey),
    First(ReqNokey),
    Next(ReqKey),
    /// Both `XFR` and `NEWXFR`; they differ only in how the callback
    /// is identified.
    Xfr(ReqXfr),
    Clear,
    All(ReqNokey),
    Master(ReqNokey),
    Order(ReqNokey),
    Maplist(String),
}

impl Request {
    /// Decodes the arguments of a call to `procedure`. The reader must
    /// be positioned after the RPC call header.
    pub fn decode(procedure: u32, reader: &mut Reader) -> Result<Self, RequestError> {
        let request = match Procedure::try_from(procedure)? {
            Procedure::Null => Self::Null,
            Procedure::Domain => Self::Domain(reader.read_string(MAX_DOMAIN)?),
            Procedure::DomainNonack => Self::DomainNonack(reader.read_string(MAX_DOMAIN)?),
            Procedure::Match => Self::Match(ReqKey::decode(reader)?),
            Procedure::First => Self::First(ReqNokey::decode(reader)?),
            Procedure::Next => Self::Next(ReqKey::decode(reader)?),
            Procedure::Xfr => Self::Xfr(ReqXfr::decode_with(reader, false)?),
            Procedure::Clear => Self::Clear,
            Procedure::All => Self::All(ReqNokey::decode(reader)?),
            Procedure::Master => Self::Master(ReqNokey::decode(reader)?),
            Procedure::Order => Self::Order(ReqNokey::decode(reader)?),
            Procedure::Maplist => Self::Maplist(reader.read_string(MAX_DOMAIN)?),
            Procedure::NewXfr => Self::Xfr(ReqXfr::decode_with(reader, true)?),
        };
        Ok(request)
    }

    /// Returns the procedure this request calls.
    pub fn procedure(&self) -> Procedure {
        match self {
            Self::Null => Procedure::Null,
            Self::Domain(_) => Procedure::Domain,
            Self::DomainNonack(_) => Procedure::DomainNonack,
            Self::Match(_) => Procedure::Match,
            Self::First(_) => Procedure::First,
            Self::Next(_) => Procedure::Next,
            Self::Xfr(req) => match req.callback {
                XfrCallback::Port(_) => Procedure::Xfr,
                XfrCallback::Name(_) => Procedure::NewXfr,
            },
            Self::Clear => Procedure::Clear,
            Self::All(_) => Procedure::All,
            Self::Master(_) => Procedure::Master,
            Self::Order(_) => Procedure::Order,
            Self::Maplist(_) => Procedure::Maplist,
        }
    }
}

impl Encode for Request {
    fn encode(&self, writer: &mut Writer) -> xdr::Result<()> {
        match self {
            Self::Null | Self::Clear => Ok(()),
            Self::Domain(domain) | Self::DomainNonack(domain) | Self::Maplist(domain) => {
                writer.write_string(domain)
            }
            Self::Match(req) | Self::Next(req) => req.encode(writer),
            Self::First(req) | Self::All(req) | Self::Master(req) | Self::Order(req) => {
                req.encode(writer)
            }
            Self::Xfr(req) => req.encode(writer),
        }
    }
}

/// Arguments naming a map and a key (`ypreq_key`).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReqKey {
    pub domain: String,
    pub map: String,
    pub key: Vec<u8>,
}

impl Decode for ReqKey {
    fn decode(reader: &mut Reader) -> xdr::Result<Self> {
        Ok(Self {
            domain: reader.read_string(MAX_DOMAIN)?,
            map: reader.read_string(MAX_MAP)?,
            key: reader.read_opaque(MAX_RECORD)?.to_vec(),
        })
    }
}

impl Encode for ReqKey {
    fn encode(&self, writer: &mut Writer) -> xdr::Result<()> {
        writer.write_string(&self.domain)?;
        writer.write_string(&self.map)?;
        writer.write_opaque(&self.key)
    }
}

/// Arguments naming a map (`ypreq_nokey`).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReqNokey {
    pub domain: String,
    pub map: String,
}

impl Decode for ReqNokey {
    fn decode(reader: &mut Reader) -> xdr::Result<Self> {
        Ok(Self {
            domain: reader.read_string(MAX_DOMAIN)?,
            map: reader.read_string(MAX_MAP)?,
        })
    }
}

impl Encode for ReqNokey {
    fn encode(&self, writer: &mut Writer) -> xdr::Result<()> {
        writer.write_string(&self.domain)?;
        writer.write_string(&self.map)
    }
}

/// Identifies a map and the host that claims to own it
/// (`ypmap_parms`).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MapParms {
    pub domain: String,
    pub map: String,
    pub ordernum: u32,
    pub owner: String,
}

impl Decode for MapParms {
    fn decode(reader: &mut Reader) -> xdr::Result<Self> {
        Ok(Self {
            domain: reader.read_string(MAX_DOMAIN)?,
            map: reader.read_string(MAX_MAP)?,
            ordernum: reader.read_u32()?,
            owner: reader.read_string(MAX_PEER)?,
        })
    }
}

impl Encode for MapParms {
    fn encode(&self, writer: &mut Writer) -> xdr::Result<()> {
        writer.write_string(&self.domain)?;
        writer.write_string(&self.map)?;
        writer.write_u32(self.ordernum)?;
        writer.write_string(&self.owner)
    }
}

/// A request that the server pull a new copy of a map (`ypreq_xfr`
/// and `ypreq_newxfr`).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReqXfr {
    pub map_parms: MapParms,
    pub transid: u32,
    /// The program number of the requester's callback service.
    pub prog: u32,
    pub callback: XfrCallback,
}

/// How the requester of a transfer can be reached for the callback.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum XfrCallback {
    /// A port on the requester's address (`XFR`).
    Port(u32),
    /// A host name (`NEWXFR`).
    Name(String),
}

impl ReqXfr {
    fn decode_with(reader: &mut Reader, newxfr: bool) -> xdr::Result<Self> {
        let map_parms = MapParms::decode(reader)?;
        let transid = reader.read_u32()?;
        let prog = reader.read_u32()?;
        let callback = if newxfr {
            XfrCallback::Name(reader.read_string(MAX_PEER)?)
        } else {
            XfrCallback::Port(reader.read_u32()?)
        };
        Ok(Self {
            map_parms,
            transid,
            prog,
            callback,
        })
    }
}

impl Encode for ReqXfr {
    fn encode(&self, writer: &mut Writer) -> xdr::Result<()> {
        self.map_parms.encode(writer)?;
        writer.write_u32(self.transid)?;
        writer.write_u32(self.prog)?;
        match self.callback {
            XfrCallback::Port(port) => writer.write_u32(port),
            XfrCallback::Name(ref name) => writer.write_string(name),
        }
    }
}

////////////////////////////////////////////////////////////////////////
// RESULTS                                                            //
////////////////////////////////////////////////////////////////////////

/// The result of `MATCH` (`ypresp_val`).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RespVal {
    pub stat: Stat,
    pub val: Vec<u8>,
}

impl RespVal {
    /// Creates a result carrying only a status.
    pub fn status(stat: Stat) -> Self {
        Self {
            stat,
            val: Vec::new(),
        }
    }
}

impl Decode for RespVal {
    fn decode(reader: &mut Reader) -> xdr::Result<Self> {
        Ok(Self {
            stat: Stat::decode(reader)?,
            val: reader.read_opaque(MAX_RECORD)?.to_vec(),
        })
    }
}

impl Encode for RespVal {
    fn encode(&self, writer: &mut Writer) -> xdr::Result<()> {
        self.stat.encode(writer)?;
        writer.write_opaque(&self.val)
    }
}

/// The result of `FIRST` and `NEXT`, and each entry of `ALL`
/// (`ypresp_key_val`). Note that the value precedes the key on the
/// wire.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RespKeyVal {
    pub stat: Stat,
    pub key: Vec<u8>,
    pub val: Vec<u8>,
}

impl RespKeyVal {
    /// Creates a result carrying only a status.
    pub fn status(stat: Stat) -> Self {
        Self {
            stat,
            key: Vec::new(),
            val: Vec::new(),
        }
    }
}

impl Decode for RespKeyVal {
    fn decode(reader: &mut Reader) -> xdr::Result<Self> {
        let stat = Stat::decode(reader)?;
        let val = reader.read_opaque(MAX_RECORD)?.to_vec();
        let key = reader.read_opaque(MAX_RECORD)?.to_vec();
        Ok(Self { stat, key, val })
    }
}

impl Encode for RespKeyVal {
    fn encode(&self, writer: &mut Writer) -> xdr::Result<()> {
        self.stat.encode(writer)?;
        writer.write_opaque(&self.val)?;
        writer.write_opaque(&self.key)
    }
}

/// The result of `MASTER` (`ypresp_master`).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RespMaster {
    pub stat: Stat,
    pub peer: String,
}

impl Decode for RespMaster {
    fn decode(reader: &mut Reader) -> xdr::Result<Self> {
        Ok(Self {
            stat: Stat::decode(reader)?,
            peer: reader.read_string(MAX_PEER)?,
        })
    }
}

impl Encode for RespMaster {
    fn encode(&self, writer: &mut Writer) -> xdr::Result<()> {
        self.stat.encode(writer)?;
        writer.write_string(&self.peer)
    }
}

/// The result of `ORDER` (`ypresp_order`).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RespOrder {
    pub stat: Stat,
    pub ordernum: u32,
}

impl Decode for RespOrder {
    fn decode(reader: &mut Reader) -> xdr::Result<Self> {
        Ok(Self {
            stat: Stat::decode(reader)?,
            ordernum: reader.read_u32()?,
        })
    }
}

impl Encode for RespOrder {
    fn encode(&self, writer: &mut Writer) -> xdr::Result<()> {
        self.stat.encode(writer)?;
        writer.write_u32(self.ordernum)
    }
}

/// The result of `MAPLIST` (`ypresp_maplist`). The map names are
/// encoded as an XDR linked list.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RespMaplist {
    pub stat: Stat,
    pub maps: Vec<String>,
}

impl Decode for RespMaplist {
    fn decode(reader: &mut Reader) -> xdr::Result<Self> {
        let stat = Stat::decode(reader)?;
        let mut maps = Vec::new();
        while reader.read_bool()? {
            maps.push(reader.read_string(MAX_MAP)?);
        }
        Ok(Self { stat, maps })
    }
}

impl Encode for RespMaplist {
    fn encode(&self, writer: &mut Writer) -> xdr::Result<()> {
        self.stat.encode(writer)?;
        for map in &self.maps {
            writer.write_bool(true)?;
            writer.write_string(map)?;
        }
        writer.write_bool(false)
    }
}

/// The result of `XFR` and `NEWXFR` (`ypresp_xfr`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RespXfr {
    pub transid: u32,
    pub xfrstat: XfrStat,
}

impl Decode for RespXfr {
    fn decode(reader: &mut Reader) -> xdr::Result<Self> {
        Ok(Self {
            transid: reader.read_u32()?,
            xfrstat: XfrStat::decode(reader)?,
        })
    }
}

impl Encode for RespXfr {
    fn encode(&self, writer: &mut Writer) -> xdr::Result<()> {
        writer.write_u32(self.transid)?;
        self.xfrstat.encode(writer)
    }
}

/// One item of the `ALL` result stream (`ypresp_all`). The stream is a
/// sequence of [`AllItem::Entry`] items terminated by one
/// [`AllItem::End`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AllItem {
    Entry(RespKeyVal),
    End,
}

impl Decode for AllItem {
    fn decode(reader: &mut Reader) -> xdr::Result<Self> {
        if reader.read_bool()? {
            RespKeyVal::decode(reader).map(Self::Entry)
        } else {
            Ok(Self::End)
        }
    }
}

impl Encode for AllItem {
    fn encode(&self, writer: &mut Writer) -> xdr::Result<()> {
        match self {
            Self::Entry(key_val) => {
                writer.write_bool(true)?;
                key_val.encode(writer)
            }
            Self::End => writer.write_bool(false),
        }
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error encountered while decoding a call to the YP server
/// program. These map onto RPC accept statuses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestError {
    /// The procedure number is not part of the program.
    ProcUnavail,

    /// The arguments could not be decoded.
    GarbageArgs(xdr::Error),
}

impl From<xdr::Error> for RequestError {
    fn from(err: xdr::Error) -> Self {
        Self::GarbageArgs(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_val_puts_value_before_key() {
        let resp = RespKeyVal {
            stat: Stat::True,
            key: b"alice".to_vec(),
            val: b"100:200".to_vec(),
        };
        let mut writer = Writer::new(1024);
        resp.encode(&mut writer).unwrap();
        let octets = writer.finish();
        let mut reader = Reader::new(&octets);
        assert_eq!(reader.read_i32(), Ok(1));
        assert_eq!(reader.read_opaque(64), Ok(&b"100:200"[..]));
        assert_eq!(reader.read_opaque(64), Ok(&b"alice"[..]));
    }

    #[test]
    fn maplist_is_a_linked_list() {
        let resp = RespMaplist {
            stat: Stat::True,
            maps: vec!["hosts.byname".to_owned(), "passwd.byname".to_owned()],
        };
        let mut writer = Writer::new(1024);
        resp.encode(&mut writer).unwrap();
        let octets = writer.finish();
        let mut reader = Reader::new(&octets);
        assert_eq!(reader.read_i32(), Ok(1));
        assert_eq!(reader.read_bool(), Ok(true));
        assert_eq!(reader.read_string(64).unwrap(), "hosts.byname");
        assert_eq!(reader.read_bool(), Ok(true));
        assert_eq!(reader.read_string(64).unwrap(), "passwd.byname");
        assert_eq!(reader.read_bool(), Ok(false));
        assert!(reader.at_end());
    }

    #[test]
    fn newxfr_decodes_a_callback_name() {
        let request = Request::Xfr(ReqXfr {
            map_parms: MapParms {
                domain: "example".to_owned(),
                map: "hosts.byname".to_owned(),
                ordernum: 1700000000,
                owner: "master".to_owned(),
            },
            transid: 42,
            prog: 0x4000_0001,
            callback: XfrCallback::Name("pusher".to_owned()),
        });
        assert_eq!(request.procedure(), Procedure::NewXfr);
        let mut writer = Writer::new(1024);
        request.encode(&mut writer).unwrap();
        let octets = writer.finish();
        let decoded = Request::decode(12, &mut Reader::new(&octets)).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn unknown_procedures_are_unavailable() {
        assert_eq!(
            Request::decode(13, &mut Reader::new(&[])),
            Err(RequestError::ProcUnavail)
        );
    }

    #[test]
    fn truncated_arguments_are_garbage() {
        let octets = [0, 0, 0, 7, b'e', b'x'];
        assert_eq!(
            Request::decode(1, &mut Reader::new(&octets)),
            Err(RequestError::GarbageArgs(xdr::Error::UnexpectedEnd))
        );
    }
}
