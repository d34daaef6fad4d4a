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

//! ONC RPC version 2 message framing.
//!
//! Every YP program speaks [RFC 5531] remote procedure calls. This
//! module reads call headers and writes reply headers for the server
//! side, and does the reverse for the client calls made by the push
//! coordinator. Authentication is limited to `AUTH_NONE`; credentials
//! sent by callers are skipped, since access control is based on the
//! caller's network address.
//!
//! Over TCP, messages are delimited with record marking (see
//! [`record`]). Over UDP, each datagram carries one message.
//!
//! [RFC 5531]: https://datatracker.ietf.org/doc/html/rfc5531

use std::fmt;

use crate::xdr::{self, Reader, Writer};

pub mod record;

/// The RPC protocol version implemented here.
pub const RPC_VERSION: u32 = 2;

const CALL: u32 = 0;
const REPLY: u32 = 1;
const MSG_ACCEPTED: u32 = 0;
const MSG_DENIED: u32 = 1;
const RPC_MISMATCH: u32 = 0;
const AUTH_NONE: u32 = 0;

/// The maximum size of an opaque authentication body.
const MAX_AUTH_BYTES: usize = 400;

////////////////////////////////////////////////////////////////////////
// CALLS                                                              //
////////////////////////////////////////////////////////////////////////

/// The header of an RPC call message. The procedure arguments follow
/// it in the message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CallHeader {
    pub xid: u32,
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
}

impl CallHeader {
    /// Reads a call header, leaving the reader positioned at the start
    /// of the procedure arguments.
    pub fn read(reader: &mut Reader) -> Result<Self, Error> {
        let xid = reader.read_u32()?;
        if reader.read_u32()? != CALL {
            return Err(Error::NotACall);
        }
        if reader.read_u32()? != RPC_VERSION {
            return Err(Error::RpcVersionMismatch { xid });
        }
        let program = reader.read_u32()?;
        let version = reader.read_u32()?;
        let procedure = reader.read_u32()?;

        // Skip the credentials and the verifier.
        for _ in 0..2 {
            let _flavor = reader.read_u32()?;
            reader.read_opaque(MAX_AUTH_BYTES)?;
        }

        Ok(Self {
            xid,
            program,
            version,
            procedure,
        })
    }

    /// Writes a call header with `AUTH_NONE` credentials.
    pub fn write(&self, writer: &mut Writer) -> xdr::Result<()> {
        writer.write_u32(self.xid)?;
        writer.write_u32(CALL)?;
        writer.write_u32(RPC_VERSION)?;
        writer.write_u32(self.program)?;
        writer.write_u32(self.version)?;
        writer.write_u32(self.procedure)?;
        write_null_auth(writer)?;
        write_null_auth(writer)
    }
}

////////////////////////////////////////////////////////////////////////
// REPLIES                                                            //
////////////////////////////////////////////////////////////////////////

/// The status of a call that the server accepted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AcceptStat {
    /// The call succeeded; results follow.
    Success,
    ProgUnavail,
    ProgMismatch { low: u32, high: u32 },
    ProcUnavail,
    GarbageArgs,
    SystemErr,
}

impl AcceptStat {
    fn code(&self) -> u32 {
        match self {
            Self::Success => 0,
            Self::ProgUnavail => 1,
            Self::ProgMismatch { .. } => 2,
            Self::ProcUnavail => 3,
            Self::GarbageArgs => 4,
            Self::SystemErr => 5,
        }
    }
}

/// Writes the header of an accepted reply. For
/// [`AcceptStat::Success`], the caller writes the procedure results
/// afterwards.
pub fn write_accepted_reply(writer: &mut Writer, xid: u32, stat: AcceptStat) -> xdr::Result<()> {
    writer.write_u32(xid)?;
    writer.write_u32(REPLY)?;
    writer.write_u32(MSG_ACCEPTED)?;
    write_null_auth(writer)?;
    writer.write_u32(stat.code())?;
    if let AcceptStat::ProgMismatch { low, high } = stat {
        writer.write_u32(low)?;
        writer.write_u32(high)?;
    }
    Ok(())
}

/// Writes a denied reply for a call using an unsupported RPC version.
pub fn write_rpc_mismatch_reply(writer: &mut Writer, xid: u32) -> xdr::Result<()> {
    writer.write_u32(xid)?;
    writer.write_u32(REPLY)?;
    writer.write_u32(MSG_DENIED)?;
    writer.write_u32(RPC_MISMATCH)?;
    writer.write_u32(RPC_VERSION)?;
    writer.write_u32(RPC_VERSION)
}

/// The outcome of a call as reported by a reply header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Reply {
    Accepted(AcceptStat),
    Denied,
}

/// Reads a reply header, returning the transaction ID and outcome. On
/// [`Reply::Accepted`] with [`AcceptStat::Success`], the reader is left
/// positioned at the start of the results.
pub fn read_reply(reader: &mut Reader) -> Result<(u32, Reply), Error> {
    let xid = reader.read_u32()?;
    if reader.read_u32()? != REPLY {
        return Err(Error::NotAReply);
    }
    match reader.read_u32()? {
        MSG_ACCEPTED => {
            let _flavor = reader.read_u32()?;
            reader.read_opaque(MAX_AUTH_BYTES)?;
            let stat = match reader.read_u32()? {
                0 => AcceptStat::Success,
                1 => AcceptStat::ProgUnavail,
                2 => AcceptStat::ProgMismatch {
                    low: reader.read_u32()?,
                    high: reader.read_u32()?,
                },
                3 => AcceptStat::ProcUnavail,
                4 => AcceptStat::GarbageArgs,
                _ => AcceptStat::SystemErr,
            };
            Ok((xid, Reply::Accepted(stat)))
        }
        MSG_DENIED => Ok((xid, Reply::Denied)),
        other => Err(Error::Xdr(xdr::Error::InvalidEnum(other as i32))),
    }
}

fn write_null_auth(writer: &mut Writer) -> xdr::Result<()> {
    writer.write_u32(AUTH_NONE)?;
    writer.write_opaque(&[])
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error encountered while reading an RPC message header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// The header was malformed.
    Xdr(xdr::Error),

    /// A call was expected, but the message is not one.
    NotACall,

    /// A reply was expected, but the message is not one.
    NotAReply,

    /// The call uses an RPC version other than 2. The caller should be
    /// sent a denied reply.
    RpcVersionMismatch { xid: u32 },
}

impl From<xdr::Error> for Error {
    fn from(err: xdr::Error) -> Self {
        Self::Xdr(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Xdr(err) => write!(f, "malformed RPC header: {}", err),
            Self::NotACall => f.write_str("message is not an RPC call"),
            Self::NotAReply => f.write_str("message is not an RPC reply"),
            Self::RpcVersionMismatch { .. } => f.write_str("unsupported RPC version"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_header_skips_credentials() {
        let mut writer = Writer::new(1024);
        for value in [0x1234, CALL, RPC_VERSION, 100004, 2, 3] {
            writer.write_u32(value).unwrap();
        }
        // AUTH_UNIX-style credentials with an opaque body.
        writer.write_u32(1).unwrap();
        writer.write_opaque(&[1, 2, 3, 4, 5]).unwrap();
        writer.write_u32(AUTH_NONE).unwrap();
        writer.write_opaque(&[]).unwrap();
        writer.write_u32(0xdead).unwrap();

        let octets = writer.finish();
        let mut reader = Reader::new(&octets);
        let header = CallHeader::read(&mut reader).unwrap();
        assert_eq!(
            header,
            CallHeader {
                xid: 0x1234,
                program: 100004,
                version: 2,
                procedure: 3,
            }
        );
        assert_eq!(reader.read_u32(), Ok(0xdead));
    }

    #[test]
    fn call_header_reports_version_mismatch() {
        let mut writer = Writer::new(1024);
        for value in [9, CALL, 3, 100004, 2, 0, 0, 0, 0, 0] {
            writer.write_u32(value).unwrap();
        }
        let octets = writer.finish();
        assert_eq!(
            CallHeader::read(&mut Reader::new(&octets)),
            Err(Error::RpcVersionMismatch { xid: 9 })
        );
    }

    #[test]
    fn written_calls_and_replies_can_be_read_back() {
        let call = CallHeader {
            xid: 77,
            program: 100004,
            version: 2,
            procedure: 12,
        };
        let mut writer = Writer::new(1024);
        call.write(&mut writer).unwrap();
        let octets = writer.finish();
        assert_eq!(CallHeader::read(&mut Reader::new(&octets)), Ok(call));

        let mut writer = Writer::new(1024);
        write_accepted_reply(&mut writer, 77, AcceptStat::ProgMismatch { low: 2, high: 2 })
            .unwrap();
        let octets = writer.finish();
        let mut reader = Reader::new(&octets);
        assert_eq!(
            read_reply(&mut reader),
            Ok((
                77,
                Reply::Accepted(AcceptStat::ProgMismatch { low: 2, high: 2 })
            ))
        );
        assert!(reader.at_end());
    }

    #[test]
    fn rpc_mismatch_reply_is_denied() {
        let mut writer = Writer::new(1024);
        write_rpc_mismatch_reply(&mut writer, 5).unwrap();
        let octets = writer.finish();
        assert_eq!(
            read_reply(&mut Reader::new(&octets)),
            Ok((5, Reply::Denied))
        );
    }
}
