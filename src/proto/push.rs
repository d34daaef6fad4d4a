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

//! The push callback program.
//!
//! A coordinator asking a replica to pull a map registers a transient
//! callback program under a number from the range reserved for
//! transient programs. When the replica's transfer finishes, its
//! transfer client calls `XFRRESP` on that program to report the
//! outcome.

use std::ops::RangeInclusive;

use super::XfrStat;
use crate::xdr::{self, Decode, Encode, Reader, Writer};

/// The program numbers available for transient callback programs.
pub const TRANSIENT_PROGRAMS: RangeInclusive<u32> = 0x4000_0000..=0x5fff_ffff;

/// The callback program version.
pub const VERSION: u32 = 1;

/// The `NULL` procedure.
pub const PROC_NULL: u32 = 0;

/// The `XFRRESP` procedure.
pub const PROC_XFRRESP: u32 = 1;

/// The arguments of `XFRRESP` (`yppushresp_xfr`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct XfrResp {
    pub transid: u32,
    pub status: XfrStat,
}

impl Decode for XfrResp {
    fn decode(reader: &mut Reader) -> xdr::Result<Self> {
        Ok(Self {
            transid: reader.read_u32()?,
            status: XfrStat::decode(reader)?,
        })
    }
}

impl Encode for XfrResp {
    fn encode(&self, writer: &mut Writer) -> xdr::Result<()> {
        writer.write_u32(self.transid)?;
        self.status.encode(writer)
    }
}
