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

//! Streaming the contents of a map for `ALL`.
//!
//! The reply to `ALL` is a sequence of `{more = TRUE, ypresp_key_val}`
//! items, one per user record, terminated by a single
//! `{more = FALSE}`. If the map cannot be served at all, or has no user
//! records, the sequence is a single item carrying the failure status
//! (`NOMORE` for an empty map) followed by the terminator.

use std::io::{self, Write};
use std::sync::Arc;

use log::debug;

use super::{Reply, ReceivedInfo, Server, StreamReply, Transport};
use crate::db::Database;
use crate::proto::yp::{AllItem, Procedure, ReqNokey, RespKeyVal};
use crate::proto::Stat;
use crate::rpc::{self, record::MAX_RECORD_LEN, AcceptStat};
use crate::xdr::Writer;

impl Server {
    pub(super) fn all(&self, xid: u32, req: &ReqNokey, info: ReceivedInfo) -> Reply {
        let records = match info.transport() {
            Transport::Udp => {
                debug!("ypproc_all over UDP from {}", info.source());
                AllRecords::failed(Stat::YpErr)
            }
            Transport::Tcp => match self.serve_map(info, Procedure::All, req, Arc::clone) {
                Ok(map) => AllRecords::new(map),
                Err(stat) => AllRecords::failed(stat),
            },
        };

        let stream = Box::new(AllStream { xid, records });
        if stream.records.is_failed() {
            // Small enough to send as a single reply.
            let mut octets = Vec::new();
            match stream.write_to(&mut octets) {
                Ok(()) => Reply::Single(octets),
                Err(_) => Reply::None,
            }
        } else {
            Reply::Stream(stream)
        }
    }
}

////////////////////////////////////////////////////////////////////////
// RECORD SEQUENCE                                                    //
////////////////////////////////////////////////////////////////////////

/// The items of an `ALL` reply. Once the terminator has been produced,
/// the map is not read again.
pub struct AllRecords<D> {
    map: Option<Arc<D>>,
    state: State,
}

enum State {
    /// Nothing has been produced yet.
    Start,

    /// The record with this key was produced last.
    After(Vec<u8>),

    /// A status item is to be produced, then the terminator.
    Status(Stat),

    /// Only the terminator remains.
    End,

    Done,
}

impl<D: Database> AllRecords<D> {
    /// Creates a sequence of the user records of `map`.
    pub fn new(map: Arc<D>) -> Self {
        Self {
            map: Some(map),
            state: State::Start,
        }
    }

    /// Creates a sequence reporting only `stat`.
    pub fn failed(stat: Stat) -> Self {
        Self {
            map: None,
            state: State::Status(stat),
        }
    }

    fn is_failed(&self) -> bool {
        matches!(self.state, State::Status(_))
    }
}

impl<D: Database> Iterator for AllRecords<D> {
    type Item = AllItem;

    fn next(&mut self) -> Option<AllItem> {
        let found = match std::mem::replace(&mut self.state, State::Done) {
            State::Start => match self.map.as_ref() {
                Some(map) => map.first_user().map(to_entry),
                None => Some(Err(Stat::YpErr)),
            }
            .unwrap_or(Err(Stat::NoMore)),
            State::After(key) => match self.map.as_ref().and_then(|map| map.next_user(&key)) {
                Some(record) => to_entry(record),
                None => return Some(AllItem::End),
            },
            State::Status(stat) => Err(stat),
            State::End => return Some(AllItem::End),
            State::Done => return None,
        };

        match found {
            Ok((key, item)) => {
                self.state = State::After(key);
                Some(item)
            }
            Err(stat) => {
                self.state = State::End;
                Some(AllItem::Entry(RespKeyVal::status(stat)))
            }
        }
    }
}

fn to_entry((key, val): (&[u8], &[u8])) -> Result<(Vec<u8>, AllItem), Stat> {
    let item = AllItem::Entry(RespKeyVal {
        stat: Stat::True,
        key: key.to_vec(),
        val: val.to_vec(),
    });
    Ok((key.to_vec(), item))
}

////////////////////////////////////////////////////////////////////////
// STREAMED REPLY                                                     //
////////////////////////////////////////////////////////////////////////

/// A complete `ALL` reply, written one item at a time.
pub struct AllStream<D> {
    xid: u32,
    records: AllRecords<D>,
}

impl<D> StreamReply for AllStream<D>
where
    D: Database + Send + Sync,
{
    fn write_to(self: Box<Self>, out: &mut dyn Write) -> io::Result<()> {
        let AllStream { xid, records } = *self;
        let mut writer = Writer::new(MAX_RECORD_LEN);
        rpc::write_accepted_reply(&mut writer, xid, AcceptStat::Success).map_err(invalid_data)?;
        for item in records {
            writer.write(&item).map_err(invalid_data)?;
            out.write_all(&writer.take())?;
        }
        Ok(())
    }
}

fn invalid_data(err: crate::xdr::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::FileMap;
    use crate::proto::yp::RespKeyVal;
    use crate::rpc::{read_reply, Reply as RpcReply};
    use crate::server::tests::{call, fixture, tcp_from, DOMAIN};
    use crate::server::Service;
    use crate::xdr::{Decode, Reader};

    fn map(records: &[(&[u8], &[u8])]) -> Arc<FileMap> {
        let mut octets = b"YPDB\0\0\0\x01".to_vec();
        for (key, val) in records {
            octets.extend_from_slice(&(key.len() as u32).to_be_bytes());
            octets.extend_from_slice(key);
            octets.extend_from_slice(&(val.len() as u32).to_be_bytes());
            octets.extend_from_slice(val);
        }
        Arc::new(FileMap::parse(&octets).unwrap())
    }

    fn status_of(item: &AllItem) -> Option<Stat> {
        match item {
            AllItem::Entry(resp) => Some(resp.stat),
            AllItem::End => None,
        }
    }

    #[test]
    fn records_are_followed_by_one_terminator() {
        let records = AllRecords::new(map(&[
            (b"YP_MASTER_NAME", b"host1"),
            (b"alice", b"100:200"),
            (b"bob", b"101:201"),
        ]));
        let items: Vec<_> = records.collect();
        assert_eq!(items.len(), 3);
        assert_eq!(status_of(&items[0]), Some(Stat::True));
        assert_eq!(status_of(&items[1]), Some(Stat::True));
        assert_eq!(items[2], AllItem::End);
    }

    #[test]
    fn map_without_user_records_reports_nomore() {
        let records = AllRecords::new(map(&[(b"YP_MASTER_NAME", b"host1")]));
        let items: Vec<_> = records.collect();
        assert_eq!(
            items,
            [AllItem::Entry(RespKeyVal::status(Stat::NoMore)), AllItem::End]
        );
    }

    #[test]
    fn nothing_follows_the_terminator() {
        let mut records = AllRecords::<FileMap>::failed(Stat::NoMap);
        assert_eq!(
            records.next(),
            Some(AllItem::Entry(RespKeyVal::status(Stat::NoMap)))
        );
        assert_eq!(records.next(), Some(AllItem::End));
        assert_eq!(records.next(), None);
        assert_eq!(records.next(), None);
    }

    fn read_all(reply: Reply) -> Vec<AllItem> {
        let octets = match reply {
            Reply::Single(octets) => octets,
            Reply::Stream(stream) => {
                let mut octets = Vec::new();
                stream.write_to(&mut octets).unwrap();
                octets
            }
            Reply::None => panic!("no reply was sent"),
        };
        let mut reader = Reader::new(&octets);
        assert_eq!(
            read_reply(&mut reader).unwrap(),
            (0x5150, RpcReply::Accepted(AcceptStat::Success))
        );
        let mut items = Vec::new();
        loop {
            let item = AllItem::decode(&mut reader).unwrap();
            let end = item == AllItem::End;
            items.push(item);
            if end {
                break;
            }
        }
        assert!(reader.at_end());
        items
    }

    #[test]
    fn server_streams_whole_maps_over_tcp() {
        let (_dir, maps) = fixture();
        let server = Server::new(maps);
        let req = ReqNokey {
            domain: DOMAIN.to_owned(),
            map: "passwd.byname".to_owned(),
        };
        let reply = server.handle_call(&call(8, &req), tcp_from(700));
        assert!(matches!(reply, Reply::Stream(_)));
        let items = read_all(reply);
        let mut keys: Vec<_> = items
            .iter()
            .filter_map(|item| match item {
                AllItem::Entry(resp) => Some(resp.key.clone()),
                AllItem::End => None,
            })
            .collect();
        keys.sort();
        assert_eq!(keys, [b"alice".to_vec(), b"bob".to_vec()]);
    }

    #[test]
    fn refused_all_is_a_single_status_item() {
        let (_dir, maps) = fixture();
        let server = Server::new(maps);
        let req = ReqNokey {
            domain: DOMAIN.to_owned(),
            map: "missing".to_owned(),
        };
        let reply = server.handle_call(&call(8, &req), tcp_from(700));
        assert!(matches!(reply, Reply::Single(_)));
        assert_eq!(
            read_all(reply),
            [AllItem::Entry(RespKeyVal::status(Stat::NoMap)), AllItem::End]
        );
    }

    #[test]
    fn all_is_not_served_over_udp() {
        let (_dir, maps) = fixture();
        let server = Server::new(maps);
        let req = ReqNokey {
            domain: DOMAIN.to_owned(),
            map: "passwd.byname".to_owned(),
        };
        let info = ReceivedInfo::new("192.0.2.1:700".parse().unwrap(), Transport::Udp);
        let reply = server.handle_call(&call(8, &req), info);
        assert_eq!(
            read_all(reply),
            [AllItem::Entry(RespKeyVal::status(Stat::YpErr)), AllItem::End]
        );
    }
}
