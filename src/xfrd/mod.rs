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

//! The bulk map file transfer service.
//!
//! A replica may fetch a map's database file whole with `GETMAP`
//! instead of walking it record by record. The [`XfrdServer`] checks
//! the request, then streams the file in blocks of at most
//! [`BLOCK_SIZE`] octets. Each stream runs on its own thread while the
//! service's [stream limit](Service::stream_limit) allows; beyond that,
//! the connection serving the request writes the stream itself.

use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::access::{AccessRules, Decision, DecisionLog, PolicyFile, Securenets, SharedRules};
use crate::db::{HandleCache, MapDir};
use crate::proto::xfrd::{
    ByteOrder, DbType, MapName, Status, XfrRecord, BLOCK_SIZE, PROC_GETMAP, PROC_NULL, PROGRAM,
    VERSION,
};
use crate::rpc::{self, AcceptStat};
use crate::server::{
    accept_call, error_reply, success_reply, ReceivedInfo, Reply, Service, StreamReply,
};
use crate::thread::WorkerLimit;
use crate::xdr::{Decode, Writer};

/// The default number of concurrent streams run on their own threads.
pub const DEFAULT_MAX_CHILDREN: usize = 5;

/// The database type tag of the map files served here.
pub const DB_TYPE: DbType = DbType::OPAQUE;

/// The name under which `GETMAP` is logged.
const GETMAP: &str = "ypxfrd_getmap";

/// Serves the map file transfer program.
pub struct XfrdServer {
    maps: MapDir,
    probe: Mutex<HandleCache<MapDir>>,
    rules: SharedRules,
    decisions: DecisionLog,
    streams: Arc<WorkerLimit>,
}

impl XfrdServer {
    pub fn new(maps: MapDir) -> Self {
        Self {
            // Map handles are only needed for access checks here.
            probe: Mutex::new(HandleCache::new(maps.clone(), 0)),
            maps,
            rules: SharedRules::default(),
            decisions: DecisionLog::new(),
            streams: WorkerLimit::new(DEFAULT_MAX_CHILDREN),
        }
    }

    /// Sets how many streams may run on their own threads.
    pub fn set_max_children(&mut self, max: usize) {
        self.streams = WorkerLimit::new(max);
    }

    /// Puts a policy file and securenets list into effect.
    pub fn apply_policy(&self, policy: &PolicyFile, securenets: Securenets) {
        self.rules
            .set(AccessRules::new(securenets, policy.entries.clone()));
    }

    /// Checks a `GETMAP` request. On success, returns the path of the
    /// file to stream; otherwise, the status to report.
    fn check(&self, req: &MapName, info: ReceivedInfo) -> Result<PathBuf, Status> {
        debug!(
            "{}(\"{}\", \"{}\", \"{}\") from {}",
            GETMAP,
            req.domain,
            req.map,
            req.filename,
            info.source()
        );
        let decision = {
            let mut probe = self.probe.lock().unwrap();
            self.rules
                .get()
                .decide(info.source(), Some(&req.domain), Some(&req.map), &mut *probe)
        };
        self.decisions.record(
            info.source(),
            GETMAP,
            Some(&req.domain),
            Some(&req.map),
            decision,
        );
        // A map that cannot be probed is left to the file check below.
        if decision != Decision::Allow && decision != Decision::MapNotFound {
            return Err(Status::Denied);
        }

        if req.db_type != DB_TYPE && req.db_type != DbType::ANY {
            return Err(Status::TypeMismatch);
        }
        if req.byte_order != ByteOrder::native() && req.byte_order != ByteOrder::Any {
            return Err(Status::EndianMismatch);
        }

        // The file name must not lead outside the domain directory, and
        // must belong to the named map.
        if req.filename.contains('/') {
            return Err(Status::NoFile);
        }
        if !req.filename.starts_with(&req.map) {
            return Err(Status::Denied);
        }

        let path = self.maps.map_path(&req.domain, &req.filename);
        match File::open(&path) {
            Ok(_) => Ok(path),
            Err(e) => {
                debug!("Cannot read {}: {}", path.display(), e);
                Err(Status::Access)
            }
        }
    }
}

impl Service for XfrdServer {
    fn handle_call(&self, call: &[u8], info: ReceivedInfo) -> Reply {
        let (header, mut reader) = match accept_call(call, info.source(), PROGRAM, VERSION) {
            Ok(accepted) => accepted,
            Err(reply) => return reply,
        };
        let limit = info.transport().reply_limit();
        match header.procedure {
            PROC_NULL => success_reply(header.xid, &(), limit),
            PROC_GETMAP => {
                let req = match MapName::decode(&mut reader) {
                    Ok(req) => req,
                    Err(e) => {
                        debug!("Garbage arguments from {}: {}", info.source(), e);
                        return error_reply(header.xid, AcceptStat::GarbageArgs);
                    }
                };
                match self.check(&req, info) {
                    Ok(path) => Reply::Stream(Box::new(MapFileStream {
                        xid: header.xid,
                        path,
                    })),
                    Err(status) => success_reply(header.xid, &XfrRecord::Status(status), limit),
                }
            }
            _ => error_reply(header.xid, AcceptStat::ProcUnavail),
        }
    }

    fn stream_limit(&self) -> &Arc<WorkerLimit> {
        &self.streams
    }
}

////////////////////////////////////////////////////////////////////////
// STREAMING                                                          //
////////////////////////////////////////////////////////////////////////

/// The `GETMAP` reply for an accepted request. The file is opened
/// when the stream starts.
struct MapFileStream {
    xid: u32,
    path: PathBuf,
}

impl StreamReply for MapFileStream {
    fn write_to(self: Box<Self>, out: &mut dyn Write) -> io::Result<()> {
        let mut writer = Writer::new(2 * BLOCK_SIZE);
        rpc::write_accepted_reply(&mut writer, self.xid, AcceptStat::Success)
            .map_err(invalid_data)?;
        let blocks = match File::open(&self.path) {
            Ok(file) => Blocks::new(file),
            Err(e) => {
                warn!("Cannot open {}: {}", self.path.display(), e);
                Blocks::failed()
            }
        };
        for record in blocks {
            writer.write(&record).map_err(invalid_data)?;
            out.write_all(&writer.take())?;
        }
        Ok(())
    }
}

fn invalid_data(err: crate::xdr::Error) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, err)
}

/// The records of a `GETMAP` reply: blocks of data read from `R`,
/// terminated by exactly one status record. A short block marks the end
/// of the data and is followed by [`Status::Done`]; a read error ends
/// the stream with [`Status::ReadErr`]. Nothing is read once the
/// terminating record has been produced.
pub struct Blocks<R> {
    state: BlockState<R>,
}

enum BlockState<R> {
    Streaming(R),
    Terminating(Status),
    Terminated,
}

impl<R: Read> Blocks<R> {
    pub fn new(source: R) -> Self {
        Self {
            state: BlockState::Streaming(source),
        }
    }

    /// Creates a stream that fails before reading anything.
    pub fn failed() -> Self {
        Self {
            state: BlockState::Terminating(Status::ReadErr),
        }
    }
}

impl<R: Read> Iterator for Blocks<R> {
    type Item = XfrRecord;

    fn next(&mut self) -> Option<XfrRecord> {
        match std::mem::replace(&mut self.state, BlockState::Terminated) {
            BlockState::Streaming(mut source) => match read_block(&mut source) {
                Ok(block) => {
                    self.state = if block.len() < BLOCK_SIZE {
                        BlockState::Terminating(Status::Done)
                    } else {
                        BlockState::Streaming(source)
                    };
                    Some(XfrRecord::Block(block))
                }
                Err(e) => {
                    warn!("read error: {}", e);
                    Some(XfrRecord::Status(Status::ReadErr))
                }
            },
            BlockState::Terminating(status) => Some(XfrRecord::Status(status)),
            BlockState::Terminated => None,
        }
    }
}

/// Reads up to one block, stopping early only at the end of the data.
fn read_block(source: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut block = vec![0; BLOCK_SIZE];
    let mut len = 0;
    while len < BLOCK_SIZE {
        match source.read(&mut block[len..]) {
            Ok(0) => break,
            Ok(n) => len += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    block.truncate(len);
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{read_reply, CallHeader, Reply as RpcReply};
    use crate::server::tests::{fixture, tcp_from, DOMAIN};
    use crate::server::Transport;
    use crate::xdr::{Encode, Reader};

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(ErrorKind::Other.into())
        }
    }

    fn block_lens(records: &[XfrRecord]) -> Vec<Option<usize>> {
        records
            .iter()
            .map(|record| match record {
                XfrRecord::Block(data) => Some(data.len()),
                XfrRecord::Status(_) => None,
            })
            .collect()
    }

    #[test]
    fn blocks_end_with_done() {
        let data = vec![7; BLOCK_SIZE + 10];
        let records: Vec<_> = Blocks::new(&data[..]).collect();
        assert_eq!(block_lens(&records), [Some(BLOCK_SIZE), Some(10), None]);
        assert_eq!(records[2], XfrRecord::Status(Status::Done));
    }

    #[test]
    fn exact_multiple_ends_with_empty_block() {
        let data = vec![7; BLOCK_SIZE];
        let records: Vec<_> = Blocks::new(&data[..]).collect();
        assert_eq!(block_lens(&records), [Some(BLOCK_SIZE), Some(0), None]);
    }

    #[test]
    fn read_errors_terminate_the_stream() {
        let mut blocks = Blocks::new(FailingReader);
        assert_eq!(blocks.next(), Some(XfrRecord::Status(Status::ReadErr)));
        assert_eq!(blocks.next(), None);
        assert_eq!(blocks.next(), None);
    }

    fn getmap(server: &XfrdServer, req: &MapName) -> Vec<XfrRecord> {
        let mut writer = Writer::new(4096);
        CallHeader {
            xid: 9,
            program: PROGRAM,
            version: VERSION,
            procedure: PROC_GETMAP,
        }
        .write(&mut writer)
        .unwrap();
        req.encode(&mut writer).unwrap();
        let octets = match server.handle_call(&writer.finish(), tcp_from(700)) {
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
            (9, RpcReply::Accepted(AcceptStat::Success))
        );
        let mut records = Vec::new();
        while !reader.at_end() {
            records.push(XfrRecord::decode(&mut reader).unwrap());
        }
        records
    }

    fn request(map: &str, filename: &str) -> MapName {
        MapName {
            map: map.to_owned(),
            domain: DOMAIN.to_owned(),
            filename: filename.to_owned(),
            db_type: DbType::ANY,
            byte_order: ByteOrder::Any,
        }
    }

    #[test]
    fn getmap_streams_the_file() {
        let (_dir, maps) = fixture();
        let expected = std::fs::read(maps.map_path(DOMAIN, "passwd.byname")).unwrap();
        let server = XfrdServer::new(maps);
        let records = getmap(&server, &request("passwd.byname", "passwd.byname"));
        assert_eq!(
            records,
            [XfrRecord::Block(expected), XfrRecord::Status(Status::Done)]
        );
    }

    #[test]
    fn getmap_rejects_bad_requests() {
        let (_dir, maps) = fixture();
        let server = XfrdServer::new(maps);
        let status = |req: &MapName| getmap(&server, req);

        let traversal = request("passwd.byname", "../../etc/shadow");
        assert_eq!(status(&traversal), [XfrRecord::Status(Status::NoFile)]);
        let other_map = request("passwd.byname", "secret");
        assert_eq!(status(&other_map), [XfrRecord::Status(Status::Denied)]);
        let missing = request("passwd.byname", "passwd.byname.old");
        assert_eq!(status(&missing), [XfrRecord::Status(Status::Access)]);
        let unknown_map = request("hosts.byname", "hosts.byname");
        assert_eq!(status(&unknown_map), [XfrRecord::Status(Status::Access)]);

        let mut wrong_type = request("passwd.byname", "passwd.byname");
        wrong_type.db_type = DbType::GNU_GDBM;
        assert_eq!(status(&wrong_type), [XfrRecord::Status(Status::TypeMismatch)]);

        let mut wrong_order = request("passwd.byname", "passwd.byname");
        wrong_order.byte_order = match ByteOrder::native() {
            ByteOrder::Big => ByteOrder::Little,
            _ => ByteOrder::Big,
        };
        assert_eq!(
            status(&wrong_order),
            [XfrRecord::Status(Status::EndianMismatch)]
        );

        let mut bad_domain = request("passwd.byname", "passwd.byname");
        bad_domain.domain = "binding".to_owned();
        assert_eq!(status(&bad_domain), [XfrRecord::Status(Status::Denied)]);
    }

    #[test]
    fn getmap_honors_securenets() {
        let (_dir, maps) = fixture();
        let server = XfrdServer::new(maps);
        server.apply_policy(
            &PolicyFile::default(),
            Securenets::parse("255.0.0.0 10.0.0.0\n"),
        );
        let records = getmap(&server, &request("passwd.byname", "passwd.byname"));
        assert_eq!(records, [XfrRecord::Status(Status::Denied)]);
    }

    #[test]
    fn streams_opened_late_report_read_errors() {
        let stream = Box::new(MapFileStream {
            xid: 3,
            path: PathBuf::from("/nonexistent/ypserv/map"),
        });
        let mut octets = Vec::new();
        stream.write_to(&mut octets).unwrap();
        let mut reader = Reader::new(&octets);
        read_reply(&mut reader).unwrap();
        assert_eq!(
            XfrRecord::decode(&mut reader),
            Ok(XfrRecord::Status(Status::ReadErr))
        );
        assert!(reader.at_end());
    }

    #[test]
    fn received_info_transport_is_irrelevant_to_null() {
        let (_dir, maps) = fixture();
        let server = XfrdServer::new(maps);
        let mut writer = Writer::new(1024);
        CallHeader {
            xid: 4,
            program: PROGRAM,
            version: VERSION,
            procedure: PROC_NULL,
        }
        .write(&mut writer)
        .unwrap();
        let info = ReceivedInfo::new("192.0.2.1:700".parse().unwrap(), Transport::Udp);
        assert!(matches!(
            server.handle_call(&writer.finish(), info),
            Reply::Single(_)
        ));
    }
}
