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

//! The request-handling logic of a YP server.
//!
//! The [`Server`] structure is the heart of this module; see its
//! documentation for details. It is abstracted from the network through
//! the [`Service`] trait, which the [I/O providers](crate::io) use to
//! hand it RPC call messages. The bulk file transfer service
//! ([`crate::xfrd`]) implements the same trait.

use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, warn};

use crate::access::{
    canonical_ip, AccessRules, Decision, DecisionLog, PolicyFile, Securenets, SharedRules,
    DEFAULT_FILES,
};
use crate::db::{HandleCache, MapDir};
use crate::proto::yp::{self, Procedure, Request, RequestError};
use crate::rpc::{self, record::MAX_RECORD_LEN, AcceptStat, CallHeader};
use crate::thread::WorkerLimit;
use crate::xdr::{Encode, Reader, Writer};

mod all;
mod procs;
mod xfr;

pub use xfr::{TransferJob, Transferer, Ypxfr};
use xfr::TransferSettings;

/// The largest reply sent in a UDP datagram.
pub const UDP_REPLY_LIMIT: usize = 8800;

/// The default number of concurrent streamed replies.
pub const DEFAULT_MAX_STREAMS: usize = 10;

////////////////////////////////////////////////////////////////////////
// SERVICE ABSTRACTION                                                //
////////////////////////////////////////////////////////////////////////

/// An RPC service that I/O providers can serve.
pub trait Service: Send + Sync + 'static {
    /// Handles a received RPC call message. `info` describes where and
    /// how it arrived.
    fn handle_call(&self, call: &[u8], info: ReceivedInfo) -> Reply;

    /// Returns the limit on streamed replies that may be written on
    /// their own threads. When it is exhausted, the I/O provider writes
    /// a stream synchronously before reading the next call.
    fn stream_limit(&self) -> &Arc<WorkerLimit>;
}

/// Information about a received message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReceivedInfo {
    source: SocketAddr,
    transport: Transport,
}

impl ReceivedInfo {
    /// Creates a new [`ReceivedInfo`].
    ///
    /// IPv4-mapped IPv6 addresses of the kind that dual-stack sockets
    /// produce (e.g. `::ffff:127.0.0.1`) are interpreted as IPv4
    /// addresses, so that network-based access rules apply to them.
    /// Calling I/O code need not concern itself with this task.
    pub fn new(source: SocketAddr, transport: Transport) -> Self {
        Self {
            source: SocketAddr::new(canonical_ip(source.ip()), source.port()),
            transport,
        }
    }

    pub fn source(&self) -> SocketAddr {
        self.source
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }
}

/// The transport over which a message was received.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    /// Returns the size limit for a single reply message.
    pub fn reply_limit(self) -> usize {
        match self {
            Self::Tcp => MAX_RECORD_LEN,
            Self::Udp => UDP_REPLY_LIMIT,
        }
    }
}

/// Indicates to the caller of [`Service::handle_call`] what kind of
/// reply needs to be sent.
pub enum Reply {
    /// A single reply message is to be sent.
    Single(Vec<u8>),

    /// A reply of unbounded size is to be streamed (TCP only).
    Stream(Box<dyn StreamReply>),

    /// No reply is to be sent.
    None,
}

/// A reply message produced incrementally. The whole message,
/// including the RPC reply header, is written to `out`; over TCP the
/// caller wraps it in record marking.
pub trait StreamReply: Send {
    fn write_to(self: Box<Self>, out: &mut dyn Write) -> io::Result<()>;
}

////////////////////////////////////////////////////////////////////////
// REPLY HELPERS                                                      //
////////////////////////////////////////////////////////////////////////

/// Reads the header of a call to `program` at `version`. If the call
/// cannot be served, the reply to send instead is returned as the
/// error.
pub(crate) fn accept_call(
    call: &[u8],
    source: SocketAddr,
    program: u32,
    version: u32,
) -> Result<(CallHeader, Reader), Reply> {
    let mut reader = Reader::new(call);
    let header = match CallHeader::read(&mut reader) {
        Ok(header) => header,
        Err(rpc::Error::RpcVersionMismatch { xid }) => {
            let mut writer = Writer::new(HEADER_LIMIT);
            return Err(match rpc::write_rpc_mismatch_reply(&mut writer, xid) {
                Ok(()) => Reply::Single(writer.finish()),
                Err(_) => Reply::None,
            });
        }
        Err(e) => {
            debug!("Ignoring message from {}: {}", source, e);
            return Err(Reply::None);
        }
    };
    if header.program != program {
        return Err(error_reply(header.xid, AcceptStat::ProgUnavail));
    }
    if header.version != version {
        let stat = AcceptStat::ProgMismatch {
            low: version,
            high: version,
        };
        return Err(error_reply(header.xid, stat));
    }
    Ok((header, reader))
}

/// The room needed for any reply header.
const HEADER_LIMIT: usize = 64;

/// Builds a successful reply carrying `results`. If they do not fit
/// within `limit`, a `SYSTEM_ERR` reply is built instead.
pub(crate) fn success_reply<T: Encode + ?Sized>(xid: u32, results: &T, limit: usize) -> Reply {
    let mut writer = Writer::new(limit);
    match rpc::write_accepted_reply(&mut writer, xid, AcceptStat::Success)
        .and_then(|()| writer.write(results))
    {
        Ok(()) => Reply::Single(writer.finish()),
        Err(e) => {
            warn!("Failed to encode reply {:#x}: {}", xid, e);
            error_reply(xid, AcceptStat::SystemErr)
        }
    }
}

/// Builds a reply reporting that a call was not accepted.
pub(crate) fn error_reply(xid: u32, stat: AcceptStat) -> Reply {
    let mut writer = Writer::new(HEADER_LIMIT);
    match rpc::write_accepted_reply(&mut writer, xid, stat) {
        Ok(()) => Reply::Single(writer.finish()),
        Err(_) => Reply::None,
    }
}

/// Reads a request's arguments, turning decode failures into the
/// appropriate reply.
fn decode_request(
    header: &CallHeader,
    reader: &mut Reader,
    source: SocketAddr,
) -> Result<Request, Reply> {
    Request::decode(header.procedure, reader).map_err(|e| match e {
        RequestError::ProcUnavail => error_reply(header.xid, AcceptStat::ProcUnavail),
        RequestError::GarbageArgs(e) => {
            debug!("Garbage arguments from {}: {}", source, e);
            error_reply(header.xid, AcceptStat::GarbageArgs)
        }
    })
}

////////////////////////////////////////////////////////////////////////
// SERVER PUBLIC API                                                  //
////////////////////////////////////////////////////////////////////////

/// A YP server, abstracted from any underlying network I/O provider.
///
/// The [`Server`] structure answers calls to the YP server program
/// (see [`crate::proto::yp`]) through its [`Service`] implementation.
/// Every call naming a domain or a map is first checked by the
/// [access control engine](crate::access); map handles are then
/// obtained from a [`HandleCache`] over the server's [`MapDir`].
///
/// The access rules may be replaced at any time with
/// [`Server::apply_policy`]. Calls already in progress finish with the
/// rules they started with.
pub struct Server {
    maps: MapDir,
    cache: Mutex<HandleCache<MapDir>>,
    cache_sized: AtomicBool,
    rules: SharedRules,
    transfers: RwLock<Arc<TransferSettings>>,
    decisions: DecisionLog,
    streams: Arc<WorkerLimit>,
    transferer: Box<dyn Transferer>,
}

impl Server {
    /// Creates a new `Server` serving the maps in `maps`. Initially
    /// there are no access restrictions, and transfer requests run the
    /// `ypxfr` program found on the search path.
    pub fn new(maps: MapDir) -> Self {
        Self {
            cache: Mutex::new(HandleCache::new(maps.clone(), DEFAULT_FILES)),
            cache_sized: AtomicBool::new(false),
            maps,
            rules: SharedRules::default(),
            transfers: RwLock::new(Arc::new(TransferSettings::default())),
            decisions: DecisionLog::new(),
            streams: WorkerLimit::new(DEFAULT_MAX_STREAMS),
            transferer: Box::new(Ypxfr::new("ypxfr")),
        }
    }

    /// Returns the map directory being served.
    pub fn maps(&self) -> &MapDir {
        &self.maps
    }

    /// Sets how many streamed replies may run on their own threads.
    pub fn set_max_streams(&mut self, max: usize) {
        self.streams = WorkerLimit::new(max);
    }

    /// Sets how accepted transfer requests are carried out.
    pub fn set_transferer(&mut self, transferer: Box<dyn Transferer>) {
        self.transferer = transferer;
    }

    /// Returns the access rules currently in effect.
    pub fn rules(&self) -> Arc<AccessRules> {
        self.rules.get()
    }

    /// Puts a policy file and securenets list into effect. The first
    /// policy applied sets the handle cache's capacity to its `files`
    /// setting; later policies may grow the cache but never shrink it.
    pub fn apply_policy(&self, policy: &PolicyFile, securenets: Securenets) {
        self.rules
            .set(AccessRules::new(securenets, policy.entries.clone()));
        *self.transfers.write().unwrap() = Arc::new(TransferSettings {
            trusted_master: policy.trusted_master.clone(),
            xfr_check_port: policy.xfr_check_port,
        });
        let mut cache = self.cache.lock().unwrap();
        if self.cache_sized.swap(true, Ordering::SeqCst) {
            cache.grow(policy.files);
        } else {
            cache.resize(policy.files);
        }
    }

    /// Closes every cached map handle, as `CLEAR` does.
    pub fn clear_cache(&self) {
        self.cache.lock().unwrap().close_all();
    }

    fn transfer_settings(&self) -> Arc<TransferSettings> {
        self.transfers.read().unwrap().clone()
    }

    /// Runs the access check for a call and logs the decision.
    fn decide(
        &self,
        info: ReceivedInfo,
        procedure: Procedure,
        domain: Option<&str>,
        map: Option<&str>,
    ) -> Decision {
        let decision = {
            let mut cache = self.cache.lock().unwrap();
            self.rules.get().decide(info.source, domain, map, &mut *cache)
        };
        self.decisions
            .record(info.source, procedure.name(), domain, map, decision);
        decision
    }
}

////////////////////////////////////////////////////////////////////////
// DISPATCH                                                           //
////////////////////////////////////////////////////////////////////////

impl Service for Server {
    fn handle_call(&self, call: &[u8], info: ReceivedInfo) -> Reply {
        let (header, mut reader) = match accept_call(call, info.source, yp::PROGRAM, yp::VERSION) {
            Ok(accepted) => accepted,
            Err(reply) => return reply,
        };
        match decode_request(&header, &mut reader, info.source) {
            Ok(request) => self.dispatch(header.xid, request, info),
            Err(reply) => reply,
        }
    }

    fn stream_limit(&self) -> &Arc<WorkerLimit> {
        &self.streams
    }
}

impl Server {
    fn dispatch(&self, xid: u32, request: Request, info: ReceivedInfo) -> Reply {
        let limit = info.transport.reply_limit();
        match request {
            Request::Null => {
                if self.null(info) {
                    success_reply(xid, &(), limit)
                } else {
                    Reply::None
                }
            }
            Request::Domain(domain) => {
                let served = self.domain(&domain, Procedure::Domain, info);
                success_reply(xid, &served, limit)
            }
            Request::DomainNonack(domain) => {
                if self.domain(&domain, Procedure::DomainNonack, info) {
                    success_reply(xid, &true, limit)
                } else {
                    Reply::None
                }
            }
            Request::Match(req) => success_reply(xid, &self.match_key(&req, info), limit),
            Request::First(req) => success_reply(xid, &self.first(&req, info), limit),
            Request::Next(req) => success_reply(xid, &self.next(&req, info), limit),
            Request::Xfr(req) => success_reply(xid, &self.xfr(&req, info), limit),
            Request::Clear => {
                self.clear(info);
                success_reply(xid, &(), limit)
            }
            Request::All(req) => self.all(xid, &req, info),
            Request::Master(req) => success_reply(xid, &self.master(&req, info), limit),
            Request::Order(req) => success_reply(xid, &self.order(&req, info), limit),
            Request::Maplist(domain) => success_reply(xid, &self.maplist(&domain, info), limit),
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
pub(crate) mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use super::*;
    use crate::db::write_map;
    use crate::proto::yp::{ReqKey, ReqNokey, RespKeyVal, RespMaplist, RespMaster, RespOrder, RespVal};
    use crate::proto::Stat;
    use crate::rpc::{read_reply, Reply as RpcReply};
    use crate::xdr::Decode;

    pub(crate) const DOMAIN: &str = "example";

    /// Creates a map directory with one domain holding a `passwd.byname`
    /// map of two users, a `secret` map marked `YP_SECURE`, and a map
    /// with no user records.
    pub(crate) fn fixture() -> (tempfile::TempDir, MapDir) {
        let dir = tempfile::tempdir().unwrap();
        let maps = MapDir::new(dir.path());
        std::fs::create_dir(maps.domain_path(DOMAIN)).unwrap();
        write_map(
            maps.map_path(DOMAIN, "passwd.byname"),
            [
                (&b"YP_MASTER_NAME"[..], &b"host1"[..]),
                (b"YP_LAST_MODIFIED", b"1700000000"),
                (b"alice", b"100:200"),
                (b"bob", b"101:201"),
            ],
        )
        .unwrap();
        write_map(
            maps.map_path(DOMAIN, "secret"),
            [
                (&b"YP_MASTER_NAME"[..], &b"host1"[..]),
                (b"YP_SECURE", b""),
                (b"root", b"x"),
            ],
        )
        .unwrap();
        write_map(
            maps.map_path(DOMAIN, "empty"),
            [(&b"YP_MASTER_NAME"[..], &b"host1"[..])],
        )
        .unwrap();
        (dir, maps)
    }

    pub(crate) fn tcp_from(port: u16) -> ReceivedInfo {
        ReceivedInfo::new(
            SocketAddr::new(Ipv4Addr::new(192, 0, 2, 1).into(), port),
            Transport::Tcp,
        )
    }

    pub(crate) fn call(procedure: u32, args: &impl Encode) -> Vec<u8> {
        let mut writer = Writer::new(4096);
        CallHeader {
            xid: 0x5150,
            program: yp::PROGRAM,
            version: yp::VERSION,
            procedure,
        }
        .write(&mut writer)
        .unwrap();
        writer.write(args).unwrap();
        writer.finish()
    }

    /// Reads a successful single reply and decodes its results.
    pub(crate) fn results<T: Decode>(reply: Reply) -> T {
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
        T::decode(&mut reader).unwrap()
    }

    fn accept_stat(reply: Reply) -> AcceptStat {
        match reply {
            Reply::Single(octets) => match read_reply(&mut Reader::new(&octets)).unwrap() {
                (_, RpcReply::Accepted(stat)) => stat,
                (_, RpcReply::Denied) => panic!("call was denied"),
            },
            _ => panic!("expected a single reply"),
        }
    }

    fn nokey(map: &str) -> ReqNokey {
        ReqNokey {
            domain: DOMAIN.to_owned(),
            map: map.to_owned(),
        }
    }

    fn key(map: &str, key: &[u8]) -> ReqKey {
        ReqKey {
            domain: DOMAIN.to_owned(),
            map: map.to_owned(),
            key: key.to_vec(),
        }
    }

    #[test]
    fn received_info_constructor_canonicalizes_ipv4_mapped_ipv6_addrs() {
        let ipv4_mapped_ipv6 = "[::ffff:127.0.0.1]:600".parse().unwrap();
        let received_info = ReceivedInfo::new(ipv4_mapped_ipv6, Transport::Udp);
        assert_eq!(
            received_info.source(),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 600),
        );
    }

    #[test]
    fn wrong_program_and_version_are_reported() {
        let (_dir, maps) = fixture();
        let server = Server::new(maps);

        let mut writer = Writer::new(1024);
        CallHeader {
            xid: 1,
            program: 100005,
            version: 2,
            procedure: 0,
        }
        .write(&mut writer)
        .unwrap();
        let reply = server.handle_call(&writer.finish(), tcp_from(700));
        assert_eq!(accept_stat(reply), AcceptStat::ProgUnavail);

        let mut writer = Writer::new(1024);
        CallHeader {
            xid: 1,
            program: yp::PROGRAM,
            version: 1,
            procedure: 0,
        }
        .write(&mut writer)
        .unwrap();
        let reply = server.handle_call(&writer.finish(), tcp_from(700));
        assert_eq!(
            accept_stat(reply),
            AcceptStat::ProgMismatch { low: 2, high: 2 }
        );
    }

    #[test]
    fn unknown_procedures_and_garbage_are_reported() {
        let (_dir, maps) = fixture();
        let server = Server::new(maps);
        let reply = server.handle_call(&call(13, &()), tcp_from(700));
        assert_eq!(accept_stat(reply), AcceptStat::ProcUnavail);
        let reply = server.handle_call(&call(3, &7u32), tcp_from(700));
        assert_eq!(accept_stat(reply), AcceptStat::GarbageArgs);
    }

    #[test]
    fn truncated_headers_are_ignored() {
        let (_dir, maps) = fixture();
        let server = Server::new(maps);
        assert!(matches!(
            server.handle_call(&[0, 0, 0, 1], tcp_from(700)),
            Reply::None
        ));
    }

    #[test]
    fn domain_reports_whether_a_domain_is_served() {
        let (_dir, maps) = fixture();
        let server = Server::new(maps);
        let served: bool = results(server.handle_call(
            &call(1, &Request::Domain(DOMAIN.to_owned())),
            tcp_from(700),
        ));
        assert!(served);
        let served: bool = results(server.handle_call(
            &call(1, &Request::Domain("nope".to_owned())),
            tcp_from(700),
        ));
        assert!(!served);
    }

    #[test]
    fn domain_nonack_is_silent_on_refusal() {
        let (_dir, maps) = fixture();
        let server = Server::new(maps);
        let reply = server.handle_call(
            &call(2, &Request::DomainNonack("binding".to_owned())),
            tcp_from(700),
        );
        assert!(matches!(reply, Reply::None));
        let served: bool = results(server.handle_call(
            &call(2, &Request::DomainNonack(DOMAIN.to_owned())),
            tcp_from(700),
        ));
        assert!(served);
    }

    #[test]
    fn null_is_silent_outside_securenets() {
        let (_dir, maps) = fixture();
        let server = Server::new(maps);
        let () = results(server.handle_call(&call(0, &()), tcp_from(700)));

        let securenets = Securenets::parse("255.255.255.0 10.0.0.0\n");
        server.apply_policy(&PolicyFile::default(), securenets);
        assert!(matches!(
            server.handle_call(&call(0, &()), tcp_from(700)),
            Reply::None
        ));
    }

    #[test]
    fn match_looks_up_keys() {
        let (_dir, maps) = fixture();
        let server = Server::new(maps);
        let resp: RespVal = results(server.handle_call(
            &call(3, &key("passwd.byname", b"alice")),
            tcp_from(700),
        ));
        assert_eq!(resp.stat, Stat::True);
        assert_eq!(resp.val, b"100:200");

        let resp: RespVal = results(server.handle_call(
            &call(3, &key("passwd.byname", b"carol")),
            tcp_from(700),
        ));
        assert_eq!(resp.stat, Stat::NoKey);

        let resp: RespVal = results(server.handle_call(
            &call(3, &key("passwd.byname", b"")),
            tcp_from(700),
        ));
        assert_eq!(resp.stat, Stat::BadArgs);

        let resp: RespVal = results(server.handle_call(
            &call(3, &key("passwd.byname", b"\0alice")),
            tcp_from(700),
        ));
        assert_eq!(resp.stat, Stat::BadArgs);
    }

    #[test]
    fn refusals_map_to_statuses() {
        let (_dir, maps) = fixture();
        let server = Server::new(maps);
        let status = |domain: &str, map: &str| {
            let req = ReqKey {
                domain: domain.to_owned(),
                map: map.to_owned(),
                key: b"alice".to_vec(),
            };
            results::<RespVal>(server.handle_call(&call(3, &req), tcp_from(2000))).stat
        };
        assert_eq!(status("..", "passwd.byname"), Stat::NoDom);
        assert_eq!(status("missing", "passwd.byname"), Stat::NoDom);
        assert_eq!(status(DOMAIN, "a/b"), Stat::BadArgs);
        assert_eq!(status(DOMAIN, "nonexistent"), Stat::NoMap);
        assert_eq!(status(DOMAIN, "secret"), Stat::NoMap);

        let policy = PolicyFile::parse("*:*:passwd.byname:deny\n");
        server.apply_policy(&policy, Securenets::default());
        assert_eq!(status(DOMAIN, "passwd.byname"), Stat::NoMap);
    }

    #[test]
    fn first_and_next_walk_user_records() {
        let (_dir, maps) = fixture();
        let server = Server::new(maps);

        let first: RespKeyVal = results(server.handle_call(
            &call(4, &nokey("passwd.byname")),
            tcp_from(700),
        ));
        assert_eq!(first.stat, Stat::True);
        assert!(!first.key.starts_with(b"YP_"));

        let second: RespKeyVal = results(server.handle_call(
            &call(5, &key("passwd.byname", &first.key)),
            tcp_from(700),
        ));
        assert_eq!(second.stat, Stat::True);
        let mut seen = vec![first.key.clone(), second.key.clone()];
        seen.sort();
        assert_eq!(seen, [b"alice".to_vec(), b"bob".to_vec()]);

        let third: RespKeyVal = results(server.handle_call(
            &call(5, &key("passwd.byname", &second.key)),
            tcp_from(700),
        ));
        assert_eq!(third.stat, Stat::NoMore);

        let first: RespKeyVal = results(server.handle_call(&call(4, &nokey("empty")), tcp_from(700)));
        assert_eq!(first.stat, Stat::NoKey);

        let next: RespKeyVal = results(server.handle_call(
            &call(5, &key("passwd.byname", b"zed")),
            tcp_from(700),
        ));
        assert_eq!(next.stat, Stat::NoMore);
    }

    #[test]
    fn master_and_order_read_metadata() {
        let (_dir, maps) = fixture();
        let server = Server::new(maps);
        let master: RespMaster = results(server.handle_call(
            &call(9, &nokey("passwd.byname")),
            tcp_from(700),
        ));
        assert_eq!(master.stat, Stat::True);
        assert_eq!(master.peer, "host1");

        let master: RespMaster = results(server.handle_call(&call(9, &nokey("gone")), tcp_from(700)));
        assert_eq!(master.stat, Stat::NoMap);
        assert_eq!(master.peer, "");

        let order: RespOrder = results(server.handle_call(
            &call(10, &nokey("passwd.byname")),
            tcp_from(700),
        ));
        assert_eq!(order.stat, Stat::True);
        assert_eq!(order.ordernum, 1700000000);

        // Without YP_LAST_MODIFIED, the file's modification time is used.
        let order: RespOrder = results(server.handle_call(&call(10, &nokey("empty")), tcp_from(700)));
        assert_eq!(order.stat, Stat::True);
        assert!(order.ordernum > 1600000000);
    }

    #[test]
    fn master_without_metadata_is_a_bad_database() {
        let (_dir, maps) = fixture();
        write_map(maps.map_path(DOMAIN, "bare"), [(&b"k"[..], &b"v"[..])]).unwrap();
        let server = Server::new(maps);
        let master: RespMaster = results(server.handle_call(&call(9, &nokey("bare")), tcp_from(700)));
        assert_eq!(master.stat, Stat::BadDb);
    }

    #[test]
    fn maplist_lists_the_domain() {
        let (_dir, maps) = fixture();
        let server = Server::new(maps);
        let list: RespMaplist = results(server.handle_call(
            &call(11, &Request::Maplist(DOMAIN.to_owned())),
            tcp_from(700),
        ));
        assert_eq!(list.stat, Stat::True);
        assert_eq!(list.maps, ["empty", "passwd.byname", "secret"]);

        let list: RespMaplist = results(server.handle_call(
            &call(11, &Request::Maplist("binding".to_owned())),
            tcp_from(700),
        ));
        assert_eq!(list.stat, Stat::NoDom);
        assert!(list.maps.is_empty());
    }

    #[test]
    fn clear_closes_cached_handles() {
        let (_dir, maps) = fixture();
        let server = Server::new(maps);
        let _: RespVal = results(server.handle_call(
            &call(3, &key("passwd.byname", b"alice")),
            tcp_from(700),
        ));
        assert!(server.cache.lock().unwrap().cached().count() > 0);
        let () = results(server.handle_call(&call(7, &()), tcp_from(700)));
        assert_eq!(server.cache.lock().unwrap().cached().count(), 0);
    }

    #[test]
    fn first_policy_sets_the_cache_capacity() {
        let (_dir, maps) = fixture();
        let server = Server::new(maps);
        server.apply_policy(&PolicyFile::parse("files: 0\n"), Securenets::default());
        let _: RespVal = results(server.handle_call(
            &call(3, &key("passwd.byname", b"alice")),
            tcp_from(700),
        ));
        assert_eq!(server.cache.lock().unwrap().capacity(), 0);
        assert_eq!(server.cache.lock().unwrap().cached().count(), 0);

        let (_dir, maps) = fixture();
        let server = Server::new(maps);
        server.apply_policy(&PolicyFile::parse("files: 2\n"), Securenets::default());
        for map in ["passwd.byname", "secret", "empty"] {
            let _: RespOrder = results(server.handle_call(&call(10, &nokey(map)), tcp_from(700)));
        }
        assert_eq!(server.cache.lock().unwrap().capacity(), 2);
        assert!(server.cache.lock().unwrap().cached().count() <= 2);
    }

    #[test]
    fn later_policies_only_grow_the_cache() {
        let (_dir, maps) = fixture();
        let server = Server::new(maps);
        server.apply_policy(&PolicyFile::parse("files: 2\n"), Securenets::default());
        server.apply_policy(&PolicyFile::parse("files: 1\n"), Securenets::default());
        assert_eq!(server.cache.lock().unwrap().capacity(), 2);
        server.apply_policy(&PolicyFile::parse("files: 5\n"), Securenets::default());
        assert_eq!(server.cache.lock().unwrap().capacity(), 5);
    }

    #[test]
    fn udp_replies_are_limited() {
        let (_dir, maps) = fixture();
        let big = vec![b'x'; UDP_REPLY_LIMIT];
        write_map(maps.map_path(DOMAIN, "big"), [(&b"k"[..], &big[..])]).unwrap();
        let server = Server::new(maps);
        let info = ReceivedInfo::new("192.0.2.1:700".parse().unwrap(), Transport::Udp);
        let reply = server.handle_call(&call(3, &key("big", b"k")), info);
        assert_eq!(accept_stat(reply), AcceptStat::SystemErr);
    }
}
