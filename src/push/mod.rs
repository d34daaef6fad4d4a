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

//! The push coordinator.
//!
//! After a map is rebuilt on its master, the coordinator asks every
//! replica to pull the new copy. For each replica, a worker sends a
//! transfer request (`NEWXFR`, or `XFR` for servers that lack it) and
//! then waits on a transient callback service for the replica's
//! transfer client to report the outcome.
//!
//! Workers run on their own threads, at most
//! [`PushConfig::parallel`] at a time. All workers for one map finish
//! before the next map is pushed.

use std::fmt;
use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use rand::Rng;

use crate::db::{self, parse_order_number, Database, MapDir, Opener};
use crate::proto::push::{XfrResp, PROC_NULL, PROC_XFRRESP, TRANSIENT_PROGRAMS, VERSION};
use crate::proto::yp::{self, MapParms, ReqXfr, Request, RespXfr, XfrCallback};
use crate::proto::XfrStat;
use crate::rpc::{self, AcceptStat, CallHeader};
use crate::server::{
    accept_call, error_reply, success_reply, ReceivedInfo, Reply, Service, Transport,
    UDP_REPLY_LIMIT,
};
use crate::thread::{ThreadGroup, WorkerLimit};
use crate::xdr::{self, Decode, Encode, Reader, Writer};

/// The name of the map listing a domain's servers.
pub const SERVERS_MAP: &str = "ypservers";

/// How long to wait for a replica to answer a transfer request.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// How often an unanswered call is retransmitted.
const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(2500);

/// Settings for a push run.
#[derive(Clone, Debug)]
pub struct PushConfig {
    pub domain: String,

    /// The name of this host, as it appears in the `YP_MASTER_NAME`
    /// records of the maps it masters.
    pub local_host: String,

    /// How long to wait for each replica's callback.
    pub timeout: Duration,

    /// The maximum number of concurrent workers.
    pub parallel: usize,

    /// The address on which callback services listen. Replicas must be
    /// able to reach it.
    pub callback_ip: IpAddr,

    /// The YP server port used for replicas named without one.
    pub default_port: u16,
}

/// The outcome of pushing one map to one replica.
#[derive(Debug)]
pub struct Outcome {
    pub map: String,
    pub host: String,
    pub result: Result<XfrStat, Error>,
}

/// Pushes maps to replicas.
pub struct Pusher {
    maps: MapDir,
    config: PushConfig,
    workers: Arc<WorkerLimit>,
}

impl Pusher {
    pub fn new(maps: MapDir, config: PushConfig) -> Self {
        let workers = WorkerLimit::new(config.parallel.max(1));
        Self {
            maps,
            config,
            workers,
        }
    }

    /// Returns the replicas to push to: `explicit` if it is not empty,
    /// otherwise the hosts listed in the domain's `ypservers` map,
    /// except this host.
    pub fn replicas(&self, explicit: &[String]) -> Result<Vec<String>, db::Error> {
        if !explicit.is_empty() {
            return Ok(explicit.to_vec());
        }
        let servers = self.maps.open(&self.config.domain, SERVERS_MAP)?;
        let mut hosts = Vec::new();
        let mut record = servers.first_user();
        while let Some((key, val)) = record {
            let host = String::from_utf8_lossy(val).trim().to_owned();
            if host.eq_ignore_ascii_case(&self.config.local_host) {
                debug!("Skipping {}", host);
            } else if !host.is_empty() {
                hosts.push(host);
            }
            record = servers.next_user(key);
        }
        Ok(hosts)
    }

    /// Returns the order number to announce for `map`, or `None` if
    /// this host is not its master.
    pub fn order_number(&self, map: &str) -> Result<Option<u32>, db::Error> {
        let handle = self.maps.open(&self.config.domain, map)?;
        if let Some(master) = handle.fetch(db::MASTER_NAME_KEY) {
            let master = String::from_utf8_lossy(master);
            if !master.eq_ignore_ascii_case(&self.config.local_host) {
                warn!(
                    "{} is not the master for {}, try it from {}.",
                    self.config.local_host, map, master
                );
                return Ok(None);
            }
        }
        let ordernum = match handle.fetch(db::LAST_MODIFIED_KEY) {
            Some(value) if value.iter().all(u8::is_ascii_digit) => parse_order_number(value),
            Some(value) => {
                warn!(
                    "Order number '{}' in map {} is invalid!",
                    String::from_utf8_lossy(value),
                    map
                );
                0
            }
            None => {
                debug!("Cannot determine order number for {}", map);
                0
            }
        };
        Ok(Some(ordernum))
    }

    /// Pushes each of `maps` to each of `hosts`, returning the outcome
    /// of every attempt.
    pub fn push(&self, group: &Arc<ThreadGroup>, maps: &[String], hosts: &[String]) -> Vec<Outcome> {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        for map in maps {
            let ordernum = match self.order_number(map) {
                Ok(Some(ordernum)) => ordernum,
                Ok(None) => continue,
                Err(e) => {
                    error!("Cannot open {}/{}: {}", self.config.domain, map, e);
                    continue;
                }
            };
            for host in hosts {
                let permit = self.workers.acquire();
                let job = Job {
                    config: self.config.clone(),
                    map: map.clone(),
                    ordernum,
                    host: host.clone(),
                };
                let outcomes = outcomes.clone();
                let started = group.start_oneshot(Some(format!("push {} to {}", map, host)), move || {
                    let _permit = permit;
                    let result = job.run();
                    match result {
                        Ok(status) if status == XfrStat::Succ => {
                            info!("{}->{}: Transfer done", job.map, job.host)
                        }
                        Ok(status) => warn!("{}->{}: {}", job.map, job.host, status),
                        Err(ref e) => warn!("{}->{}: {}", job.map, job.host, e),
                    }
                    outcomes.lock().unwrap().push(Outcome {
                        map: job.map,
                        host: job.host,
                        result,
                    });
                });
                if let Err(e) = started {
                    error!("Cannot start a worker for {}: {}", host, e);
                }
            }
            self.workers.wait_idle();
        }
        let outcomes = std::mem::take(&mut *outcomes.lock().unwrap());
        outcomes
    }
}

////////////////////////////////////////////////////////////////////////
// WORKERS                                                            //
////////////////////////////////////////////////////////////////////////

/// Pushes one map to one replica.
struct Job {
    config: PushConfig,
    map: String,
    ordernum: u32,
    host: String,
}

impl Job {
    fn run(&self) -> Result<XfrStat, Error> {
        let target = resolve(&self.host, self.config.default_port)?;
        let callback_socket = UdpSocket::bind((self.config.callback_ip, 0))?;
        let callback_port = callback_socket.local_addr()?.port();
        let prog = rand::thread_rng().gen_range(TRANSIENT_PROGRAMS);
        let transid = rand::random();
        debug!(
            "{}->{}: transid {}, callback program {:#x} on port {}",
            self.map, self.host, transid, prog, callback_port
        );

        let map_parms = MapParms {
            domain: self.config.domain.clone(),
            map: self.map.clone(),
            ordernum: self.ordernum,
            owner: self.config.local_host.clone(),
        };
        let mut request = ReqXfr {
            map_parms,
            transid,
            prog,
            callback: XfrCallback::Name(self.config.local_host.clone()),
        };

        let client = UdpSocket::bind(unspecified_for(target))?;
        let reply = match call_xfr(&client, target, &request) {
            Err(Error::Rejected(AcceptStat::ProcUnavail)) => {
                debug!("{} lacks NEWXFR; using XFR", self.host);
                request.callback = XfrCallback::Port(u32::from(callback_port));
                call_xfr(&client, target, &request)?
            }
            other => other?,
        };
        if let Some(resp) = reply {
            if resp.xfrstat != XfrStat::Succ {
                return Ok(resp.xfrstat);
            }
        }

        let service = CallbackService::new(prog, transid);
        match service.serve(&callback_socket, self.config.timeout)? {
            Some(status) => Ok(status),
            None => {
                warn!("{}->{}: Callback timed out", self.map, self.host);
                Err(Error::TimedOut)
            }
        }
    }
}

/// Sends a transfer request. Replicas may answer with a transfer
/// status or with no results at all.
fn call_xfr(socket: &UdpSocket, target: SocketAddr, req: &ReqXfr) -> Result<Option<RespXfr>, Error> {
    let request = Request::Xfr(req.clone());
    let procedure = u32::from(request.procedure());
    let results = call(
        socket,
        target,
        (yp::PROGRAM, yp::VERSION, procedure),
        &request,
        CALL_TIMEOUT,
    )?;
    if results.is_empty() {
        Ok(None)
    } else {
        Ok(Some(RespXfr::decode(&mut Reader::new(&results))?))
    }
}

/// Resolves `HOST` or `HOST:PORT`.
fn resolve(host: &str, default_port: u16) -> Result<SocketAddr, Error> {
    let resolved = match host.parse::<SocketAddr>() {
        Ok(addr) => Some(addr),
        Err(_) if host.contains(':') && !host.contains("::") => host.to_socket_addrs()?.next(),
        Err(_) => (host, default_port).to_socket_addrs()?.next(),
    };
    resolved.ok_or_else(|| Error::Resolve(host.to_owned()))
}

fn unspecified_for(target: SocketAddr) -> SocketAddr {
    match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    }
}

////////////////////////////////////////////////////////////////////////
// RPC CLIENT                                                         //
////////////////////////////////////////////////////////////////////////

/// Calls a procedure over UDP, retransmitting until a reply arrives or
/// `timeout` passes. `target` is `(program, version, procedure)`.
/// Returns the encoded results.
pub fn call<A: Encode + ?Sized>(
    socket: &UdpSocket,
    server: SocketAddr,
    (program, version, procedure): (u32, u32, u32),
    args: &A,
    timeout: Duration,
) -> Result<Vec<u8>, Error> {
    let xid = rand::random();
    let mut writer = Writer::new(UDP_REPLY_LIMIT);
    CallHeader {
        xid,
        program,
        version,
        procedure,
    }
    .write(&mut writer)?;
    writer.write(args)?;
    let message = writer.finish();

    let deadline = Instant::now() + timeout;
    let mut buf = vec![0; UDP_REPLY_LIMIT];
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::TimedOut);
        }
        socket.send_to(&message, server)?;
        let resend_at = deadline.min(now + RETRANSMIT_INTERVAL);

        while let Some(wait) = resend_at.checked_duration_since(Instant::now()) {
            if wait.is_zero() {
                break;
            }
            socket.set_read_timeout(Some(wait))?;
            let len = match socket.recv(&mut buf) {
                Ok(len) => len,
                Err(e) if is_transient(&e) => continue,
                Err(e) => return Err(e.into()),
            };
            let mut reader = Reader::new(&buf[..len]);
            match rpc::read_reply(&mut reader) {
                Ok((reply_xid, _)) if reply_xid != xid => continue,
                Ok((_, rpc::Reply::Accepted(AcceptStat::Success))) => {
                    return Ok(reader.rest().to_vec())
                }
                Ok((_, rpc::Reply::Accepted(stat))) => return Err(Error::Rejected(stat)),
                Ok((_, rpc::Reply::Denied)) => return Err(Error::Denied),
                Err(e) => debug!("Ignoring reply from {}: {}", server, e),
            }
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}

////////////////////////////////////////////////////////////////////////
// CALLBACK SERVICE                                                   //
////////////////////////////////////////////////////////////////////////

/// The transient callback program through which a replica reports the
/// outcome of one transfer.
pub struct CallbackService {
    prog: u32,
    transid: u32,
    result: Mutex<Option<XfrStat>>,
    streams: Arc<WorkerLimit>,
}

impl CallbackService {
    pub fn new(prog: u32, transid: u32) -> Self {
        Self {
            prog,
            transid,
            result: Mutex::new(None),
            streams: WorkerLimit::new(0),
        }
    }

    /// Answers calls on `socket` until the transfer result arrives or
    /// nothing has been received for `timeout`. Returns the result, or
    /// `None` on timeout.
    pub fn serve(&self, socket: &UdpSocket, timeout: Duration) -> io::Result<Option<XfrStat>> {
        let mut buf = vec![0; UDP_REPLY_LIMIT];
        socket.set_read_timeout(Some(timeout))?;
        loop {
            let (len, source) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if is_transient(&e) => return Ok(None),
                Err(e) => return Err(e),
            };
            let info = ReceivedInfo::new(source, Transport::Udp);
            if let Reply::Single(reply) = self.handle_call(&buf[..len], info) {
                if let Err(e) = socket.send_to(&reply, source) {
                    warn!("Failed to answer {}: {}", source, e);
                }
            }
            if let Some(status) = *self.result.lock().unwrap() {
                return Ok(Some(status));
            }
        }
    }
}

impl Service for CallbackService {
    fn handle_call(&self, call: &[u8], info: ReceivedInfo) -> Reply {
        let (header, mut reader) = match accept_call(call, info.source(), self.prog, VERSION) {
            Ok(accepted) => accepted,
            Err(reply) => return reply,
        };
        match header.procedure {
            PROC_NULL => success_reply(header.xid, &(), UDP_REPLY_LIMIT),
            PROC_XFRRESP => match XfrResp::decode(&mut reader) {
                Ok(resp) => {
                    info!(
                        "Status received from ypxfr on {}: Transfer {}done: {}",
                        info.source().ip(),
                        if resp.status == XfrStat::Succ { "" } else { "not " },
                        resp.status
                    );
                    if resp.transid == self.transid {
                        *self.result.lock().unwrap() = Some(resp.status);
                    } else {
                        debug!("Ignoring result for transaction {}", resp.transid);
                    }
                    success_reply(header.xid, &(), UDP_REPLY_LIMIT)
                }
                Err(e) => {
                    warn!("cannot decode arguments for {} from {}: {}", header.procedure, info.source(), e);
                    error_reply(header.xid, AcceptStat::GarbageArgs)
                }
            },
            _ => error_reply(header.xid, AcceptStat::ProcUnavail),
        }
    }

    fn stream_limit(&self) -> &Arc<WorkerLimit> {
        &self.streams
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error pushing a map to a replica.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),

    /// A message could not be encoded or a reply could not be decoded.
    Xdr(xdr::Error),

    /// The host name did not resolve to an address.
    Resolve(String),

    /// The replica did not accept the call.
    Rejected(AcceptStat),

    /// The replica denied the call at the RPC level.
    Denied,

    TimedOut,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<xdr::Error> for Error {
    fn from(err: xdr::Error) -> Self {
        Self::Xdr(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(err) => err.fmt(f),
            Self::Xdr(err) => err.fmt(f),
            Self::Resolve(host) => write!(f, "cannot resolve {}", host),
            Self::Rejected(stat) => write!(f, "call rejected: {:?}", stat),
            Self::Denied => f.write_str("call denied"),
            Self::TimedOut => f.write_str("timed out"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Xdr(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::db::write_map;
    use crate::proto::yp::Procedure;
    use crate::server::tests::{fixture, DOMAIN};

    fn config(local_host: &str) -> PushConfig {
        PushConfig {
            domain: DOMAIN.to_owned(),
            local_host: local_host.to_owned(),
            timeout: Duration::from_secs(5),
            parallel: 2,
            callback_ip: Ipv4Addr::LOCALHOST.into(),
            default_port: 834,
        }
    }

    #[test]
    fn replicas_come_from_the_servers_map() {
        let (_dir, maps) = fixture();
        write_map(
            maps.map_path(DOMAIN, SERVERS_MAP),
            [
                (&b"YP_MASTER_NAME"[..], &b"host1"[..]),
                (b"host1", b"host1"),
                (b"host2", b"host2"),
                (b"host3", b"host3"),
            ],
        )
        .unwrap();
        let pusher = Pusher::new(maps, config("HOST1"));
        assert_eq!(pusher.replicas(&[]).unwrap(), ["host2", "host3"]);
        let explicit = ["only".to_owned()];
        assert_eq!(pusher.replicas(&explicit).unwrap(), ["only"]);
    }

    #[test]
    fn only_the_master_pushes() {
        let (_dir, maps) = fixture();
        write_map(
            maps.map_path(DOMAIN, "odd"),
            [
                (&b"YP_MASTER_NAME"[..], &b"host1"[..]),
                (b"YP_LAST_MODIFIED", b"12x"),
            ],
        )
        .unwrap();
        let pusher = Pusher::new(maps.clone(), config("host1"));
        assert_eq!(pusher.order_number("passwd.byname").unwrap(), Some(1700000000));
        assert_eq!(pusher.order_number("odd").unwrap(), Some(0));
        assert!(pusher.order_number("missing").is_err());

        let pusher = Pusher::new(maps, config("host2"));
        assert_eq!(pusher.order_number("passwd.byname").unwrap(), None);
    }

    #[test]
    fn callback_service_answers_null_and_records_results() {
        let service = CallbackService::new(0x4000_0001, 99);
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();

        let reporter = thread::spawn(move || {
            let client = UdpSocket::bind("127.0.0.1:0").unwrap();
            let target = (0x4000_0001, VERSION, PROC_NULL);
            call(&client, addr, target, &(), Duration::from_secs(5)).unwrap();
            let target = (0x4000_0001, VERSION, PROC_XFRRESP);
            let resp = XfrResp {
                transid: 99,
                status: XfrStat::Age,
            };
            call(&client, addr, target, &resp, Duration::from_secs(5)).unwrap();
        });
        let status = service.serve(&socket, Duration::from_secs(5)).unwrap();
        reporter.join().unwrap();
        assert_eq!(status, Some(XfrStat::Age));
    }

    #[test]
    fn callback_service_times_out() {
        let service = CallbackService::new(0x4000_0001, 99);
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let status = service.serve(&socket, Duration::from_millis(50)).unwrap();
        assert_eq!(status, None);
    }

    /// Plays a replica that lacks `NEWXFR` and reports success through
    /// the callback.
    fn fake_replica(socket: UdpSocket) {
        let mut buf = vec![0; UDP_REPLY_LIMIT];
        loop {
            let (len, from) = socket.recv_from(&mut buf).unwrap();
            let mut reader = Reader::new(&buf[..len]);
            let header = CallHeader::read(&mut reader).unwrap();
            let request = Request::decode(header.procedure, &mut reader).unwrap();
            let req = match request {
                Request::Xfr(req) if request_is_newxfr(&req) => {
                    if let Reply::Single(reply) = error_reply(header.xid, AcceptStat::ProcUnavail) {
                        socket.send_to(&reply, from).unwrap();
                    }
                    continue;
                }
                Request::Xfr(req) => req,
                other => panic!("unexpected request {:?}", other),
            };
            let resp = RespXfr {
                transid: req.transid,
                xfrstat: XfrStat::Succ,
            };
            if let Reply::Single(reply) = success_reply(header.xid, &resp, UDP_REPLY_LIMIT) {
                socket.send_to(&reply, from).unwrap();
            }
            let port = match req.callback {
                XfrCallback::Port(port) => port as u16,
                XfrCallback::Name(_) => unreachable!(),
            };
            let callback = SocketAddr::new(from.ip(), port);
            let report = XfrResp {
                transid: req.transid,
                status: XfrStat::Succ,
            };
            let target = (req.prog, VERSION, PROC_XFRRESP);
            call(&socket, callback, target, &report, Duration::from_secs(5)).unwrap();
            return;
        }
    }

    fn request_is_newxfr(req: &ReqXfr) -> bool {
        Request::Xfr(req.clone()).procedure() == Procedure::NewXfr
    }

    #[test]
    fn push_reaches_replicas_through_the_callback() {
        let (_dir, maps) = fixture();
        let replica = UdpSocket::bind("127.0.0.1:0").unwrap();
        let replica_addr = replica.local_addr().unwrap();
        let handle = thread::spawn(move || fake_replica(replica));

        let pusher = Pusher::new(maps, config("host1"));
        let group = ThreadGroup::new();
        let outcomes = pusher.push(
            &group,
            &["passwd.byname".to_owned()],
            &[replica_addr.to_string()],
        );
        handle.join().unwrap();

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].map, "passwd.byname");
        assert!(matches!(outcomes[0].result, Ok(XfrStat::Succ)));
    }

    #[test]
    fn resolve_accepts_ports() {
        assert_eq!(
            resolve("127.0.0.1", 834).unwrap(),
            "127.0.0.1:834".parse().unwrap()
        );
        assert_eq!(
            resolve("127.0.0.1:900", 834).unwrap(),
            "127.0.0.1:900".parse().unwrap()
        );
    }
}
