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

//! Handling of map transfer requests (`XFR` and `NEWXFR`).
//!
//! A transfer request asks this server to pull a fresh copy of a map
//! from the host that claims to own it. The server does not transfer
//! anything itself: once the claim has been checked, the work is
//! handed to a [`Transferer`], by default an external `ypxfr` process.
//! The requester learns the outcome through its callback service,
//! which the transfer client calls when it is done.

use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;

use log::{debug, info, log_enabled, warn, Level};

use super::{ReceivedInfo, Server};
use crate::access::{Decision, RESERVED_PORT_LIMIT};
use crate::db::{self, Database};
use crate::proto::yp::{Procedure, ReqXfr, RespXfr, XfrCallback};
use crate::proto::XfrStat;

/// Settings from the policy file that govern transfer requests.
#[derive(Clone, Debug, Default)]
pub(super) struct TransferSettings {
    pub trusted_master: Option<String>,
    pub xfr_check_port: bool,
}

/// An accepted transfer request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransferJob {
    pub domain: String,
    pub map: String,
    pub owner: String,
    pub transid: u32,
    /// The requester's callback program number.
    pub prog: u32,
    pub requester: IpAddr,
    /// The requester's callback port, or 0 to look it up.
    pub port: u32,
}

impl TransferJob {
    /// Returns the command-line arguments for `ypxfr`.
    pub fn ypxfr_args(&self, debug: bool) -> Vec<String> {
        let mut args = Vec::with_capacity(11);
        if debug {
            args.push("--debug".to_owned());
        }
        args.extend([
            "-d".to_owned(),
            self.domain.clone(),
            "-h".to_owned(),
            self.owner.clone(),
            "-C".to_owned(),
            self.transid.to_string(),
            self.prog.to_string(),
            self.requester.to_string(),
            self.port.to_string(),
            self.map.clone(),
        ]);
        args
    }
}

/// Carries out accepted transfer requests. Implementations must not
/// block; the outcome is reported to the requester out of band.
pub trait Transferer: Send + Sync {
    fn start(&self, job: &TransferJob) -> io::Result<()>;
}

/// A [`Transferer`] that runs the `ypxfr` program as a detached
/// process.
#[derive(Clone, Debug)]
pub struct Ypxfr {
    program: PathBuf,
}

impl Ypxfr {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Transferer for Ypxfr {
    fn start(&self, job: &TransferJob) -> io::Result<()> {
        let mut child = Command::new(&self.program)
            .args(job.ypxfr_args(log_enabled!(Level::Debug)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let map = job.map.clone();
        let reaper = thread::Builder::new()
            .name("ypxfr reaper".to_owned())
            .spawn(move || match child.wait() {
                Ok(status) if !status.success() => {
                    debug!("ypxfr for {} exited with {}", map, status)
                }
                Ok(_) => (),
                Err(e) => warn!("Failed to wait for ypxfr: {}", e),
            });
        if let Err(e) = reaper {
            warn!("Failed to start a thread to reap ypxfr: {}", e);
        }
        Ok(())
    }
}

impl Server {
    pub(super) fn xfr(&self, req: &ReqXfr, info: ReceivedInfo) -> RespXfr {
        let parms = &req.map_parms;
        let reply = |xfrstat| RespXfr {
            transid: req.transid,
            xfrstat,
        };
        let procedure = match req.callback {
            XfrCallback::Port(_) => Procedure::Xfr,
            XfrCallback::Name(_) => Procedure::NewXfr,
        };
        debug!(
            "{}(\"{}\", \"{}\", \"{}\") from {}",
            procedure.name(),
            parms.domain,
            parms.map,
            parms.owner,
            info.source()
        );

        match self.decide(info, procedure, Some(&parms.domain), Some(&parms.map)) {
            Decision::Allow | Decision::MapNotFound => (),
            Decision::BadDomain => return reply(XfrStat::NoDom),
            _ => {
                warn!(
                    "refuse to transfer map from {}:{}",
                    info.source().ip(),
                    info.source().port()
                );
                return reply(XfrStat::Refused);
            }
        }

        let settings = self.transfer_settings();
        if settings.xfr_check_port && info.source().port() >= RESERVED_PORT_LIMIT {
            warn!(
                "refuse to transfer {} from {}: unprivileged port {}",
                parms.map,
                info.source().ip(),
                info.source().port()
            );
            return reply(XfrStat::Refused);
        }

        let master = self.with_map(&parms.domain, &parms.map, |map| {
            map.fetch(db::MASTER_NAME_KEY).map(<[u8]>::to_vec)
        });
        match master {
            Ok(Some(master)) if master == parms.owner.as_bytes() => (),
            Ok(Some(master)) => {
                warn!(
                    "refuse to transfer {}: {} is not the master ({})",
                    parms.map,
                    parms.owner,
                    String::from_utf8_lossy(&master)
                );
                return reply(XfrStat::NoDom);
            }
            Ok(None) => {
                warn!("refuse to transfer {}: map has no master name", parms.map);
                return reply(XfrStat::Refused);
            }
            Err(_) => match settings.trusted_master {
                Some(ref trusted) if trusted.eq_ignore_ascii_case(&parms.owner) => {
                    info!("New map {} from trusted master {}", parms.map, parms.owner);
                }
                Some(_) => {
                    warn!(
                        "refuse to transfer {} from {}: not the trusted master",
                        parms.map, parms.owner
                    );
                    return reply(XfrStat::NoDom);
                }
                None => {
                    warn!(
                        "refuse to transfer {} from {}: map doesn't exist locally",
                        parms.map, parms.owner
                    );
                    return reply(XfrStat::Refused);
                }
            },
        }

        let job = TransferJob {
            domain: parms.domain.clone(),
            map: parms.map.clone(),
            owner: parms.owner.clone(),
            transid: req.transid,
            prog: req.prog,
            requester: info.source().ip(),
            port: match req.callback {
                XfrCallback::Port(port) => port,
                XfrCallback::Name(_) => 0,
            },
        };
        match self.transferer.start(&job) {
            Ok(()) => reply(XfrStat::Succ),
            Err(e) => {
                warn!("Cannot start a transfer of {}: {}", job.map, e);
                reply(XfrStat::XfrErr)
            }
        }
    }
}
