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

//! The access control engine.
//!
//! Every request is checked against two sets of rules before it is
//! served. The [securenets](Securenets) list is a coarse allowlist of
//! networks; it applies to every request, including those that do not
//! name a map. The [policy table](PolicyEntry) is consulted only for
//! requests naming a map: the first entry matching the caller's
//! address, the domain, and the map decides. If no entry matches, a
//! map carrying the `YP_SECURE` key is restricted to callers on
//! reserved ports.
//!
//! The rules in effect are held in an immutable [`AccessRules`]
//! snapshot, so a reload can build a new snapshot and swap it in
//! without disturbing requests in flight.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, warn};

use crate::db::{self, Database, HandleCache, Opener};

mod policy;
mod securenets;

pub use policy::{
    Hosts, ParseError, PolicyEntry, PolicyFile, Security, Slp, DEFAULT_FILES,
    DEFAULT_SLP_TIMEOUT,
};
pub use securenets::{InvalidSecurenet, Securenet, Securenets};

/// Source ports below this value are reserved for privileged
/// processes.
pub const RESERVED_PORT_LIMIT: u16 = 1024;

/// Returns whether `domain` is syntactically acceptable as a domain
/// name: it must not be empty, `.`, `..`, or `binding`, and must not
/// contain a slash.
pub fn is_valid_domain_name(domain: &str) -> bool {
    !domain.is_empty()
        && domain != "."
        && domain != ".."
        && domain != "binding"
        && !domain.contains('/')
}

////////////////////////////////////////////////////////////////////////
// DECISIONS                                                          //
////////////////////////////////////////////////////////////////////////

/// The outcome of an access check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Decision {
    Allow,
    BadDomain,
    BadMapName,
    NotSecurenet,
    DeniedByPolicy,

    /// The map to probe for `YP_SECURE` could not be opened. Callers
    /// that do not need the map to exist (such as transfer requests)
    /// may treat this as success.
    MapNotFound,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Self::Allow
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Allow => "allowed",
            Self::BadDomain => "bad domain",
            Self::BadMapName => "bad map name",
            Self::NotSecurenet => "not in securenets",
            Self::DeniedByPolicy => "denied by policy",
            Self::MapNotFound => "map not found",
        })
    }
}

/// The view of the map store that the access check needs.
pub trait MapProbe {
    /// Returns whether `domain` exists.
    fn has_domain(&self, domain: &str) -> bool;

    /// Returns whether `map` in `domain` carries the `YP_SECURE` key,
    /// or `None` if the map cannot be opened.
    fn is_secure(&mut self, domain: &str, map: &str) -> Option<bool>;
}

impl<O: Opener> MapProbe for HandleCache<O> {
    fn has_domain(&self, domain: &str) -> bool {
        self.opener().has_domain(domain)
    }

    fn is_secure(&mut self, domain: &str, map: &str) -> Option<bool> {
        match self.open(domain, map) {
            Ok(handle) => {
                let secure = handle.exists(db::SECURE_KEY);
                if let Err(e) = self.close(&handle) {
                    debug!("Failed to close {}/{}: {}", domain, map, e);
                }
                Some(secure)
            }
            Err(db::Error::InUse | db::Error::CacheFull) => self
                .opener()
                .open(domain, map)
                .ok()
                .map(|handle| handle.exists(db::SECURE_KEY)),
            Err(_) => None,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// ACCESS RULES                                                       //
////////////////////////////////////////////////////////////////////////

/// A snapshot of the access rules in effect.
#[derive(Clone, Debug, Default)]
pub struct AccessRules {
    securenets: Securenets,
    policy: Vec<PolicyEntry>,
}

impl AccessRules {
    pub fn new(securenets: Securenets, policy: Vec<PolicyEntry>) -> Self {
        Self { securenets, policy }
    }

    pub fn securenets(&self) -> &Securenets {
        &self.securenets
    }

    pub fn policy(&self) -> &[PolicyEntry] {
        &self.policy
    }

    /// Decides whether a request from `caller` involving `map` in
    /// `domain` may proceed. Either may be absent for requests that do
    /// not name one.
    ///
    /// The decision depends only on the arguments, the rules, and the
    /// state of the map store as seen through `probe`.
    pub fn decide(
        &self,
        caller: SocketAddr,
        domain: Option<&str>,
        map: Option<&str>,
        probe: &mut impl MapProbe,
    ) -> Decision {
        if let Some(domain) = domain {
            if !is_valid_domain_name(domain) || !probe.has_domain(domain) {
                return Decision::BadDomain;
            }
        }
        if let Some(map) = map {
            if map.is_empty() || map.contains('/') {
                return Decision::BadMapName;
            }
        }

        let addr = canonical_ip(caller.ip());
        if !self.securenets.allows(addr) {
            return Decision::NotSecurenet;
        }
        let map = match map {
            Some(map) => map,
            None => return Decision::Allow,
        };
        let privileged = caller.port() < RESERVED_PORT_LIMIT;

        match self.policy.iter().find(|e| e.matches(addr, domain, map)) {
            Some(entry) => match entry.security {
                Security::None => Decision::Allow,
                Security::Deny => Decision::DeniedByPolicy,
                Security::Port if privileged => Decision::Allow,
                Security::Port => Decision::DeniedByPolicy,
            },
            None => match domain.map(|domain| probe.is_secure(domain, map)) {
                None | Some(Some(false)) => Decision::Allow,
                Some(Some(true)) if privileged => Decision::Allow,
                Some(Some(true)) => Decision::DeniedByPolicy,
                Some(None) => Decision::MapNotFound,
            },
        }
    }
}

/// Converts IPv4-mapped IPv6 addresses to IPv4.
pub fn canonical_ip(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

////////////////////////////////////////////////////////////////////////
// DECISION LOGGING                                                   //
////////////////////////////////////////////////////////////////////////

/// Logs access decisions. Refusals are logged at the warning level,
/// but only when the (address, decision) pair differs from that of the
/// previous request, so a misbehaving client cannot flood the log.
#[derive(Debug, Default)]
pub struct DecisionLog {
    last: Mutex<Option<(IpAddr, Decision)>>,
}

impl DecisionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a decision, logging it if appropriate. Returns whether a
    /// refusal warning was emitted.
    pub fn record(
        &self,
        caller: SocketAddr,
        procedure: &str,
        domain: Option<&str>,
        map: Option<&str>,
        decision: Decision,
    ) -> bool {
        let addr = canonical_ip(caller.ip());
        debug!(
            "{}connect from {}",
            if decision.is_allowed() { "" } else { "refused " },
            addr
        );
        let mut last = self.last.lock().unwrap();
        let warned = !decision.is_allowed() && *last != Some((addr, decision));
        if warned {
            warn!(
                "refused connect from {}:{} to procedure {} ({},{}): {}",
                addr,
                caller.port(),
                procedure,
                domain.unwrap_or_default(),
                map.unwrap_or_default(),
                decision
            );
        }
        *last = Some((addr, decision));
        warned
    }
}

/// A shareable, atomically replaceable [`AccessRules`] snapshot.
#[derive(Debug, Default)]
pub struct SharedRules {
    current: RwLock<Arc<AccessRules>>,
}

impl SharedRules {
    pub fn new(rules: AccessRules) -> Self {
        Self {
            current: RwLock::new(Arc::new(rules)),
        }
    }

    /// Returns the rules currently in effect.
    pub fn get(&self) -> Arc<AccessRules> {
        self.current.read().unwrap().clone()
    }

    /// Replaces the rules. Requests already holding the old snapshot
    /// finish with it.
    pub fn set(&self, rules: AccessRules) {
        *self.current.write().unwrap() = Arc::new(rules);
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
