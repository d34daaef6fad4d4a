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

//! Handlers for the lookup procedures of the YP server program.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use super::{ReceivedInfo, Server};
use crate::access::Decision;
use crate::db::{self, parse_order_number, Database, FileMap};
use crate::proto::yp::{Procedure, ReqKey, ReqNokey, RespKeyVal, RespMaplist, RespMaster, RespOrder, RespVal};
use crate::proto::Stat;

/// Returns the status reported for a refused request, or `None` if the
/// request was allowed.
pub(super) fn refusal_status(decision: Decision) -> Option<Stat> {
    match decision {
        Decision::Allow => None,
        Decision::BadDomain => Some(Stat::NoDom),
        Decision::BadMapName => Some(Stat::BadArgs),
        Decision::NotSecurenet | Decision::DeniedByPolicy | Decision::MapNotFound => {
            Some(Stat::NoMap)
        }
    }
}

/// Returns the status reported when a map cannot be opened.
fn open_failure_status(domain: &str, map: &str, err: &db::Error) -> Stat {
    match err {
        db::Error::Io(_) | db::Error::InvalidMapName => {
            debug!("Cannot open {}/{}: {}", domain, map, err);
            Stat::NoMap
        }
        db::Error::Corrupt(_) => {
            warn!("Map {}/{} is damaged: {}", domain, map, err);
            Stat::BadDb
        }
        _ => {
            warn!("Cannot open {}/{}: {}", domain, map, err);
            Stat::YpErr
        }
    }
}

impl Server {
    /// Checks access for a request naming `map` in `domain`.
    fn check_map(
        &self,
        info: ReceivedInfo,
        procedure: Procedure,
        domain: &str,
        map: &str,
    ) -> Result<(), Stat> {
        let decision = self.decide(info, procedure, Some(domain), Some(map));
        match refusal_status(decision) {
            Some(stat) => Err(stat),
            None => Ok(()),
        }
    }

    /// Runs `f` with `map` open, returning the status to report if the
    /// map cannot be opened. The handle goes back to the cache
    /// afterwards.
    pub(super) fn with_map<T>(
        &self,
        domain: &str,
        map: &str,
        f: impl FnOnce(&Arc<FileMap>) -> T,
    ) -> Result<T, Stat> {
        let mut cache = self.cache.lock().unwrap();
        let handle = cache
            .open(domain, map)
            .map_err(|e| open_failure_status(domain, map, &e))?;
        let result = f(&handle);
        if let Err(e) = cache.close(&handle) {
            warn!("Failed to return {}/{} to the cache: {}", domain, map, e);
        }
        Ok(result)
    }

    /// Checks access and runs `f` with the map open.
    pub(super) fn serve_map<T>(
        &self,
        info: ReceivedInfo,
        procedure: Procedure,
        req: &ReqNokey,
        f: impl FnOnce(&Arc<FileMap>) -> T,
    ) -> Result<T, Stat> {
        debug!(
            "{}(\"{}\", \"{}\") from {}",
            procedure.name(),
            req.domain,
            req.map,
            info.source()
        );
        self.check_map(info, procedure, &req.domain, &req.map)?;
        self.with_map(&req.domain, &req.map, f)
    }

    pub(super) fn null(&self, info: ReceivedInfo) -> bool {
        self.decide(info, Procedure::Null, None, None).is_allowed()
    }

    pub(super) fn domain(&self, domain: &str, procedure: Procedure, info: ReceivedInfo) -> bool {
        debug!("{}(\"{}\") from {}", procedure.name(), domain, info.source());
        self.decide(info, procedure, Some(domain), None).is_allowed()
    }

    pub(super) fn clear(&self, info: ReceivedInfo) {
        if self.decide(info, Procedure::Clear, None, None).is_allowed() {
            self.clear_cache();
        }
    }

    pub(super) fn match_key(&self, req: &ReqKey, info: ReceivedInfo) -> RespVal {
        debug!(
            "ypproc_match(\"{}\", \"{}\", \"{}\") from {}",
            req.domain,
            req.map,
            String::from_utf8_lossy(&req.key),
            info.source()
        );
        if let Err(stat) = self.check_map(info, Procedure::Match, &req.domain, &req.map) {
            return RespVal::status(stat);
        }
        if req.key.first().map_or(true, |&octet| octet == 0) {
            return RespVal::status(Stat::BadArgs);
        }
        let found = self.with_map(&req.domain, &req.map, |map| {
            map.fetch(&req.key).map(<[u8]>::to_vec)
        });
        match found {
            Ok(Some(val)) => RespVal {
                stat: Stat::True,
                val,
            },
            Ok(None) => RespVal::status(Stat::NoKey),
            Err(stat) => RespVal::status(stat),
        }
    }

    pub(super) fn first(&self, req: &ReqNokey, info: ReceivedInfo) -> RespKeyVal {
        let found = self.serve_map(info, Procedure::First, req, |map| {
            map.first_user().map(key_val)
        });
        match found {
            Ok(Some(resp)) => resp,
            Ok(None) => RespKeyVal::status(Stat::NoKey),
            Err(stat) => RespKeyVal::status(stat),
        }
    }

    pub(super) fn next(&self, req: &ReqKey, info: ReceivedInfo) -> RespKeyVal {
        let nokey = ReqNokey {
            domain: req.domain.clone(),
            map: req.map.clone(),
        };
        let found = self.serve_map(info, Procedure::Next, &nokey, |map| {
            map.next_user(&req.key).map(key_val)
        });
        match found {
            Ok(Some(resp)) => resp,
            Ok(None) => RespKeyVal::status(Stat::NoMore),
            Err(stat) => RespKeyVal::status(stat),
        }
    }

    pub(super) fn master(&self, req: &ReqNokey, info: ReceivedInfo) -> RespMaster {
        let found = self.serve_map(info, Procedure::Master, req, |map| {
            map.fetch(db::MASTER_NAME_KEY)
                .map(|peer| String::from_utf8_lossy(peer).into_owned())
        });
        match found {
            Ok(Some(peer)) => RespMaster {
                stat: Stat::True,
                peer,
            },
            Ok(None) => {
                warn!("Map {}/{} has no master name", req.domain, req.map);
                RespMaster {
                    stat: Stat::BadDb,
                    peer: String::new(),
                }
            }
            Err(stat) => RespMaster {
                stat,
                peer: String::new(),
            },
        }
    }

    pub(super) fn order(&self, req: &ReqNokey, info: ReceivedInfo) -> RespOrder {
        let found = self.serve_map(info, Procedure::Order, req, |map| {
            map.fetch(db::LAST_MODIFIED_KEY).map(parse_order_number)
        });
        let ordernum = match found {
            Ok(Some(ordernum)) => ordernum,
            Ok(None) => {
                let modified = self.maps.modified(&req.domain, &req.map);
                unix_seconds(modified.unwrap_or_else(|_| SystemTime::now()))
            }
            Err(stat) => return RespOrder { stat, ordernum: 0 },
        };
        RespOrder {
            stat: Stat::True,
            ordernum,
        }
    }

    pub(super) fn maplist(&self, domain: &str, info: ReceivedInfo) -> RespMaplist {
        debug!("ypproc_maplist(\"{}\") from {}", domain, info.source());
        let refused = |stat| RespMaplist {
            stat,
            maps: Vec::new(),
        };
        match self.decide(info, Procedure::Maplist, Some(domain), None) {
            Decision::Allow => (),
            Decision::BadDomain => return refused(Stat::NoDom),
            _ => return refused(Stat::NoMap),
        }
        match self.maps.list_maps(domain) {
            Ok(mut maps) => {
                maps.sort();
                RespMaplist {
                    stat: Stat::True,
                    maps,
                }
            }
            Err(e) => {
                warn!("Cannot list maps of {}: {}", domain, e);
                refused(Stat::BadDb)
            }
        }
    }
}

fn key_val((key, val): (&[u8], &[u8])) -> RespKeyVal {
    RespKeyVal {
        stat: Stat::True,
        key: key.to_vec(),
        val: val.to_vec(),
    }
}

fn unix_seconds(time: SystemTime) -> u32 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0, |since| since.as_secs() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusals_collapse_to_few_statuses() {
        assert_eq!(refusal_status(Decision::Allow), None);
        assert_eq!(refusal_status(Decision::BadDomain), Some(Stat::NoDom));
        assert_eq!(refusal_status(Decision::BadMapName), Some(Stat::BadArgs));
        assert_eq!(refusal_status(Decision::NotSecurenet), Some(Stat::NoMap));
        assert_eq!(refusal_status(Decision::DeniedByPolicy), Some(Stat::NoMap));
        assert_eq!(refusal_status(Decision::MapNotFound), Some(Stat::NoMap));
    }

    #[test]
    fn open_failures_are_classified() {
        let missing = db::Error::Io(std::io::ErrorKind::NotFound.into());
        assert_eq!(open_failure_status("d", "m", &missing), Stat::NoMap);
        assert_eq!(
            open_failure_status("d", "m", &db::Error::Corrupt("bad magic")),
            Stat::BadDb
        );
        assert_eq!(open_failure_status("d", "m", &db::Error::CacheFull), Stat::YpErr);
    }
}
