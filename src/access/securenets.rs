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

//! The secure-network allowlist.
//!
//! A securenets file lists the networks allowed to talk to the server
//! at all. Each non-comment line is one of
//!
//! ```text
//! 255.255.255.0    192.168.1.0
//! host             192.168.2.7
//! 10.0.0.0/8
//! ffff:ffff::      2001:db8::
//! ```
//!
//! An address matches an entry if it is of the same family and
//! `address & mask == network`. An empty list allows everyone.

use std::fmt;
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::str::FromStr;

use log::{debug, warn};

/// One securenets entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Securenet {
    mask: IpAddr,
    network: IpAddr,
}

impl Securenet {
    /// Creates an entry. Returns `None` if `mask` and `network` are of
    /// different families.
    pub fn new(mask: IpAddr, network: IpAddr) -> Option<Self> {
        if mask.is_ipv4() == network.is_ipv4() {
            Some(Self { mask, network })
        } else {
            None
        }
    }

    /// Creates an entry from a network and a prefix length. Returns
    /// `None` if the prefix is too long for the address family.
    pub fn with_prefix(network: IpAddr, prefix: u32) -> Option<Self> {
        let mask = match network {
            IpAddr::V4(_) if prefix <= 32 => {
                IpAddr::V4(Ipv4Addr::from(u32::MAX.checked_shl(32 - prefix).unwrap_or(0)))
            }
            IpAddr::V6(_) if prefix <= 128 => {
                IpAddr::V6(Ipv6Addr::from(u128::MAX.checked_shl(128 - prefix).unwrap_or(0)))
            }
            _ => return None,
        };
        Some(Self { mask, network })
    }

    /// Returns whether `addr` falls in this network.
    pub fn matches(&self, addr: IpAddr) -> bool {
        match (self.mask, self.network, addr) {
            (IpAddr::V4(mask), IpAddr::V4(network), IpAddr::V4(addr)) => {
                u32::from(addr) & u32::from(mask) == u32::from(network)
            }
            (IpAddr::V6(mask), IpAddr::V6(network), IpAddr::V6(addr)) => {
                u128::from(addr) & u128::from(mask) == u128::from(network)
            }
            _ => false,
        }
    }

    /// Parses one non-comment line. The error is a description of what
    /// is wrong with the line.
    fn parse_line(line: &str) -> Result<Self, String> {
        let mut fields = line.split_whitespace();
        let first = fields.next().unwrap_or_default();
        let entry = match fields.next() {
            None => {
                let (network, prefix) = first
                    .split_once('/')
                    .ok_or_else(|| "malformed line".to_owned())?;
                let network: IpAddr = network
                    .parse()
                    .map_err(|_| format!("{} is not a correct network address", network))?;
                let prefix: u32 = prefix
                    .parse()
                    .map_err(|_| format!("{} is not a correct prefix length", prefix))?;
                Self::with_prefix(network, prefix)
                    .ok_or_else(|| format!("{} is not a correct prefix length", prefix))?
            }
            Some(second) => {
                let network: IpAddr = second
                    .parse()
                    .map_err(|_| format!("{} is not a correct network address", second))?;
                let mask = if first == "host" {
                    match network {
                        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::BROADCAST),
                        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::from(u128::MAX)),
                    }
                } else {
                    first
                        .parse()
                        .map_err(|_| format!("{} is not a correct netmask", first))?
                };
                Self::new(mask, network)
                    .ok_or_else(|| "netmask and network are of different families".to_owned())?
            }
        };
        if fields.next().is_some() {
            return Err("malformed line".to_owned());
        }
        Ok(entry)
    }
}

impl FromStr for Securenet {
    type Err = InvalidSecurenet;

    /// Parses an entry in any of the forms a securenets file line may
    /// take.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_line(s.trim()).map_err(InvalidSecurenet)
    }
}

impl fmt::Display for Securenet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.mask, self.network)
    }
}

/// The error returned when a securenets entry cannot be parsed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InvalidSecurenet(String);

impl fmt::Display for InvalidSecurenet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for InvalidSecurenet {}

/// A securenets list.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Securenets {
    entries: Vec<Securenet>,
}

impl Securenets {
    /// Parses the contents of a securenets file. Malformed lines are
    /// logged and skipped.
    pub fn parse(text: &str) -> Self {
        let mut entries = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match Securenet::parse_line(line) {
                Ok(entry) => {
                    debug!("Found securenet: {}", entry);
                    entries.push(entry);
                }
                Err(reason) => warn!("securenets({}): {}, ignoring it", index + 1, reason),
            }
        }
        Self { entries }
    }

    /// Loads a securenets file. A missing file yields an empty list
    /// (which allows everyone); other errors are returned.
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(text) => Ok(Self::parse(&text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("No securenets file found at {}; allowing all hosts", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Returns whether `addr` may talk to the server.
    pub fn allows(&self, addr: IpAddr) -> bool {
        self.entries.is_empty() || self.entries.iter().any(|entry| entry.matches(addr))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Extend<Securenet> for Securenets {
    fn extend<I: IntoIterator<Item = Securenet>>(&mut self, iter: I) {
        self.entries.extend(iter);
    }
}

impl FromIterator<Securenet> for Securenets {
    fn from_iter<I: IntoIterator<Item = Securenet>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# local networks
255.255.255.0   192.168.1.0
host            10.1.2.3

10.8.0.0/16
ffff:ffff::     2001:db8::
not-a-mask      192.168.5.0
255.0.0.0
";

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn parse_skips_comments_and_malformed_lines() {
        assert_eq!(Securenets::parse(SAMPLE).len(), 4);
    }

    #[test]
    fn allows_matching_addresses() {
        let nets = Securenets::parse(SAMPLE);
        assert!(nets.allows(ip("192.168.1.77")));
        assert!(nets.allows(ip("10.1.2.3")));
        assert!(nets.allows(ip("10.8.200.1")));
        assert!(nets.allows(ip("2001:db8::1")));
        assert!(!nets.allows(ip("10.1.2.4")));
        assert!(!nets.allows(ip("192.168.5.1")));
        assert!(!nets.allows(ip("2001:db9::1")));
    }

    #[test]
    fn families_must_match() {
        let nets: Securenets = [Securenet::with_prefix(ip("0.0.0.0"), 0).unwrap()]
            .into_iter()
            .collect();
        assert!(nets.allows(ip("203.0.113.9")));
        assert!(!nets.allows(ip("::1")));
    }

    #[test]
    fn empty_list_allows_everyone() {
        let nets = Securenets::parse("# nothing here\n\n");
        assert!(nets.is_empty());
        assert!(nets.allows(ip("198.51.100.1")));
        assert!(nets.allows(ip("::1")));
    }

    #[test]
    fn missing_file_allows_everyone() {
        let dir = tempfile::tempdir().unwrap();
        let nets = Securenets::load(dir.path().join("securenets")).unwrap();
        assert!(nets.allows(ip("198.51.100.1")));
    }

    #[test]
    fn network_is_not_masked() {
        // A network with host bits set can never match, as with the
        // traditional securenets semantics.
        let nets = Securenets::parse("255.255.255.0 192.168.1.1\n");
        assert!(!nets.allows(ip("192.168.1.1")));
    }

    #[test]
    fn entries_parse_from_strings() {
        let entry: Securenet = "10.0.0.0/8".parse().unwrap();
        assert!(entry.matches(ip("10.1.2.3")));
        let entry: Securenet = " host 192.0.2.7 ".parse().unwrap();
        assert!(entry.matches(ip("192.0.2.7")));
        assert!(!entry.matches(ip("192.0.2.8")));
        assert!("10.0.0.0/40".parse::<Securenet>().is_err());
        assert!("255.0.0.0 2001:db8::".parse::<Securenet>().is_err());
    }
}
