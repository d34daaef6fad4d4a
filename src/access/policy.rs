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

//! Parsing of the server policy file (`ypserv.conf`).
//!
//! The file holds a few server options and the policy table. Each
//! non-blank line that does not start with `#` is either an option
//!
//! ```text
//! files: 30
//! dns: no
//! xfr_check_port: yes
//! trusted_master: nis-master.example.com
//! ```
//!
//! or a policy table entry of the form
//! `network[/mask]:domain:map:security`, where the network may be a
//! partial dotted quad (`10`, `10.0`, `10.0.0`) or `*`, the domain and
//! map may be `*`, and the security is `none`, `deny`, or `port`.
//! Entries are matched in file order and the first match wins.

use std::fmt;
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use log::{debug, info, warn};

/// The default number of cached map handles.
pub const DEFAULT_FILES: usize = 30;

/// The default SLP registration timeout, in seconds.
pub const DEFAULT_SLP_TIMEOUT: u64 = 3600;

////////////////////////////////////////////////////////////////////////
// POLICY ENTRIES                                                     //
////////////////////////////////////////////////////////////////////////

/// The access level granted by a policy entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Security {
    /// Access is allowed.
    None,

    /// Access is denied.
    Deny,

    /// Access is allowed only from reserved ports.
    Port,
}

/// The hosts a policy entry applies to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Hosts {
    Any,
    V4 { network: Ipv4Addr, mask: Ipv4Addr },
}

impl Hosts {
    fn matches(&self, addr: IpAddr) -> bool {
        match (self, addr) {
            (Self::Any, _) => true,
            (Self::V4 { network, mask }, IpAddr::V4(addr)) => {
                u32::from(addr) & u32::from(*mask) == u32::from(*network)
            }
            (Self::V4 { .. }, IpAddr::V6(_)) => false,
        }
    }
}

impl fmt::Display for Hosts {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::V4 { network, mask } => write!(f, "{}/{}", network, mask),
        }
    }
}

/// A policy table entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PolicyEntry {
    pub hosts: Hosts,
    pub domain: String,
    pub map: String,
    pub security: Security,
}

impl PolicyEntry {
    /// Returns whether this entry applies to a request from `addr` for
    /// `map` in `domain`. A request without a domain only matches
    /// entries whose domain is `*`.
    pub fn matches(&self, addr: IpAddr, domain: Option<&str>, map: &str) -> bool {
        self.hosts.matches(addr)
            && (self.domain == "*" || Some(self.domain.as_str()) == domain)
            && (self.map == "*" || self.map == map)
    }
}

////////////////////////////////////////////////////////////////////////
// THE POLICY FILE                                                    //
////////////////////////////////////////////////////////////////////////

/// SLP registration modes. Registration itself is not supported; the
/// setting is only recorded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Slp {
    No,
    Yes,
    Domain,
}

/// The parsed contents of a policy file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PolicyFile {
    /// The policy table, in file order.
    pub entries: Vec<PolicyEntry>,

    /// The number of map handles to cache (at most 255).
    pub files: usize,

    /// Whether DNS fallback was requested.
    pub dns: bool,

    pub slp: Slp,
    pub slp_timeout: u64,

    /// A master host trusted for transfers of maps not yet present
    /// locally.
    pub trusted_master: Option<String>,

    /// Whether transfer requests must come from reserved ports.
    pub xfr_check_port: bool,
}

impl Default for PolicyFile {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            files: DEFAULT_FILES,
            dns: false,
            slp: Slp::No,
            slp_timeout: DEFAULT_SLP_TIMEOUT,
            trusted_master: None,
            xfr_check_port: false,
        }
    }
}

impl PolicyFile {
    /// Parses the contents of a policy file. Lines that cannot be
    /// parsed are logged and ignored.
    pub fn parse(text: &str) -> Self {
        let mut file = Self::default();
        for (index, line) in text.lines().enumerate() {
            if let Err(e) = file.parse_line(line) {
                warn!("Policy file line {}: {}; ignoring line", index + 1, e);
            }
        }
        file
    }

    /// Loads a policy file. A file that is missing or cannot be read
    /// yields the defaults, leaving the policy table empty.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No policy file found at {}", path.display());
                Self::default()
            }
            Err(e) => {
                warn!(
                    "Failed to read the policy file {}: {}; the policy table is now empty",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    fn parse_line(&mut self, line: &str) -> Result<(), ParseError> {
        let line = line.trim_start();
        match line.chars().next() {
            None | Some('#') => Ok(()),
            Some(c) if c.is_ascii_digit() || c == '*' => {
                let entry = parse_entry(line)?;
                debug!(
                    "Policy entry: {}:{}:{}:{:?}",
                    entry.hosts, entry.domain, entry.map, entry.security
                );
                self.entries.push(entry);
                Ok(())
            }
            Some(_) => self.parse_option(line),
        }
    }

    fn parse_option(&mut self, line: &str) -> Result<(), ParseError> {
        let (keyword, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::UnknownDirective(line.trim().to_owned()))?;
        let keyword = keyword.trim().to_ascii_lowercase();
        let value = value.split_whitespace().next().unwrap_or_default();
        match keyword.as_str() {
            "files" => {
                self.files = value.parse::<usize>().unwrap_or(DEFAULT_FILES).min(255);
            }
            "dns" => {
                // Once enabled, DNS fallback is not switched off again.
                if parse_yes_no("dns", value)? {
                    self.dns = true;
                }
            }
            "slp" => {
                self.slp = match value.to_ascii_lowercase().as_str() {
                    "yes" => Slp::Yes,
                    "domain" => Slp::Domain,
                    "no" => Slp::No,
                    _ => return Err(ParseError::unknown_option("slp", value)),
                };
                if self.slp != Slp::No {
                    info!("SLP registration is not supported; the slp option has no effect");
                }
            }
            "slp_timeout" => {
                if let Ok(timeout) = value.parse() {
                    self.slp_timeout = timeout;
                }
            }
            "sunos_kludge" | "tryresolve" => {
                info!("The {} option is no longer supported", keyword);
            }
            "trusted_master" => {
                if value.is_empty() {
                    return Err(ParseError::MissingField("trusted master"));
                }
                self.trusted_master = Some(value.to_owned());
            }
            "xfr_check_port" => {
                self.xfr_check_port = parse_yes_no("xfr_check_port", value)?;
            }
            _ => return Err(ParseError::UnknownDirective(keyword)),
        }
        Ok(())
    }
}

fn parse_yes_no(option: &'static str, value: &str) -> Result<bool, ParseError> {
    if value.eq_ignore_ascii_case("yes") {
        Ok(true)
    } else if value.eq_ignore_ascii_case("no") {
        Ok(false)
    } else {
        Err(ParseError::unknown_option(option, value))
    }
}

/// Parses a `network:domain:map:security` policy line. A legacy fifth
/// field is tolerated; anything past it is not.
fn parse_entry(line: &str) -> Result<PolicyEntry, ParseError> {
    let mut fields = line
        .split(':')
        .map(|field| field.split_whitespace().next().unwrap_or_default())
        .filter(|field| !field.is_empty());
    let network = fields.next().ok_or(ParseError::MissingField("network"))?;
    let domain = fields.next().ok_or(ParseError::MissingField("domain"))?;
    let map = fields.next().ok_or(ParseError::MissingField("map"))?;
    let security = fields.next().ok_or(ParseError::MissingField("security"))?;
    let _legacy = fields.next();
    if let Some(bogus) = fields.next() {
        return Err(ParseError::BogusData(bogus.to_owned()));
    }

    let hosts = if network.starts_with('*') {
        Hosts::Any
    } else {
        parse_network(network).ok_or_else(|| ParseError::MalformedNetwork(network.to_owned()))?
    };
    let security = match security.to_ascii_lowercase().as_str() {
        "none" => Security::None,
        "deny" => Security::Deny,
        "port" => Security::Port,
        _ => return Err(ParseError::UnknownSecurity(security.to_owned())),
    };
    Ok(PolicyEntry {
        hosts,
        domain: domain.to_owned(),
        map: map.to_owned(),
        security,
    })
}

/// Parses a network specification such as `10`, `192.168.`,
/// `172.16.0.0/255.240.0.0`, or `10.1/16`.
///
/// A partial network is padded with zero octets. Without an explicit
/// mask, the mask covers the octets given. A mask without dots that is
/// at most 32 is a prefix length; otherwise it is a (possibly partial)
/// dotted quad.
fn parse_network(spec: &str) -> Option<Hosts> {
    let (network, mask) = match spec.split_once('/') {
        Some((network, mask)) => (network, Some(mask).filter(|m| !m.is_empty())),
        None => (spec, None),
    };
    let (network, given) = parse_partial_quad(network)?;
    let mask = match mask {
        Some(mask) if !mask.contains('.') => {
            let prefix: u32 = mask.parse().ok()?;
            if prefix <= 32 {
                Ipv4Addr::from(u32::MAX.checked_shl(32 - prefix).unwrap_or(0))
            } else {
                parse_partial_quad(mask)?.0
            }
        }
        Some(mask) => parse_partial_quad(mask)?.0,
        None => Ipv4Addr::from(u32::MAX.checked_shl(32 - 8 * given as u32).unwrap_or(0)),
    };
    Some(Hosts::V4 { network, mask })
}

/// Parses up to four dotted decimal octets, padding with zeros.
/// Returns the address and the number of octets actually given (a
/// trailing dot does not count as an octet).
fn parse_partial_quad(s: &str) -> Option<(Ipv4Addr, usize)> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return None;
    }
    let s = s.strip_suffix('.').unwrap_or(s);
    let mut octets = [0u8; 4];
    let mut given = 0;
    for part in s.split('.') {
        if given == 4 {
            return None;
        }
        octets[given] = part.parse().ok()?;
        given += 1;
    }
    Some((Ipv4Addr::from(octets), given))
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error parsing a line of the policy file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ParseError {
    MissingField(&'static str),
    MalformedNetwork(String),
    UnknownSecurity(String),
    BogusData(String),
    UnknownOption { option: &'static str, value: String },
    UnknownDirective(String),
}

impl ParseError {
    fn unknown_option(option: &'static str, value: &str) -> Self {
        Self::UnknownOption {
            option,
            value: value.to_owned(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::MissingField(field) => write!(f, "no {} given", field),
            Self::MalformedNetwork(network) => {
                write!(f, "malformed network/netmask entry \"{}\"", network)
            }
            Self::UnknownSecurity(security) => {
                write!(f, "unknown security option \"{}\"", security)
            }
            Self::BogusData(data) => write!(f, "bogus data \"{}\"", data),
            Self::UnknownOption { option, value } => {
                write!(f, "unknown {} option \"{}\"", option, value)
            }
            Self::UnknownDirective(directive) => write!(f, "parse error at \"{}\"", directive),
        }
    }
}

impl std::error::Error for ParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(network: [u8; 4], mask: [u8; 4]) -> Hosts {
        Hosts::V4 {
            network: network.into(),
            mask: mask.into(),
        }
    }

    #[test]
    fn partial_networks_are_padded() {
        assert_eq!(parse_network("10"), Some(hosts([10, 0, 0, 0], [255, 0, 0, 0])));
        assert_eq!(parse_network("10."), Some(hosts([10, 0, 0, 0], [255, 0, 0, 0])));
        assert_eq!(
            parse_network("192.168"),
            Some(hosts([192, 168, 0, 0], [255, 255, 0, 0]))
        );
        assert_eq!(
            parse_network("192.168.1"),
            Some(hosts([192, 168, 1, 0], [255, 255, 255, 0]))
        );
        assert_eq!(
            parse_network("192.168.1.7"),
            Some(hosts([192, 168, 1, 7], [255, 255, 255, 255]))
        );
    }

    #[test]
    fn explicit_masks_are_honored() {
        assert_eq!(
            parse_network("172.16.0.0/255.240.0.0"),
            Some(hosts([172, 16, 0, 0], [255, 240, 0, 0]))
        );
        assert_eq!(
            parse_network("172.16.0.0/255.255"),
            Some(hosts([172, 16, 0, 0], [255, 255, 0, 0]))
        );
        assert_eq!(
            parse_network("10.1.0.0/16"),
            Some(hosts([10, 1, 0, 0], [255, 255, 0, 0]))
        );
    }

    #[test]
    fn malformed_networks_are_rejected() {
        assert_eq!(parse_network("10.0.0.0.0"), None);
        assert_eq!(parse_network("10.x"), None);
        assert_eq!(parse_network("300.1"), None);
        assert_eq!(parse_network(""), None);
    }

    #[test]
    fn parse_reads_options_and_entries() {
        let file = PolicyFile::parse(
            "# comment\n\
             files: 400\n\
             dns: yes\n\
             dns: no\n\
             xfr_check_port: yes\n\
             trusted_master: master.example.com extra\n\
             slp: domain\n\
             slp_timeout: 60\n\
             \n\
             \x20  127.0.0.0/255.0.0.0 : * : * : none\n\
             192.168.1 : example : shadow.byname : port\n\
             * : * : passwd.adjunct.byname : deny\n",
        );
        assert_eq!(file.files, 255);
        assert!(file.dns);
        assert!(file.xfr_check_port);
        assert_eq!(file.trusted_master.as_deref(), Some("master.example.com"));
        assert_eq!(file.slp, Slp::Domain);
        assert_eq!(file.slp_timeout, 60);
        assert_eq!(
            file.entries,
            vec![
                PolicyEntry {
                    hosts: hosts([127, 0, 0, 0], [255, 0, 0, 0]),
                    domain: "*".into(),
                    map: "*".into(),
                    security: Security::None,
                },
                PolicyEntry {
                    hosts: hosts([192, 168, 1, 0], [255, 255, 255, 0]),
                    domain: "example".into(),
                    map: "shadow.byname".into(),
                    security: Security::Port,
                },
                PolicyEntry {
                    hosts: Hosts::Any,
                    domain: "*".into(),
                    map: "passwd.adjunct.byname".into(),
                    security: Security::Deny,
                },
            ]
        );
    }

    #[test]
    fn bad_lines_are_ignored() {
        let file = PolicyFile::parse(
            "10:example\n\
             10:example:hosts:maybe\n\
             10:example:hosts:none:legacy:bogus\n\
             bogus line\n\
             sunos_kludge: yes\n\
             dns: perhaps\n\
             10:example:hosts:NONE:legacy\n",
        );
        assert!(!file.dns);
        assert_eq!(file.entries.len(), 1);
        assert_eq!(file.entries[0].security, Security::None);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = PolicyFile::load(dir.path().join("ypserv.conf"));
        assert_eq!(file, PolicyFile::default());
        assert_eq!(file.files, DEFAULT_FILES);
    }

    #[test]
    fn unreadable_file_leaves_the_table_empty() {
        let dir = tempfile::tempdir().unwrap();
        let file = PolicyFile::load(dir.path());
        assert!(file.entries.is_empty());
        assert_eq!(file, PolicyFile::default());
    }

    #[test]
    fn entries_match_by_network_domain_and_map() {
        let entry = PolicyEntry {
            hosts: hosts([10, 0, 0, 0], [255, 0, 0, 0]),
            domain: "example".into(),
            map: "*".into(),
            security: Security::Deny,
        };
        let inside: IpAddr = "10.2.3.4".parse().unwrap();
        let outside: IpAddr = "11.2.3.4".parse().unwrap();
        assert!(entry.matches(inside, Some("example"), "hosts.byname"));
        assert!(!entry.matches(outside, Some("example"), "hosts.byname"));
        assert!(!entry.matches(inside, Some("other"), "hosts.byname"));
        assert!(!entry.matches(inside, None, "hosts.byname"));
        assert!(!entry.matches("::1".parse().unwrap(), Some("example"), "hosts.byname"));
    }
}
