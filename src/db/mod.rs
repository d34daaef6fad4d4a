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

//! Facilities for storing and accessing maps.
//!
//! A map is an ordered key/value store. The [`Database`] trait
//! abstracts the handful of operations the server needs from one
//! (fetch, existence checks, and ordered iteration), and the [`Opener`]
//! trait abstracts how a map is found and opened given its domain and
//! name. The provided implementations are [`FileMap`], a map loaded
//! from a database file, and [`MapDir`], which locates map files in
//! per-domain directories beneath a root directory.
//!
//! Opening a map is comparatively expensive, so the server keeps
//! recently used maps open in a [`HandleCache`].
//!
//! ## Reserved keys
//!
//! Besides the user's records, a map carries metadata records whose
//! keys start with `YP_`. These are hidden from enumeration (see
//! [`Database::first_user`] and [`Database::next_user`]).

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

mod cache;
mod file;

pub use cache::{HandleCache, MAX_CAPACITY};
pub use file::{write_map, FileMap};

/// The prefix of reserved metadata keys.
pub const RESERVED_PREFIX: &[u8] = b"YP_";

/// The key whose value names the map's master server.
pub const MASTER_NAME_KEY: &[u8] = b"YP_MASTER_NAME";

/// The key whose value is the map's order number, in decimal.
pub const LAST_MODIFIED_KEY: &[u8] = b"YP_LAST_MODIFIED";

/// The key whose presence restricts the map to privileged ports.
pub const SECURE_KEY: &[u8] = b"YP_SECURE";

/// The key whose presence marks the map for DNS fallback lookups.
pub const INTERDOMAIN_KEY: &[u8] = b"YP_INTERDOMAIN";

/// Returns whether `key` is a reserved metadata key.
pub fn is_reserved_key(key: &[u8]) -> bool {
    key.starts_with(RESERVED_PREFIX)
}

////////////////////////////////////////////////////////////////////////
// DATABASE AND OPENER TRAITS                                         //
////////////////////////////////////////////////////////////////////////

/// An open map.
///
/// Iteration follows the store's natural key order, which is not
/// otherwise specified.
pub trait Database {
    /// Returns the first record of the map.
    fn first(&self) -> Option<(&[u8], &[u8])>;

    /// Returns the record following the one with `key`. Returns `None`
    /// both at the end of the map and when `key` is not in the map.
    fn next(&self, key: &[u8]) -> Option<(&[u8], &[u8])>;

    /// Fetches the value stored under `key`.
    fn fetch(&self, key: &[u8]) -> Option<&[u8]>;

    /// Returns whether a record with `key` exists.
    fn exists(&self, key: &[u8]) -> bool {
        self.fetch(key).is_some()
    }

    /// Returns the first record that is not a reserved metadata record.
    fn first_user(&self) -> Option<(&[u8], &[u8])> {
        let mut record = self.first();
        while let Some((key, _)) = record {
            if !is_reserved_key(key) {
                break;
            }
            record = self.next(key);
        }
        record
    }

    /// Returns the first non-reserved record following the one with
    /// `key`.
    fn next_user(&self, key: &[u8]) -> Option<(&[u8], &[u8])> {
        let mut record = self.next(key);
        while let Some((key, _)) = record {
            if !is_reserved_key(key) {
                break;
            }
            record = self.next(key);
        }
        record
    }
}

/// Opens maps by domain and map name.
pub trait Opener {
    type Handle: Database + Send + Sync;

    /// Returns whether `domain` exists. The name is assumed to have
    /// already passed the syntactic checks of
    /// [`is_valid_domain_name`](crate::access::is_valid_domain_name).
    fn has_domain(&self, domain: &str) -> bool;

    fn open(&self, domain: &str, map: &str) -> Result<Self::Handle, Error>;
}

////////////////////////////////////////////////////////////////////////
// MAP DIRECTORIES                                                    //
////////////////////////////////////////////////////////////////////////

/// A root directory containing one subdirectory per domain, each
/// holding that domain's map files.
#[derive(Clone, Debug)]
pub struct MapDir {
    root: PathBuf,
}

impl MapDir {
    /// Creates a `MapDir` rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the directory of `domain`. The name is not validated.
    pub fn domain_path(&self, domain: &str) -> PathBuf {
        self.root.join(domain)
    }

    /// Returns the file of `map` in `domain`. The names are not
    /// validated.
    pub fn map_path(&self, domain: &str, map: &str) -> PathBuf {
        self.root.join(domain).join(map)
    }

    /// Lists the maps of `domain`: every directory entry whose name
    /// does not start with a dot.
    pub fn list_maps(&self, domain: &str) -> io::Result<Vec<String>> {
        let mut maps = Vec::new();
        for entry in fs::read_dir(self.domain_path(domain))? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    maps.push(name.to_owned());
                }
            }
        }
        Ok(maps)
    }

    /// Returns the modification time of a map file.
    pub fn modified(&self, domain: &str, map: &str) -> io::Result<SystemTime> {
        fs::metadata(self.map_path(domain, map))?.modified()
    }
}

impl Opener for MapDir {
    type Handle = FileMap;

    fn has_domain(&self, domain: &str) -> bool {
        self.domain_path(domain).is_dir()
    }

    fn open(&self, domain: &str, map: &str) -> Result<FileMap, Error> {
        FileMap::open(self.map_path(domain, map))
    }
}

////////////////////////////////////////////////////////////////////////
// ORDER NUMBERS                                                      //
////////////////////////////////////////////////////////////////////////

/// Parses an order number the way C's `atoi` would: leading
/// whitespace is skipped and parsing stops at the first non-digit. A
/// value with no leading digits is 0.
pub fn parse_order_number(value: &[u8]) -> u32 {
    value
        .iter()
        .skip_while(|b| b.is_ascii_whitespace())
        .take_while(|b| b.is_ascii_digit())
        .fold(0u32, |n, b| n.wrapping_mul(10).wrapping_add((b - b'0') as u32))
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error opening or accessing a map.
#[derive(Debug)]
pub enum Error {
    /// The map file could not be read.
    Io(io::Error),

    /// The map file is not a valid database.
    Corrupt(&'static str),

    /// The map name starts with a dot or contains a slash.
    InvalidMapName,

    /// The map is already open and in use. (Only returned by the
    /// [`HandleCache`].)
    InUse,

    /// Every cached handle is in use, so none could be evicted. (Only
    /// returned by the [`HandleCache`].)
    CacheFull,

    /// The handle being closed was not issued by the cache.
    UnknownHandle,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(err) => err.fmt(f),
            Self::Corrupt(reason) => write!(f, "corrupt map file: {}", reason),
            Self::InvalidMapName => f.write_str("invalid map name"),
            Self::InUse => f.write_str("map is already in use"),
            Self::CacheFull => f.write_str("no cached map handle can be evicted"),
            Self::UnknownHandle => f.write_str("map handle was not issued by this cache"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_numbers_parse_like_atoi() {
        assert_eq!(parse_order_number(b"1700000000"), 1700000000);
        assert_eq!(parse_order_number(b"  42abc"), 42);
        assert_eq!(parse_order_number(b"abc"), 0);
        assert_eq!(parse_order_number(b""), 0);
    }

    #[test]
    fn map_dir_lists_maps_without_dot_files() {
        let dir = tempfile::tempdir().unwrap();
        let domain = dir.path().join("example");
        fs::create_dir(&domain).unwrap();
        fs::write(domain.join("hosts.byname"), b"").unwrap();
        fs::write(domain.join(".hidden"), b"").unwrap();
        let map_dir = MapDir::new(dir.path());
        assert_eq!(map_dir.list_maps("example").unwrap(), vec!["hosts.byname"]);
        assert!(map_dir.list_maps("missing").is_err());
    }
}
