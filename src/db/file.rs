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

//! Implementation of the map database file format.
//!
//! A map file begins with the four-byte magic `YPDB` followed by a
//! 32-bit big-endian format version (currently 1). The rest of the
//! file is a sequence of records, each a 32-bit big-endian key length,
//! the key, a 32-bit big-endian value length, and the value. Keys are
//! unique. A map file is loaded completely when opened.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::ops::Bound;
use std::path::Path;

use super::{Database, Error};

const MAGIC: &[u8; 4] = b"YPDB";
const VERSION: u32 = 1;

/// A map loaded from a map file. Records iterate in key byte order.
#[derive(Clone, Debug, Default)]
pub struct FileMap {
    records: BTreeMap<Box<[u8]>, Box<[u8]>>,
}

impl FileMap {
    /// Loads the map file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let octets = fs::read(path)?;
        Self::parse(&octets)
    }

    /// Parses the contents of a map file.
    pub fn parse(octets: &[u8]) -> Result<Self, Error> {
        let mut cursor = Cursor { octets, position: 0 };
        if cursor.take(4)? != MAGIC {
            return Err(Error::Corrupt("bad magic"));
        }
        if cursor.take_u32()? != VERSION {
            return Err(Error::Corrupt("unsupported version"));
        }

        let mut records = BTreeMap::new();
        while cursor.position < octets.len() {
            let key_len = cursor.take_u32()? as usize;
            let key = cursor.take(key_len)?;
            let value_len = cursor.take_u32()? as usize;
            let value = cursor.take(value_len)?;
            if records.insert(key.into(), value.into()).is_some() {
                return Err(Error::Corrupt("duplicate key"));
            }
        }
        Ok(Self { records })
    }

    /// Returns the number of records, including reserved ones.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns whether the map has no records at all.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Database for FileMap {
    fn first(&self) -> Option<(&[u8], &[u8])> {
        self.records.iter().next().map(|(k, v)| (&k[..], &v[..]))
    }

    fn next(&self, key: &[u8]) -> Option<(&[u8], &[u8])> {
        if !self.records.contains_key(key) {
            return None;
        }
        self.records
            .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(k, v)| (&k[..], &v[..]))
    }

    fn fetch(&self, key: &[u8]) -> Option<&[u8]> {
        self.records.get(key).map(|v| &v[..])
    }
}

struct Cursor<'a> {
    octets: &'a [u8],
    position: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let end = self
            .position
            .checked_add(len)
            .filter(|&end| end <= self.octets.len())
            .ok_or(Error::Corrupt("truncated record"))?;
        let slice = &self.octets[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn take_u32(&mut self) -> Result<u32, Error> {
        let octets = self.take(4)?;
        Ok(u32::from_be_bytes([octets[0], octets[1], octets[2], octets[3]]))
    }
}

////////////////////////////////////////////////////////////////////////
// WRITING                                                            //
////////////////////////////////////////////////////////////////////////

/// Writes a map file containing `records`. The file is written under a
/// temporary name in the same directory and then renamed into place,
/// so a concurrent reader sees either the old map or the new one.
pub fn write_map<'a, I>(path: impl AsRef<Path>, records: I) -> io::Result<()>
where
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    let path = path.as_ref();
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "map path has no file name"))?;
    let mut temp_name = std::ffi::OsString::from(".");
    temp_name.push(file_name);
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    let mut out = io::BufWriter::new(fs::File::create(&temp_path)?);
    out.write_all(MAGIC)?;
    out.write_all(&VERSION.to_be_bytes())?;
    for (key, value) in records {
        write_len(&mut out, key.len())?;
        out.write_all(key)?;
        write_len(&mut out, value.len())?;
        out.write_all(value)?;
    }
    out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    fs::rename(&temp_path, path)
}

fn write_len(out: &mut impl Write, len: usize) -> io::Result<()> {
    let len: u32 = len
        .try_into()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "record too long"))?;
    out.write_all(&len.to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passwd.byname");
        let records: [(&[u8], &[u8]); 3] = [
            (b"bob", b"bob:x:1001"),
            (b"YP_LAST_MODIFIED", b"1700000000"),
            (b"alice", b"alice:x:1000"),
        ];
        write_map(&path, records).unwrap();
        (dir, path)
    }

    #[test]
    fn open_reads_written_map() {
        let (_dir, path) = sample();
        let map = FileMap::open(&path).unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.fetch(b"alice"), Some(&b"alice:x:1000"[..]));
        assert!(map.exists(b"YP_LAST_MODIFIED"));
        assert!(!map.exists(b"carol"));
    }

    #[test]
    fn iteration_visits_every_record_once() {
        let (_dir, path) = sample();
        let map = FileMap::open(&path).unwrap();
        let mut keys = Vec::new();
        let mut record = map.first();
        while let Some((key, _)) = record {
            keys.push(key.to_vec());
            record = map.next(key);
        }
        assert_eq!(keys.len(), 3);
    }

    #[test]
    fn user_iteration_skips_reserved_keys() {
        let (_dir, path) = sample();
        let map = FileMap::open(&path).unwrap();
        let (first, _) = map.first_user().unwrap();
        assert_eq!(first, b"alice");
        let (second, _) = map.next_user(first).unwrap();
        assert_eq!(second, b"bob");
        assert!(map.next_user(second).is_none());
    }

    #[test]
    fn next_of_missing_key_is_none() {
        let (_dir, path) = sample();
        let map = FileMap::open(&path).unwrap();
        assert!(map.next(b"aardvark").is_none());
    }

    #[test]
    fn parse_rejects_bad_files() {
        assert!(matches!(FileMap::parse(b"NOPE\0\0\0\x01"), Err(Error::Corrupt(_))));
        assert!(matches!(
            FileMap::parse(b"YPDB\0\0\0\x01\0\0\0\x05ab"),
            Err(Error::Corrupt(_))
        ));
        assert!(FileMap::parse(b"YPDB\0\0\0\x01").unwrap().is_empty());
    }

    #[test]
    fn write_replaces_existing_map() {
        let (_dir, path) = sample();
        let records: [(&[u8], &[u8]); 1] = [(b"carol", b"carol:x:1002")];
        write_map(&path, records).unwrap();
        let map = FileMap::open(&path).unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.exists(b"carol"));
    }
}
