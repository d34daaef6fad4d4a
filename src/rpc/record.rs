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

//! Record marking for RPC over stream transports.
//!
//! [RFC 5531 § 11] splits each RPC message sent over TCP into one or
//! more fragments. Each fragment is preceded by a four-octet header
//! whose high bit is set on the final fragment of a message and whose
//! low 31 bits give the fragment length.
//!
//! [RFC 5531 § 11]: https://datatracker.ietf.org/doc/html/rfc5531#section-11

use std::io::{self, Read, Write};

/// The bit marking the last fragment of a record.
const LAST_FRAGMENT: u32 = 0x8000_0000;

/// The largest fragment this implementation writes. Streamed replies
/// are flushed in fragments of roughly this size.
pub const FRAGMENT_SIZE: usize = 64 * 1024;

/// The largest record accepted from a peer: the largest YP record
/// (16 MiB) plus room for headers.
pub const MAX_RECORD_LEN: usize = 16 * 1024 * 1024 + 4096;

/// Reads one record. Returns `Ok(None)` if the stream ended cleanly
/// before the record started. Records longer than `max_len` are
/// rejected with [`io::ErrorKind::InvalidData`].
pub fn read_record<R: Read>(stream: &mut R, max_len: usize) -> io::Result<Option<Vec<u8>>> {
    let mut record = Vec::new();
    loop {
        let mut header = [0; 4];
        if !read_exact_or_eof(stream, &mut header, record.is_empty())? {
            return Ok(None);
        }
        let header = u32::from_be_bytes(header);
        let len = (header & !LAST_FRAGMENT) as usize;
        if record.len() + len > max_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "RPC record exceeds the maximum length",
            ));
        }
        let start = record.len();
        record.resize(start + len, 0);
        stream.read_exact(&mut record[start..])?;
        if header & LAST_FRAGMENT != 0 {
            return Ok(Some(record));
        }
    }
}

/// Fills `buf` from `stream`. If `eof_ok` is set and the stream ends
/// before any octet is read, returns `Ok(false)`.
fn read_exact_or_eof<R: Read>(stream: &mut R, buf: &mut [u8], eof_ok: bool) -> io::Result<bool> {
    let mut n_read = 0;
    while n_read < buf.len() {
        match stream.read(&mut buf[n_read..]) {
            Ok(0) if n_read == 0 && eof_ok => return Ok(false),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => n_read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Writes one fragment. `last` marks the end of the record.
pub fn write_fragment<W: Write>(stream: &mut W, data: &[u8], last: bool) -> io::Result<()> {
    let mut header = data.len() as u32;
    if last {
        header |= LAST_FRAGMENT;
    }
    let mut fragment = Vec::with_capacity(4 + data.len());
    fragment.extend_from_slice(&header.to_be_bytes());
    fragment.extend_from_slice(data);
    stream.write_all(&fragment)
}

/// Writes a complete record, splitting it into fragments of at most
/// [`FRAGMENT_SIZE`] octets.
pub fn write_record<W: Write>(stream: &mut W, record: &[u8]) -> io::Result<()> {
    let mut chunks = record.chunks(FRAGMENT_SIZE).peekable();
    if chunks.peek().is_none() {
        return write_fragment(stream, &[], true);
    }
    while let Some(chunk) = chunks.next() {
        write_fragment(stream, chunk, chunks.peek().is_none())?;
    }
    Ok(())
}

/// Writes a single record of unknown length as a series of fragments.
///
/// Data is buffered and sent in non-final fragments of
/// [`FRAGMENT_SIZE`] octets as it accumulates; [`FragmentWriter::finish`]
/// sends whatever remains as the final fragment. A record that is never
/// finished is left incomplete on the stream.
pub struct FragmentWriter<W: Write> {
    stream: W,
    buffer: Vec<u8>,
}

impl<W: Write> FragmentWriter<W> {
    pub fn new(stream: W) -> Self {
        Self {
            stream,
            buffer: Vec::with_capacity(FRAGMENT_SIZE),
        }
    }

    /// Sends the final fragment and returns the underlying stream.
    pub fn finish(mut self) -> io::Result<W> {
        write_fragment(&mut self.stream, &self.buffer, true)?;
        self.stream.flush()?;
        Ok(self.stream)
    }
}

impl<W: Write> Write for FragmentWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.buffer.len() == FRAGMENT_SIZE {
            write_fragment(&mut self.stream, &self.buffer, false)?;
            self.buffer.clear();
        }
        let n = data.len().min(FRAGMENT_SIZE - self.buffer.len());
        self.buffer.extend_from_slice(&data[..n]);
        Ok(n)
    }

    /// Flushes the underlying stream. Buffered data is not sent until
    /// a full fragment accumulates or the record is finished.
    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_fragment_records_are_reassembled() {
        let mut stream = Vec::new();
        write_fragment(&mut stream, b"abc", false).unwrap();
        write_fragment(&mut stream, b"def", true).unwrap();
        write_fragment(&mut stream, b"xyz", true).unwrap();

        let mut cursor = io::Cursor::new(stream);
        assert_eq!(
            read_record(&mut cursor, 1024).unwrap(),
            Some(b"abcdef".to_vec())
        );
        assert_eq!(read_record(&mut cursor, 1024).unwrap(), Some(b"xyz".to_vec()));
        assert_eq!(read_record(&mut cursor, 1024).unwrap(), None);
    }

    #[test]
    fn large_records_are_split() {
        let record = vec![7; FRAGMENT_SIZE + 10];
        let mut stream = Vec::new();
        write_record(&mut stream, &record).unwrap();
        assert_eq!(stream.len(), record.len() + 8);
        assert_eq!(&stream[0..4], &(FRAGMENT_SIZE as u32).to_be_bytes());
        let mut cursor = io::Cursor::new(stream);
        assert_eq!(read_record(&mut cursor, MAX_RECORD_LEN).unwrap(), Some(record));
    }

    #[test]
    fn oversized_records_are_rejected() {
        let mut stream = Vec::new();
        write_record(&mut stream, &[0; 100]).unwrap();
        let err = read_record(&mut io::Cursor::new(stream), 99).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_records_are_errors() {
        let mut stream = Vec::new();
        write_record(&mut stream, b"abcdef").unwrap();
        stream.truncate(7);
        let err = read_record(&mut io::Cursor::new(stream), 1024).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn fragment_writer_streams_one_record() {
        let mut writer = FragmentWriter::new(Vec::new());
        let data = vec![3; FRAGMENT_SIZE * 2 + 5];
        for chunk in data.chunks(1000) {
            writer.write_all(chunk).unwrap();
        }
        let stream = writer.finish().unwrap();
        assert_eq!(stream.len(), data.len() + 3 * 4);
        let mut cursor = io::Cursor::new(stream);
        assert_eq!(read_record(&mut cursor, MAX_RECORD_LEN).unwrap(), Some(data));
        assert_eq!(read_record(&mut cursor, MAX_RECORD_LEN).unwrap(), None);
    }
}
