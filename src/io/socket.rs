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

//! Sockets used by the I/O provider.
//!
//! The Rust standard library offers no way to call `accept` on a
//! listening TCP socket with a timeout. What we implement instead, on
//! Unix targets, is a `poll_accept` method built with the `poll` system
//! call. Elsewhere the TCP accept loop blocks indefinitely and cannot
//! notice a graceful shutdown; see [`TcpListener::POLL_ACCEPT_WORKS`].

use std::io;
use std::net::{self, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

#[cfg(unix)]
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags},
};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// A listening TCP socket.
pub struct TcpListener(net::TcpListener);

impl TcpListener {
    /// Whether [`TcpListener::poll_accept`] actually waits on this
    /// target.
    pub const POLL_ACCEPT_WORKS: bool = cfg!(unix);

    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        net::TcpListener::bind(addr).map(Self)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.0.set_nonblocking(nonblocking)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.0.local_addr()
    }

    /// Blocks until a new connection is available, the timeout expires,
    /// or the call is interrupted. Returns whether a new connection is
    /// available.
    #[cfg(unix)]
    pub fn poll_accept(&self, timeout: Duration) -> io::Result<bool> {
        let millis = timeout.as_millis().try_into().unwrap_or(i32::MAX);
        let mut poll_fds = [PollFd::new(self.0.as_raw_fd(), PollFlags::POLLIN)];
        match poll(&mut poll_fds, millis) {
            Ok(n) => Ok(n > 0),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns `Ok(true)` immediately; the following `accept` blocks.
    #[cfg(not(unix))]
    pub fn poll_accept(&self, _timeout: Duration) -> io::Result<bool> {
        Ok(true)
    }

    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.0.accept()
    }
}

/// A UDP socket shared by the worker threads serving it.
#[derive(Clone)]
pub struct UdpSocket(Arc<net::UdpSocket>);

impl UdpSocket {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        net::UdpSocket::bind(addr).map(Arc::new).map(Self)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.0.set_read_timeout(timeout)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.0.local_addr()
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.0.recv_from(buf)
    }

    pub fn send(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.0.send_to(buf, dest)
    }
}
