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

//! Implementation of the blocking I/O provider.

// NOTE: In this provider, I/O error handling is generally to exit the
// task. For the TCP accept loop and UDP receive/send loop, this will
// cause the thread to respawn, possibly after a delay (if the last
// respawn occurred too recently); this prevents us from using up all
// CPU time on I/O operations that repeatedly fail. For the TCP
// connection handler, this aborts the connection on I/O error, as
// appropriate.
//
// The single exception is that *sends* in the UDP receive/send loop
// do not cause the task to exit, but are rather logged and ignored.
// Therefore we will keep processing incoming calls as long as the
// *receive* portion continues to work.

use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use super::socket::{TcpListener, UdpSocket};
use crate::rpc::record::{read_record, write_record, FragmentWriter, MAX_RECORD_LEN};
use crate::server::{ReceivedInfo, Reply, Service, StreamReply, Transport};
use crate::thread::{ThreadGroup, ThreadPool};

/// A blocking I/O provider.
///
/// This provider uses blocking I/O to communicate over the network,
/// employing a configurable number of worker threads for concurrency.
/// Streamed replies are written on their own threads while the
/// service's [stream limit](Service::stream_limit) allows, and on the
/// connection's worker otherwise.
///
/// # Graceful shutdown
///
/// To initiate a graceful shutdown, simply shut down the
/// [`ThreadGroup`] in which the provider was started (see
/// [`BlockingIoProvider::start`]). This requires a timed TCP accept,
/// which is available when
/// [`BlockingIoProvider::SUPPORTS_GRACEFUL_SHUTDOWN`] is set
/// (currently on **Unix** targets).
pub struct BlockingIoProvider {
    config: BlockingIoConfig,
    tcp_listeners: Vec<TcpListener>,
    udp_sockets: Vec<UdpSocket>,
}

/// Configuration options for the [`BlockingIoProvider`].
#[derive(Clone, Debug)]
pub struct BlockingIoConfig {
    /// The base number of TCP worker threads to maintain. If more than
    /// this many TCP connections are established, a temporary auxiliary
    /// thread will be spawned for each additional connection.
    pub tcp_base_workers: usize,

    /// The number of UDP worker threads to run for each UDP socket.
    pub udp_workers_per_socket: usize,
}

impl Default for BlockingIoConfig {
    fn default() -> Self {
        Self {
            tcp_base_workers: 4,
            udp_workers_per_socket: 2,
        }
    }
}

impl BlockingIoProvider {
    /// Whether the `BlockingIoProvider` supports graceful shutdown on
    /// the target system.
    pub const SUPPORTS_GRACEFUL_SHUTDOWN: bool = TcpListener::POLL_ACCEPT_WORKS;

    /// Creates a new `BlockingIoProvider`. This call binds TCP and UDP
    /// sockets in preparation, but does not start the server.
    pub fn bind<T, U>(config: BlockingIoConfig, tcp_addrs: T, udp_addrs: U) -> io::Result<Self>
    where
        T: IntoIterator<Item = SocketAddr>,
        U: IntoIterator<Item = SocketAddr>,
    {
        let mut tcp_listeners = Vec::new();
        for addr in tcp_addrs {
            let listener = TcpListener::bind(addr)?;
            if TcpListener::POLL_ACCEPT_WORKS {
                listener.set_nonblocking(true)?;
            }
            tcp_listeners.push(listener);
        }

        let mut udp_sockets = Vec::new();
        for addr in udp_addrs {
            let socket = UdpSocket::bind(addr)?;
            socket.set_read_timeout(Some(CHECK_FOR_SHUTDOWN_TIMEOUT))?;
            udp_sockets.push(socket);
        }

        Ok(Self {
            config,
            tcp_listeners,
            udp_sockets,
        })
    }

    /// Returns the addresses the TCP listeners are bound to.
    pub fn tcp_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        self.tcp_listeners.iter().map(TcpListener::local_addr).collect()
    }

    /// Returns the addresses the UDP sockets are bound to.
    pub fn udp_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        self.udp_sockets.iter().map(UdpSocket::local_addr).collect()
    }

    /// Starts serving `service` on the provided [`ThreadGroup`].
    ///
    /// On platforms with graceful shutdown support, the server can be
    /// shut down later simply by shutting down the [`ThreadGroup`]
    /// provided here.
    pub fn start<S: Service>(
        self,
        service: &Arc<S>,
        group: &Arc<ThreadGroup>,
    ) -> Result<(), crate::thread::Error> {
        // Start the TCP threads.
        let tcp_workers = group.start_pool(Some("tcp".to_owned()), self.config.tcp_base_workers)?;
        for (i, tcp_listener) in self.tcp_listeners.into_iter().enumerate() {
            let name = format!("tcp listener {i}");
            let tcp_workers = tcp_workers.clone();
            let group_clone = group.clone();
            let service = service.clone();
            let task = move || {
                log_io_errors(run_tcp_listener(&group_clone, &tcp_workers, &service, &tcp_listener));
            };
            group.start_respawnable(Some(name), task)?;
        }

        // Start the UDP threads.
        for (i, udp_socket) in self.udp_sockets.into_iter().enumerate() {
            for j in 0..self.config.udp_workers_per_socket {
                let name = format!("udp worker {i}/{j}");
                let group_clone = group.clone();
                let service = service.clone();
                let udp_socket = udp_socket.clone();
                let task = move || {
                    log_io_errors(run_udp_worker(&group_clone, &*service, &udp_socket));
                };
                group.start_respawnable(Some(name), task)?;
            }
        }

        Ok(())
    }
}

/// This defines the timeout on TCP accept and UDP receive operations.
/// TCP listener and UDP worker threads check for thread group shutdown
/// between every accept and receive, respectively, so this defines the
/// *maximum* interval between such checks. Consequently, it is the
/// maximum amount of time the shutdown procedure will have to wait for
/// these threads to finish up.
const CHECK_FOR_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// This defines the maximum amount of time a client is allowed to take
/// to send us a full call record, counted from the end of the previous
/// reply. If it takes longer, we close the connection.
const READ_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// The maximum amount of time a single write of reply data may block.
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// The largest UDP datagram we accept.
const UDP_RECEIVE_LIMIT: usize = u16::MAX as usize;

/// The TCP listener/accept loop.
fn run_tcp_listener<S: Service>(
    group: &Arc<ThreadGroup>,
    pool: &Arc<ThreadPool>,
    service: &Arc<S>,
    listener: &TcpListener,
) -> io::Result<()> {
    loop {
        if pool.is_shutting_down() {
            return Ok(());
        }

        // Note that poll_accept returns false if interrupted. If
        // poll_accept doesn't work on this platform, then this always
        // returns true immediately.
        let ready = listener.poll_accept(CHECK_FOR_SHUTDOWN_TIMEOUT)?;
        if ready {
            // Accept as many new connections as are available. If
            // poll_accept doesn't work on this platform, then the
            // accept call blocks.
            loop {
                let (client, client_addr) = match retry_if_interrupted(|| listener.accept()) {
                    Ok(accepted) => accepted,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e),
                };
                let group = group.clone();
                let pool_clone = pool.clone();
                let service = service.clone();
                let task = move || {
                    log_io_errors(handle_tcp_connection(
                        &group,
                        &pool_clone,
                        &*service,
                        client,
                        client_addr,
                    ));
                };
                match pool.submit_or_spawn(task) {
                    Ok(()) => (),
                    Err(crate::thread::Error::ShuttingDown) => {
                        // Let the connection close.
                        return Ok(());
                    }
                    Err(crate::thread::Error::Io(e)) => return Err(e),
                }
            }
        }
    }
}

/// Handles a TCP connection: reads call records and writes replies
/// until the client closes the connection or misbehaves.
fn handle_tcp_connection<S: Service>(
    group: &Arc<ThreadGroup>,
    pool: &Arc<ThreadPool>,
    service: &S,
    mut socket: TcpStream,
    client_addr: SocketAddr,
) -> io::Result<()> {
    if TcpListener::POLL_ACCEPT_WORKS {
        // On some systems, the socket might inherit nonblocking status
        // from the listener.
        socket.set_nonblocking(false)?;
    }
    socket.set_write_timeout(Some(WRITE_TIMEOUT))?;

    loop {
        let mut reader = DeadlineReader {
            socket: &socket,
            deadline: Instant::now() + READ_CALL_TIMEOUT,
        };
        let call = match read_record(&mut reader, MAX_RECORD_LEN) {
            Ok(Some(call)) => call,
            Ok(None) => return Ok(()),
            Err(e) => {
                return match e.kind() {
                    io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::UnexpectedEof => Ok(()),
                    io::ErrorKind::InvalidData => {
                        debug!("Closing connection from {}: {}", client_addr, e);
                        Ok(())
                    }
                    _ => Err(e),
                }
            }
        };

        match service.handle_call(&call, ReceivedInfo::new(client_addr, Transport::Tcp)) {
            Reply::Single(reply) => write_record(&mut socket, &reply)?,
            Reply::Stream(stream) => match service.stream_limit().try_acquire() {
                Some(permit) => {
                    // The stream thread owns the connection from here
                    // on and closes it when the stream ends.
                    let name = format!("stream to {}", client_addr);
                    let task = move || {
                        let _permit = permit;
                        log_io_errors(write_stream(stream, &mut socket));
                    };
                    return match group.start_oneshot(Some(name), task) {
                        Ok(()) | Err(crate::thread::Error::ShuttingDown) => Ok(()),
                        Err(crate::thread::Error::Io(e)) => Err(e),
                    };
                }
                None => write_stream(stream, &mut socket)?,
            },

            // Reply::None occurs for calls that go unanswered. The
            // connection stays open.
            Reply::None => (),
        }

        // We won't continue to service this connection if the TCP
        // worker pool is shutting down.
        if pool.is_shutting_down() {
            return Ok(());
        }
    }
}

/// Writes a streamed reply as one record.
fn write_stream(stream: Box<dyn StreamReply>, socket: &mut TcpStream) -> io::Result<()> {
    let mut out = FragmentWriter::new(socket);
    stream.write_to(&mut out)?;
    out.finish()?;
    Ok(())
}

/// Reads from a TCP connection, failing with
/// [`io::ErrorKind::TimedOut`] once the deadline passes. Interrupted
/// reads are retried with the remaining time.
struct DeadlineReader<'a> {
    socket: &'a TcpStream,
    deadline: Instant,
}

impl Read for DeadlineReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let timeout = match compute_timeout(self.deadline) {
                Some(t) if !t.is_zero() => t,
                _ => return Err(io::ErrorKind::TimedOut.into()),
            };
            self.socket.set_read_timeout(Some(timeout))?;
            match (&mut &*self.socket).read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                result => return result,
            }
        }
    }
}

/// The UDP receive/handle/send loop.
fn run_udp_worker<S: Service>(
    group: &Arc<ThreadGroup>,
    service: &S,
    socket: &UdpSocket,
) -> io::Result<()> {
    let mut received_buf = vec![0; UDP_RECEIVE_LIMIT];

    loop {
        if group.is_shutting_down() {
            return Ok(());
        }

        // Receive a call. If interrupted, we skip the rest of the loop
        // body and check whether the group is shutting down again
        // before retrying. Otherwise, repeated interruptions could in
        // theory prevent the call from ever timing out.
        let (received_len, src) = match socket.recv(&mut received_buf) {
            Ok(received) => received,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        match service.handle_call(
            &received_buf[..received_len],
            ReceivedInfo::new(src, Transport::Udp),
        ) {
            Reply::Single(reply) => {
                // Don't exit the task if the send fails. (See the note
                // at the beginning of the module.)
                log_io_errors(retry_if_interrupted(|| socket.send(&reply, src)));
            }
            Reply::Stream(_) => warn!("Dropping streamed reply to {} over UDP", src),
            Reply::None => (),
        }
    }
}

/// Computes the time until the deadline. Returns [`None`] if the
/// deadline is in the past.
fn compute_timeout(deadline: Instant) -> Option<Duration> {
    deadline.checked_duration_since(Instant::now())
}

/// Executes `f`, retrying the operation if it is interrupted.
fn retry_if_interrupted<F, R>(mut f: F) -> io::Result<R>
where
    F: FnMut() -> io::Result<R>,
{
    loop {
        match f() {
            Ok(r) => return Ok(r),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Logs errors if a task exits with an I/O error.
fn log_io_errors<T>(result: io::Result<T>) {
    if let Err(e) = result {
        let current_thread = thread::current();
        let thread_name = current_thread.name().unwrap_or("anonymous thread");
        error!("I/O error in thread {}: {}", thread_name, e);
    }
}
