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

//! A NIS (YP) directory server library.
//!
//! This crate implements the server side of the Sun YP protocol suite:
//! the `ypserv` program itself ([`server`]), the bulk map file transfer
//! program ([`xfrd`]), and the coordinator that asks replica servers
//! to pull new copies of a map ([`push`]). The programs are abstracted
//! from network I/O; the [`io`] module provides a blocking I/O provider
//! that runs the [`server::Server`] and [`xfrd::XfrdServer`] over TCP
//! and UDP.
//!
//! Maps are stored in per-domain directories beneath a map root (see
//! [`db::MapDir`]). Access to them is controlled by a securenets list
//! and a ypserv.conf-style policy table ([`access`]).

pub mod access;
pub mod db;
pub mod io;
pub mod proto;
pub mod push;
pub mod rpc;
pub mod server;
pub mod thread;
pub mod xdr;
pub mod xfrd;
