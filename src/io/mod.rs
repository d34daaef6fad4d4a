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

//! I/O providers for running [`Service`s](crate::server::Service).
//!
//! The [`Server`](crate::server::Server) and
//! [`XfrdServer`](crate::xfrd::XfrdServer) structures implement the
//! processing logic of their RPC programs abstracted from underlying
//! network I/O. Therefore, to actually run one, an I/O provider is
//! needed.
//!
//! The provider here takes a [`Service`](crate::server::Service) and,
//! when run, acts as the intermediary between operating system network
//! APIs on one hand and the service on the other. It receives calls as
//! UDP datagrams and as record-marked messages on TCP connections, and
//! sends back whatever reply the service produces.

mod blocking;
mod socket;

pub use blocking::{BlockingIoConfig, BlockingIoProvider};
