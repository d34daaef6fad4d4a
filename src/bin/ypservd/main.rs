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

//! The `ypservd` daemon: a NIS directory server, its companion map
//! file transfer server, and the push coordinator.

mod args;
mod config;
mod logging;
mod push;
mod run;

use args::Command;

fn main() {
    let args = args::parse();
    match args.command {
        Command::Serve(daemon_args) => run::serve(daemon_args),
        Command::Xfrd(daemon_args) => run::xfrd(daemon_args),
        Command::Push(push_args) => push::run(push_args),
    }
}
