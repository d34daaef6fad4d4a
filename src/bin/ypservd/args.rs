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

//! Implements command-line argument parsing.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{ArgGroup, Parser, Subcommand};

/// Parses the command line arguments.
pub fn parse() -> Args {
    Args::parse()
}

/// A NIS (YP) directory server
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the directory server
    Serve(DaemonArgs),

    /// Run the map file transfer server
    Xfrd(DaemonArgs),

    /// Ask replicas to pull new copies of maps
    Push(PushArgs),
}

#[derive(Debug, Parser)]
#[clap(group(ArgGroup::new("required").required(true).args(&["config", "map_dir"])))]
pub struct DaemonArgs {
    /// Set the configuration file to use
    #[clap(long, conflicts_with_all = &["map_dir", "bind", "ip", "port"], value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Set the directory holding one subdirectory of maps per domain
    #[clap(long, value_name = "DIR")]
    pub map_dir: Option<PathBuf>,

    /// Set the server bind IP address and port
    #[clap(long, value_name = "IP:PORT")]
    pub bind: Option<SocketAddr>,

    /// Set the server bind IP address
    #[clap(long, conflicts_with = "bind", value_name = "IP")]
    pub ip: Option<IpAddr>,

    /// Set the server port
    #[clap(long, conflicts_with = "bind", value_name = "PORT")]
    pub port: Option<u16>,

    /// Set the access policy file
    #[clap(long, requires = "map_dir", value_name = "FILE")]
    pub policy_file: Option<PathBuf>,

    /// Set the securenets file
    #[clap(long, requires = "map_dir", value_name = "FILE")]
    pub securenets_file: Option<PathBuf>,
}

#[derive(Debug, Parser)]
#[clap(group(ArgGroup::new("maps_from").required(true).args(&["config", "map_dir"])))]
pub struct PushArgs {
    /// Set the configuration file to use
    #[clap(long, conflicts_with = "map_dir", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Set the directory holding one subdirectory of maps per domain
    #[clap(long, value_name = "DIR")]
    pub map_dir: Option<PathBuf>,

    /// Set the domain of the maps to push
    #[clap(short, long)]
    pub domain: String,

    /// Push only to this replica (may be repeated); by default, all
    /// hosts in the ypservers map are used
    #[clap(short = 'H', long = "host", value_name = "HOST[:PORT]")]
    pub hosts: Vec<String>,

    /// Set how long to wait for each replica's callback, in seconds
    #[clap(short, long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Set the number of replicas to push to at once
    #[clap(short, long, value_name = "N")]
    pub parallel: Option<usize>,

    /// Set the name this host uses as map master (default: the system
    /// host name)
    #[clap(long, value_name = "NAME")]
    pub local_host: Option<String>,

    /// Log each replica's progress
    #[clap(short, long)]
    pub verbose: bool,

    /// The maps to push
    #[clap(required = true, value_name = "MAP")]
    pub maps: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_arguments_parse() {
        let args = Args::try_parse_from([
            "ypservd", "push", "--map-dir", "/var/yp", "-d", "example", "-H", "host2",
            "-H", "host3:900", "-p", "2", "passwd.byname", "group.byname",
        ])
        .unwrap();
        let Command::Push(push) = args.command else {
            panic!("expected the push command");
        };
        assert_eq!(push.domain, "example");
        assert_eq!(push.hosts, ["host2", "host3:900"]);
        assert_eq!(push.parallel, Some(2));
        assert_eq!(push.maps, ["passwd.byname", "group.byname"]);
    }

    #[test]
    fn daemons_need_a_config_or_a_map_dir() {
        assert!(Args::try_parse_from(["ypservd", "serve"]).is_err());
        assert!(Args::try_parse_from(["ypservd", "serve", "--map-dir", "/var/yp"]).is_ok());
        assert!(Args::try_parse_from([
            "ypservd", "xfrd", "--config", "ypserv.toml", "--port", "900"
        ])
        .is_err());
    }
}
