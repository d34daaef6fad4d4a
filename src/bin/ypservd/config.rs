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

//! Implements the daemon configuration file.

use std::fmt::{self, Write};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::Level::Debug;
use log::{debug, log_enabled};
use paste::paste;
use serde::{de, Deserialize};

use ypserv::access::{PolicyFile, Securenet, Securenets};
use ypserv::io::BlockingIoConfig;

use crate::args::DaemonArgs;

////////////////////////////////////////////////////////////////////////
// CONFIGURATION LOADING                                              //
////////////////////////////////////////////////////////////////////////

/// Loads the configuration from the file given by `path`.
///
/// The `reloading` parameter controls how the configuration is
/// summarized in the log: if reloading, only the access files (the only
/// thing that we support reloading) are summarized. This parameter does
/// *not* otherwise affect processing.
pub fn load_from_path(path: impl AsRef<Path>, reloading: bool) -> Result<Config> {
    let dir = match path.as_ref().parent() {
        Some(p) => p,
        None => return Err(anyhow!("the configuration file path has no parent")),
    };
    let raw_config =
        fs::read_to_string(path.as_ref()).context("failed to read the configuration file")?;
    let mut config: Config =
        toml::from_str(&raw_config).context("failed to parse the configuration file")?;

    // When loading the configuration from a path, all file paths are
    // interpreted relative to the configuration file's directory.
    for path in [
        Some(&mut config.map_dir),
        config.policy_file.as_mut(),
        config.securenets_file.as_mut(),
    ]
    .into_iter()
    .flatten()
    {
        if path.is_relative() {
            *path = dir.join(&*path);
        }
    }

    if reloading {
        log_access_summary(&config);
    } else {
        log_config_summary(&config);
    }
    Ok(config)
}

/// Loads the configuration from the parsed command line arguments
/// given by `args`, for running `daemon`.
pub fn load_from_args(args: DaemonArgs, daemon: Daemon) -> Result<Config> {
    let map_dir = args
        .map_dir
        .ok_or_else(|| anyhow!("no map directory was given"))?;
    let bind = args.bind.unwrap_or_else(|| {
        let ip = args.ip.unwrap_or(DEFAULT_BIND_IP);
        let port = args.port.unwrap_or_else(|| daemon.default_port());
        SocketAddr::new(ip, port)
    });

    let config = Config {
        bind,
        xfrd_bind: bind,
        map_dir,
        policy_file: args.policy_file,
        securenets_file: args.securenets_file,
        securenets: Vec::new(),
        ypxfr_program: default_ypxfr_program(),
        io: IoConfig::default(),
        streaming: StreamingConfig::default(),
        push: PushConfig::default(),
    };
    log_config_summary(&config);
    Ok(config)
}

/// Summarizes the configuration in the log, if the debug log level is
/// enabled.
fn log_config_summary(config: &Config) {
    if !log_enabled!(Debug) {
        // Don't compute the message if it will never be printed.
        return;
    }

    let mut message = format!(
        "Configuration loaded:\n\
         Bind address:      {}\n\
         xfrd bind address: {}\n\
         Map directory:     {}\n\
         ypxfr program:     {}\n\
         TCP workers:       {}\n\
         UDP workers:       {}",
        config.bind,
        config.xfrd_bind,
        config.map_dir.display(),
        config.ypxfr_program.display(),
        config.io.tcp_base_workers,
        config.io.udp_workers,
    );
    summarize_access(config, &mut message);
    debug!("{}", message);
}

/// Summarizes only the access files in the log, if the debug log level
/// is enabled. Used when reloading.
fn log_access_summary(config: &Config) {
    if log_enabled!(Debug) {
        let mut message = String::from("Configuration reloaded:");
        summarize_access(config, &mut message);
        debug!("{}", message);
    }
}

/// Produces the access summary for [`log_config_summary`] and
/// [`log_access_summary`].
fn summarize_access(config: &Config, message: &mut String) {
    let describe = |path: &Option<PathBuf>| match path {
        Some(path) => path.display().to_string(),
        None => "none".to_owned(),
    };
    write!(
        message,
        "\nPolicy file:       {}\nSecurenets file:   {}\nInline securenets: {}",
        describe(&config.policy_file),
        describe(&config.securenets_file),
        config.securenets.len(),
    )
    .unwrap();
}

/// Loads the policy and securenets files named by the configuration.
/// Missing files yield empty rules.
pub fn load_access(config: &Config) -> Result<(PolicyFile, Securenets)> {
    let policy = match config.policy_file {
        Some(ref path) => PolicyFile::load(path),
        None => PolicyFile::default(),
    };
    let mut securenets = match config.securenets_file {
        Some(ref path) => Securenets::load(path)
            .with_context(|| format!("failed to read the securenets file {}", path.display()))?,
        None => Securenets::default(),
    };
    securenets.extend(config.securenets.iter().map(|entry| entry.0));
    Ok((policy, securenets))
}

////////////////////////////////////////////////////////////////////////
// CONFIGURATION FILE STRUCTURE                                       //
////////////////////////////////////////////////////////////////////////

/// The complete configuration file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    #[serde(default = "default_xfrd_bind")]
    pub xfrd_bind: SocketAddr,
    pub map_dir: PathBuf,
    pub policy_file: Option<PathBuf>,
    pub securenets_file: Option<PathBuf>,

    /// Securenets entries given directly in the configuration. These
    /// are added to those of the securenets file.
    #[serde(default)]
    pub securenets: Vec<ConfigSecurenet>,

    #[serde(default = "default_ypxfr_program")]
    pub ypxfr_program: PathBuf,
    #[serde(default)]
    pub io: IoConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub push: PushConfig,
}

const DEFAULT_BIND_IP: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
const DEFAULT_SERVE_PORT: u16 = 834;
const DEFAULT_XFRD_PORT: u16 = 835;

fn default_bind() -> SocketAddr {
    SocketAddr::new(DEFAULT_BIND_IP, DEFAULT_SERVE_PORT)
}

fn default_xfrd_bind() -> SocketAddr {
    SocketAddr::new(DEFAULT_BIND_IP, DEFAULT_XFRD_PORT)
}

fn default_ypxfr_program() -> PathBuf {
    PathBuf::from("ypxfr")
}

/// The daemons configured by a [`Config`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Daemon {
    Serve,
    Xfrd,
}

impl Daemon {
    pub fn name(self) -> &'static str {
        match self {
            Self::Serve => "ypserv",
            Self::Xfrd => "ypxfrd",
        }
    }

    fn default_port(self) -> u16 {
        match self {
            Self::Serve => DEFAULT_SERVE_PORT,
            Self::Xfrd => DEFAULT_XFRD_PORT,
        }
    }

    /// Returns the address the daemon listens on.
    pub fn bind(self, config: &Config) -> SocketAddr {
        match self {
            Self::Serve => config.bind,
            Self::Xfrd => config.xfrd_bind,
        }
    }

    /// Returns the maximum number of concurrent streamed replies.
    pub fn max_children(self, config: &Config) -> usize {
        config.streaming.max_children.unwrap_or(match self {
            Self::Serve => ypserv::server::DEFAULT_MAX_STREAMS,
            Self::Xfrd => ypserv::xfrd::DEFAULT_MAX_CHILDREN,
        })
    }
}

////////////////////////////////////////////////////////////////////////
// CONFIGURATION SECTION: I/O                                         //
////////////////////////////////////////////////////////////////////////

/// Configuration for the
/// [`BlockingIoProvider`](ypserv::io::BlockingIoProvider). This mirrors
/// [`BlockingIoConfig`] and can be converted into one; its purpose is
/// basically to make the configuration deserializable and to provide
/// defaults.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IoConfig {
    #[serde(default = "default_tcp_base_workers")]
    pub tcp_base_workers: usize,
    #[serde(default = "default_udp_workers")]
    pub udp_workers: usize,
}

fn default_tcp_base_workers() -> usize {
    4
}

fn default_udp_workers() -> usize {
    2
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            tcp_base_workers: default_tcp_base_workers(),
            udp_workers: default_udp_workers(),
        }
    }
}

impl From<&IoConfig> for BlockingIoConfig {
    fn from(toml_config: &IoConfig) -> Self {
        Self {
            tcp_base_workers: toml_config.tcp_base_workers,
            udp_workers_per_socket: toml_config.udp_workers,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// CONFIGURATION SECTION: STREAMING                                   //
////////////////////////////////////////////////////////////////////////

/// Limits on streamed replies (full map dumps and map file transfers).
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamingConfig {
    /// How many streams may be written concurrently on their own
    /// threads. The default depends on the daemon.
    pub max_children: Option<usize>,
}

////////////////////////////////////////////////////////////////////////
// CONFIGURATION SECTION: PUSH                                        //
////////////////////////////////////////////////////////////////////////

/// Settings for the push coordinator.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PushConfig {
    /// How long to wait for each replica's callback, in seconds.
    #[serde(default = "default_push_timeout")]
    pub timeout: u64,
    #[serde(default = "default_push_parallel")]
    pub parallel: usize,
    #[serde(default = "default_callback_bind_ip")]
    pub callback_bind_ip: IpAddr,
    #[serde(default = "default_replica_port")]
    pub default_port: u16,
}

fn default_push_timeout() -> u64 {
    90
}

fn default_push_parallel() -> usize {
    1
}

fn default_callback_bind_ip() -> IpAddr {
    DEFAULT_BIND_IP
}

fn default_replica_port() -> u16 {
    DEFAULT_SERVE_PORT
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            timeout: default_push_timeout(),
            parallel: default_push_parallel(),
            callback_bind_ip: default_callback_bind_ip(),
            default_port: default_replica_port(),
        }
    }
}

impl PushConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

////////////////////////////////////////////////////////////////////////
// WRAPPERS OVER YPSERV TYPES FOR SERDE                               //
////////////////////////////////////////////////////////////////////////

/// Generates a deserializable `ConfigX` structure wrapping an `X` type
/// from [`ypserv`], using its [`FromStr`](std::str::FromStr)
/// implementation.
macro_rules! make_serde_wrapper {
    ($wrapper:ident, $over:ty, $description:literal) => {
        /// A macro-generated deserializable wrapper over a [`ypserv`]
        /// type.
        #[derive(Clone, Debug)]
        pub struct $wrapper(pub $over);

        impl<'de> Deserialize<'de> for $wrapper {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: de::Deserializer<'de>,
            {
                deserializer.deserialize_str(paste! { [<$wrapper Visitor>] })
            }
        }

        paste! {
            /// A macro-generated [`Visitor`](de::Visitor).
            #[derive(Debug)]
            struct [<$wrapper Visitor>];
        }

        impl<'de> de::Visitor<'de> for paste! { [<$wrapper Visitor>] } {
            type Value = $wrapper;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str($description)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                value
                    .parse()
                    .map($wrapper)
                    .map_err(|e| E::custom(format!("invalid {}: {}", $description, e)))
            }
        }
    };
}

make_serde_wrapper!(ConfigSecurenet, Securenet, "securenets entry");
