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

//! Implements the `serve` and `xfrd` commands (i.e., running the
//! daemons).

use std::fmt::Write;
use std::fs;
use std::path::Path;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info, warn};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM, SIGUSR1};
use signal_hook::iterator::Signals;

use ypserv::access::{PolicyFile, Securenets};
use ypserv::db::MapDir;
use ypserv::io::BlockingIoProvider;
use ypserv::server::{Server, Service, Ypxfr};
use ypserv::thread::ThreadGroup;
use ypserv::xfrd::XfrdServer;

use crate::args::DaemonArgs;
use crate::config::{self, Config, Daemon};
use crate::logging;

/// Runs the directory server.
pub fn serve(args: DaemonArgs) {
    run(args, Daemon::Serve)
}

/// Runs the map file transfer server.
pub fn xfrd(args: DaemonArgs) {
    run(args, Daemon::Xfrd)
}

fn run(args: DaemonArgs, daemon: Daemon) {
    logging::init();

    if let Err(e) = try_running(args, daemon) {
        error!("{}", describe_failure("Failed to run:", &e));
        error!("Exiting with failure.");
        process::exit(1);
    }
    info!("Exiting with success.");
}

/// Renders an error and its causes as a numbered list.
pub fn describe_failure(headline: &str, e: &anyhow::Error) -> String {
    let mut message = String::from(headline);
    for (i, cause) in e.chain().enumerate() {
        write!(message, "\n[{}] {}", i + 1, cause).unwrap();
    }
    message
}

fn try_running(args: DaemonArgs, daemon: Daemon) -> Result<()> {
    info!(
        "{} (ypservd v{}.{}.{}) starting.",
        daemon.name(),
        env!("CARGO_PKG_VERSION_MAJOR"),
        env!("CARGO_PKG_VERSION_MINOR"),
        env!("CARGO_PKG_VERSION_PATCH"),
    );

    // Get the configuration, either from the file system or from the
    // command line arguments, as appropriate.
    let config_path = args.config.clone();
    let config = if let Some(ref config_path) = config_path {
        info!("Loading the configuration from {}.", config_path.display());
        config::load_from_path(config_path, false).context("failed to load the configuration")?
    } else {
        info!("Loading the configuration from the command line.");
        config::load_from_args(args, daemon).context("failed to load the configuration")?
    };
    let reload_source = match config_path {
        Some(ref path) => ReloadSource::Config(path.as_path()),
        None => ReloadSource::Args(&config),
    };

    let metadata = fs::metadata(&config.map_dir).with_context(|| {
        format!("cannot access the map directory {}", config.map_dir.display())
    })?;
    if !metadata.is_dir() {
        anyhow::bail!("{} is not a directory", config.map_dir.display());
    }
    let maps = MapDir::new(&config.map_dir);

    // Bind before loading anything else, so that we fail fast. The
    // transfer server only speaks TCP.
    let bind = daemon.bind(&config);
    let udp_addrs = match daemon {
        Daemon::Serve => vec![bind],
        Daemon::Xfrd => Vec::new(),
    };
    let io_provider = BlockingIoProvider::bind((&config.io).into(), [bind], udp_addrs)
        .context("failed to bind sockets")?;
    let (policy, securenets) =
        config::load_access(&config).context("failed to load the access rules")?;

    let max_children = daemon.max_children(&config);
    match daemon {
        Daemon::Serve => {
            let mut server = Server::new(maps);
            server.set_max_streams(max_children);
            server.set_transferer(Box::new(Ypxfr::new(&config.ypxfr_program)));
            server.apply_policy(&policy, securenets);
            run_until_signalled(server, io_provider, &reload_source)
        }
        Daemon::Xfrd => {
            let mut server = XfrdServer::new(maps);
            server.set_max_children(max_children);
            server.apply_policy(&policy, securenets);
            run_until_signalled(server, io_provider, &reload_source)
        }
    }
}

/// A service whose access rules can be reloaded.
trait Reloadable: Service {
    fn reload(&self, policy: &PolicyFile, securenets: Securenets);
}

impl Reloadable for Server {
    fn reload(&self, policy: &PolicyFile, securenets: Securenets) {
        self.apply_policy(policy, securenets);
        self.clear_cache();
    }
}

impl Reloadable for XfrdServer {
    fn reload(&self, policy: &PolicyFile, securenets: Securenets) {
        self.apply_policy(policy, securenets);
    }
}

fn run_until_signalled<S: Reloadable>(
    service: S,
    io_provider: BlockingIoProvider,
    reload_source: &ReloadSource,
) -> Result<()> {
    // Set up signal handling.
    let mut signals = set_up_signal_handling().context("failed to set up signal handling")?;

    // Start the I/O provider.
    info!("Set-up is complete; starting the server.");
    let thread_group = ThreadGroup::new();
    let service = Arc::new(service);
    io_provider
        .start(&service, &thread_group)
        .context("failed to start the I/O provider")?;

    // Process incoming signals.
    for signal in signals.forever() {
        match signal {
            s @ (SIGINT | SIGTERM) => {
                let name = match s {
                    SIGINT => "SIGINT",
                    SIGTERM => "SIGTERM",
                    _ => unreachable!(),
                };
                info!("Received {}; shutting down.", name);
                break;
            }
            SIGHUP => {
                info!("Received SIGHUP; reloading the access rules.");
                if let Err(e) = reload_access(reload_source, &*service) {
                    error!("{}", describe_failure("Failed to reload the access rules:", &e));
                }
            }
            SIGUSR1 => {
                if logging::toggle_debug() {
                    warn!("Received SIGUSR1; debug logging enabled.");
                } else {
                    warn!("Received SIGUSR1; debug logging disabled.");
                }
            }
            _ => unreachable!(),
        }
    }

    // Shut down the server.
    if BlockingIoProvider::SUPPORTS_GRACEFUL_SHUTDOWN {
        thread_group.shut_down();
        thread_group.await_shutdown();
        info!("Shutdown complete.");
    }
    Ok(())
}

fn set_up_signal_handling() -> Result<Signals> {
    let all_signals = &[SIGHUP, SIGINT, SIGTERM, SIGUSR1];
    let term_signals = &[SIGINT, SIGTERM];
    let already_terminating = Arc::new(AtomicBool::new(false));

    // This sets up signal handlers to exit immediately if a second
    // termination signal arrives before the process finishes shutting
    // down gracefully.
    for sig in term_signals {
        signal_hook::flag::register_conditional_shutdown(*sig, 1, already_terminating.clone())?;
        signal_hook::flag::register(*sig, already_terminating.clone())?;
    }

    Signals::new(all_signals).map_err(Into::into)
}

enum ReloadSource<'a> {
    Args(&'a Config),
    Config(&'a Path),
}

fn reload_access(reload_source: &ReloadSource, service: &impl Reloadable) -> Result<()> {
    let (policy, securenets) = match reload_source {
        ReloadSource::Args(config) => config::load_access(config)?,
        ReloadSource::Config(path) => {
            let config =
                config::load_from_path(path, true).context("failed to reload the configuration")?;
            config::load_access(&config)?
        }
    };
    service.reload(&policy, securenets);
    Ok(())
}
