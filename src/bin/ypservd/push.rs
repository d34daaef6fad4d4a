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

//! Implements the `push` command.

use std::process;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};

use ypserv::db::MapDir;
use ypserv::proto::XfrStat;
use ypserv::push::{PushConfig, Pusher};
use ypserv::thread::ThreadGroup;

use crate::args::PushArgs;
use crate::config;
use crate::logging;
use crate::run::describe_failure;

/// Pushes maps, exiting with failure if any replica was not updated.
pub fn run(args: PushArgs) {
    logging::init();
    if args.verbose {
        logging::toggle_debug();
    }

    match try_pushing(args) {
        Ok(true) => (),
        Ok(false) => process::exit(1),
        Err(e) => {
            error!("{}", describe_failure("Failed to push:", &e));
            process::exit(1);
        }
    }
}

/// Returns whether every replica reported success.
fn try_pushing(args: PushArgs) -> Result<bool> {
    let (map_dir, push_config) = match args.config {
        Some(ref path) => {
            let config =
                config::load_from_path(path, false).context("failed to load the configuration")?;
            (config.map_dir, config.push)
        }
        None => {
            let map_dir = args
                .map_dir
                .clone()
                .ok_or_else(|| anyhow!("no map directory was given"))?;
            (map_dir, config::PushConfig::default())
        }
    };
    let local_host = match args.local_host {
        Some(ref name) => name.clone(),
        None => system_host_name().context("failed to determine the local host name")?,
    };

    let pusher = Pusher::new(
        MapDir::new(map_dir),
        PushConfig {
            domain: args.domain.clone(),
            local_host,
            timeout: args
                .timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| push_config.timeout()),
            parallel: args.parallel.unwrap_or(push_config.parallel),
            callback_ip: push_config.callback_bind_ip,
            default_port: push_config.default_port,
        },
    );
    let hosts = pusher
        .replicas(&args.hosts)
        .with_context(|| format!("cannot read the server list of domain {}", args.domain))?;
    if hosts.is_empty() {
        warn!("No replicas to push to.");
        return Ok(true);
    }

    let group = ThreadGroup::new();
    let outcomes = pusher.push(&group, &args.maps, &hosts);
    group.shut_down();

    // Maps this host does not master produce no outcomes at all.
    let attempted = args.maps.len() * hosts.len();
    let succeeded = outcomes
        .iter()
        .filter(|outcome| matches!(outcome.result, Ok(XfrStat::Succ)))
        .count();
    if succeeded == attempted {
        info!("All {} transfers succeeded.", attempted);
        Ok(true)
    } else {
        error!("{} of {} transfers did not succeed.", attempted - succeeded, attempted);
        Ok(false)
    }
}

#[cfg(unix)]
fn system_host_name() -> Result<String> {
    let name = nix::unistd::gethostname()?;
    name.into_string()
        .map_err(|name| anyhow!("the host name {:?} is not valid UTF-8", name))
}

#[cfg(not(unix))]
fn system_host_name() -> Result<String> {
    Err(anyhow!("the host name must be given with --local-host"))
}
