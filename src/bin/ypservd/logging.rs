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

//! Sets up logging.
//!
//! Records are filtered by `RUST_LOG` (default `warn`) until debugging
//! is switched on at runtime, after which everything at `debug` and
//! above is logged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use env_logger::{Builder, Env, Logger};
use log::{LevelFilter, Log, Metadata, Record};

static LOGGER: OnceLock<ToggleLogger> = OnceLock::new();

struct ToggleLogger {
    normal: Logger,
    debug: Logger,
    debugging: AtomicBool,
}

impl ToggleLogger {
    fn current(&self) -> &Logger {
        if self.debugging.load(Ordering::Relaxed) {
            &self.debug
        } else {
            &self.normal
        }
    }
}

impl Log for ToggleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.current().enabled(metadata)
    }

    fn log(&self, record: &Record) {
        self.current().log(record)
    }

    fn flush(&self) {
        self.current().flush()
    }
}

/// Installs the logger.
pub fn init() {
    let normal = Builder::from_env(Env::new().default_filter_or("warn")).build();
    let debug = Builder::new().filter_level(LevelFilter::Debug).build();
    let max_level = normal.filter();
    let logger = LOGGER.get_or_init(|| ToggleLogger {
        normal,
        debug,
        debugging: AtomicBool::new(false),
    });
    if log::set_logger(logger).is_ok() {
        log::set_max_level(max_level);
    }
}

/// Switches debug logging on or off, returning whether it is now on.
pub fn toggle_debug() -> bool {
    let Some(logger) = LOGGER.get() else {
        return false;
    };
    let debugging = !logger.debugging.fetch_xor(true, Ordering::Relaxed);
    log::set_max_level(logger.current().filter());
    debugging
}
