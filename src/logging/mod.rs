// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logging setup and the per-request access log.
//!
//! All components log through the `log` facade via the `*_fmt!` macros.
//! With `proxy.logging.structured = true` a global slog logger is installed
//! and `slog_stdlog` bridges the facade into it; otherwise env_logger prints
//! the records.

pub mod access;
pub mod config;
pub mod structured;
pub mod wrapper;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
use once_cell::sync::OnceCell;

use self::config::LoggingConfig;
use self::structured::{LoggerGuard, init_global_logger};

static USING_STRUCTURED: AtomicBool = AtomicBool::new(false);
static GLOBAL_GUARD: OnceCell<LoggerGuard> = OnceCell::new();

/// Whether records currently go through slog.
pub fn is_structured_logging() -> bool {
    USING_STRUCTURED.load(Ordering::SeqCst)
}

/// Initialize env_logger at `level` unless `RUST_LOG` says otherwise.
///
/// Only the first logger installed in a process wins; later calls only
/// adjust the maximum level.
pub fn init(level: Option<LevelFilter>) {
    let level = level.unwrap_or(LevelFilter::Info);
    let env = env_logger::Env::default().filter_or("RUST_LOG", level.to_string());

    let installed = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .format_target(true)
        .try_init()
        .is_ok();

    if installed {
        log::info!("Logging initialized at level: {}", log::max_level());
    } else {
        log::set_max_level(level);
    }
}

/// Initialize logging from `proxy.logging`.
pub fn init_with_config(config: &LoggingConfig) {
    let level = config.level_filter();

    if !config.structured {
        init(Some(level));
        return;
    }

    let mut installed = false;
    GLOBAL_GUARD.get_or_init(|| {
        installed = true;
        init_global_logger(&config.to_logger_config())
    });

    if installed {
        let bridged = slog_stdlog::init_with_level(level.to_level().unwrap_or(log::Level::Error));
        if bridged.is_ok() {
            USING_STRUCTURED.store(true, Ordering::SeqCst);
        }
    }
    log::set_max_level(level);
}
