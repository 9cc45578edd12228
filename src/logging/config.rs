// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `proxy.logging` settings.

use crate::logging::structured::{LogFormat, LoggerConfig};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Logging configuration (`proxy.logging`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Route log records through slog instead of env_logger
    #[serde(default)]
    pub structured: bool,

    /// `terminal` or `json` (structured only)
    #[serde(default = "default_format")]
    pub format: String,

    #[serde(default = "default_level")]
    pub level: String,

    /// Include source location (structured only)
    #[serde(default = "default_true")]
    pub include_location: bool,

    /// Include thread id (structured only)
    #[serde(default = "default_true")]
    pub include_thread_id: bool,

    /// Fields attached to every record (structured only)
    #[serde(default)]
    pub static_fields: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_format() -> String {
    "terminal".to_string()
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            structured: false,
            format: default_format(),
            level: default_level(),
            include_location: true,
            include_thread_id: true,
            static_fields: BTreeMap::new(),
        }
    }
}

impl LoggingConfig {
    /// Level as understood by the `log` facade; unknown names mean `info`.
    pub fn level_filter(&self) -> LevelFilter {
        match self.severity() {
            None => LevelFilter::Off,
            Some(slog::Level::Trace) => LevelFilter::Trace,
            Some(slog::Level::Debug) => LevelFilter::Debug,
            Some(slog::Level::Info) => LevelFilter::Info,
            Some(slog::Level::Warning) => LevelFilter::Warn,
            Some(slog::Level::Error | slog::Level::Critical) => LevelFilter::Error,
        }
    }

    /// `None` for `off`.
    fn severity(&self) -> Option<slog::Level> {
        let level = match self.level.to_ascii_lowercase().as_str() {
            "off" => return None,
            "trace" => slog::Level::Trace,
            "debug" => slog::Level::Debug,
            "warn" | "warning" => slog::Level::Warning,
            "error" => slog::Level::Error,
            "critical" => slog::Level::Critical,
            _ => slog::Level::Info,
        };
        Some(level)
    }

    pub fn to_logger_config(&self) -> LoggerConfig {
        let format = if self.format.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Terminal
        };

        LoggerConfig {
            format,
            // slog has no "off"; the facade level filters everything instead
            level: self.severity().unwrap_or(slog::Level::Critical),
            include_location: self.include_location,
            include_thread_id: self.include_thread_id,
            static_fields: self.static_fields.clone().into_iter().collect(),
        }
    }
}
