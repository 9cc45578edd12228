// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed views of the `server` and `proxy` sections.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Config, ConfigError};
use crate::logging::config::LoggingConfig;
use crate::router::FilterConfig;

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Port of the health listener; disabled when unset
    #[serde(default)]
    pub health_port: Option<u16>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            health_port: None,
        }
    }
}

impl ServerConfig {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            host: config.get_or_default("server.host", default_host())?,
            port: config.get_or_default("server.port", default_port())?,
            health_port: config.get("server.health_port")?,
        })
    }
}

/// Default upstream timeouts, overridable per route.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
    #[serde(default = "default_response_ms")]
    pub response_ms: u64,
}

fn default_connect_ms() -> u64 {
    5_000
}

fn default_response_ms() -> u64 {
    30_000
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            response_ms: default_response_ms(),
        }
    }
}

/// Retry policy for unreachable upstreams.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    1
}

fn default_base_delay_ms() -> u64 {
    10
}

fn default_max_delay_ms() -> u64 {
    200
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Keep-alive pool of the upstream clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

fn default_max_idle_per_host() -> usize {
    32
}

fn default_idle_timeout_ms() -> u64 {
    90_000
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_idle_per_host: default_max_idle_per_host(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

/// Everything under `proxy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub global_filters: Vec<FilterConfig>,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            timeouts: TimeoutSettings::default(),
            retry: RetrySettings::default(),
            pool: PoolSettings::default(),
            logging: LoggingConfig::default(),
            global_filters: Vec::new(),
        }
    }
}

impl ProxySettings {
    /// Read every leaf key so each one can be overridden on its own.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            request_timeout_ms: config
                .get_or_default("proxy.request_timeout_ms", default_request_timeout_ms())?,
            timeouts: TimeoutSettings {
                connect_ms: config
                    .get_or_default("proxy.timeouts.connect_ms", default_connect_ms())?,
                response_ms: config
                    .get_or_default("proxy.timeouts.response_ms", default_response_ms())?,
            },
            retry: RetrySettings {
                max_retries: config
                    .get_or_default("proxy.retry.max_retries", default_max_retries())?,
                base_delay_ms: config
                    .get_or_default("proxy.retry.base_delay_ms", default_base_delay_ms())?,
                max_delay_ms: config
                    .get_or_default("proxy.retry.max_delay_ms", default_max_delay_ms())?,
            },
            pool: PoolSettings {
                max_idle_per_host: config
                    .get_or_default("proxy.pool.max_idle_per_host", default_max_idle_per_host())?,
                idle_timeout_ms: config
                    .get_or_default("proxy.pool.idle_timeout_ms", default_idle_timeout_ms())?,
            },
            logging: config.get_or_default("proxy.logging", LoggingConfig::default())?,
            global_filters: config.get_or_default("proxy.global_filters", Vec::new())?,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
