// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Portcullis configuration subsystem
//!
//! A running gateway is created from an ordered list of [`ConfigProvider`]s;
//! later providers override earlier ones.  Typical stacking order:
//!
//! 1. `FileConfigProvider` – `portcullis.{toml,json,yaml}`
//! 2. `EnvConfigProvider`  – `PORTCULLIS_SERVER_PORT=9090`
//! 3. *your* provider implementing [`ConfigProvider`]
//!
//! Calling [`Config::get`] is therefore *deterministic*: the last provider
//! in the chain that has a key wins.
//!
//! | key | type | default |
//! |-----|------|---------|
//! | `server.host`                     | string    | `127.0.0.1` |
//! | `server.port`                     | u16       | `8080`      |
//! | `server.health_port`              | u16       | disabled    |
//! | `proxy.request_timeout_ms`        | u64       | `30000`     |
//! | `proxy.timeouts.connect_ms`       | u64       | `5000`      |
//! | `proxy.timeouts.response_ms`      | u64       | `30000`     |
//! | `proxy.retry.max_retries`         | u32       | `1`         |
//! | `proxy.retry.base_delay_ms`       | u64       | `10`        |
//! | `proxy.retry.max_delay_ms`        | u64       | `200`       |
//! | `proxy.pool.max_idle_per_host`    | usize     | `32`        |
//! | `proxy.pool.idle_timeout_ms`      | u64       | `90000`     |
//! | `proxy.logging`                   | object    | terminal, info |
//! | `proxy.global_filters`            | array     | `[]`        |
//! | `routes`                          | array     | `[]`        |
//! | `upstreams`                       | object    | `{}`        |

mod env;
pub mod error;
mod file;
mod proxy;


pub use env::EnvConfigProvider;
pub use error::ConfigError;
pub use file::{FileConfigProvider, FileFormat};
pub use proxy::{PoolSettings, ProxySettings, RetrySettings, ServerConfig, TimeoutSettings};

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;

use crate::trace_fmt;

/// Core configuration provider trait that all configuration sources must implement.
pub trait ConfigProvider: Debug + Send + Sync {
    /// Check if the configuration provider has a value for the given key.
    fn has(&self, key: &str) -> bool;

    /// Get the name of the configuration provider for debugging purposes.
    fn provider_name(&self) -> &str;

    /// Get a raw configuration value by dot-separated key.
    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError>;
}

/// Typed access for any concrete provider.
pub trait ConfigProviderExt: ConfigProvider {
    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.get_raw(key)?
            .map(|value| deserialize(key, value))
            .transpose()
    }
}

impl<T: ConfigProvider> ConfigProviderExt for T {}

fn deserialize<T: DeserializeOwned>(key: &str, value: Value) -> Result<T, ConfigError> {
    serde_json::from_value(value).map_err(|e| ConfigError::invalid_value(key, e))
}

/// Builder for the configuration system.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    providers: Vec<Arc<dyn ConfigProvider>>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a configuration provider.
    pub fn with_provider<P: ConfigProvider + 'static>(mut self, provider: P) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    /// Add an already shared provider.
    pub fn with_shared_provider(mut self, provider: Arc<dyn ConfigProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn build(self) -> Config {
        Config {
            providers: self.providers,
        }
    }
}

/// Holds all providers and resolves keys against them.
#[derive(Debug, Clone, Default)]
pub struct Config {
    providers: Vec<Arc<dyn ConfigProvider>>,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        for provider in self.providers.iter().rev() {
            if provider.has(key) {
                trace_fmt!("Config", "'{}' answered by {}", key, provider.provider_name());
                return provider.get_raw(key);
            }
        }
        Ok(None)
    }

    /// Get a configuration value from the last provider that has `key`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.get_raw(key)?
            .map(|value| deserialize(key, value))
            .transpose()
    }

    pub fn get_or_default<T: DeserializeOwned>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T, ConfigError> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Configuration backed by a single file.
    pub fn default_file(file_path: &str) -> Result<Self, ConfigError> {
        let provider = FileConfigProvider::new(file_path)?;
        Ok(Self::builder().with_provider(provider).build())
    }
}
