// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! High-level entry-point – "turn the key and go".
//!
//! The [`GatewayLoader`] consumes configuration, compiles the route table,
//! wires the dispatcher and returns a [`Gateway`] ready to serve.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;

use crate::config::{
    Config, ConfigError, ConfigProvider, EnvConfigProvider, FileConfigProvider, ProxySettings,
    ServerConfig,
};
use crate::core::{ProxyCore, ProxyError};
use crate::filters::{FilterConstructor, FilterRegistry};
use crate::logging::access::{AccessSink, LogAccessSink};
use crate::router::{RouteCompiler, RouteConfig, RouteDefaults, RouteStore};
use crate::server::ProxyServer;
use crate::upstream::{
    Dispatcher, LoadBalancer, RoundRobinBalancer, ServiceRegistry, StaticServiceRegistry,
    UpstreamResolver,
};
use crate::{info_fmt, logging, warn_fmt};

/// Errors that can occur while building or reloading a gateway.
#[derive(Error, Debug)]
pub enum LoaderError {
    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    /// Proxy error
    #[error("proxy error: {0}")]
    ProxyError(#[from] ProxyError),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Where configuration came from, so it can be read again on reload.
#[derive(Debug, Clone, Default)]
struct ConfigSources {
    file: Option<String>,
    env_prefix: Option<String>,
    use_env_vars: bool,
    extra: Vec<Arc<dyn ConfigProvider>>,
}

impl ConfigSources {
    /// File first, then environment, then custom providers; later wins.
    fn load(&self) -> Result<Config, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = &self.file {
            builder = builder.with_provider(FileConfigProvider::new(path)?);
        }

        if self.use_env_vars {
            let env_provider = match &self.env_prefix {
                Some(prefix) => EnvConfigProvider::new(prefix),
                None => EnvConfigProvider::default(),
            };
            builder = builder.with_provider(env_provider);
        }

        for provider in &self.extra {
            builder = builder.with_shared_provider(provider.clone());
        }

        Ok(builder.build())
    }
}

/// Builder for initializing and configuring a gateway.
#[derive(Debug)]
pub struct GatewayLoader {
    config: Option<Config>,
    sources: ConfigSources,
    filters: FilterRegistry,
    access_sink: Option<Arc<dyn AccessSink>>,
    balancer: Option<Arc<dyn LoadBalancer>>,
    registry: Option<Arc<dyn ServiceRegistry>>,
}

impl Default for GatewayLoader {
    fn default() -> Self {
        Self {
            config: None,
            sources: ConfigSources::default(),
            filters: FilterRegistry::with_builtins(),
            access_sink: None,
            balancer: None,
            registry: None,
        }
    }
}

impl GatewayLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a ready-made configuration instead of files and environment.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set a configuration file to load.
    pub fn with_config_file(mut self, file_path: &str) -> Self {
        self.sources.file = Some(file_path.to_string());
        self
    }

    /// Enable environment variable configuration.
    pub fn with_env_vars(mut self) -> Self {
        self.sources.use_env_vars = true;
        self
    }

    /// Set a custom prefix for environment variables (default is "PORTCULLIS_").
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.sources.env_prefix = Some(prefix.to_string());
        self.sources.use_env_vars = true;
        self
    }

    /// Add a configuration provider that overrides file and environment.
    pub fn with_provider<P: ConfigProvider + 'static>(mut self, provider: P) -> Self {
        self.sources.extra.push(Arc::new(provider));
        self
    }

    /// Make a custom filter available to route definitions under `name`.
    pub fn with_filter(mut self, name: &str, ctor: FilterConstructor) -> Self {
        self.filters.register(name, ctor);
        self
    }

    pub fn with_access_sink(mut self, sink: Arc<dyn AccessSink>) -> Self {
        self.access_sink = Some(sink);
        self
    }

    pub fn with_load_balancer(mut self, balancer: Arc<dyn LoadBalancer>) -> Self {
        self.balancer = Some(balancer);
        self
    }

    /// Resolve `lb://` targets through `registry` instead of the
    /// `upstreams` section.
    pub fn with_service_registry(mut self, registry: Arc<dyn ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build the gateway.  Any invalid route, filter or upstream fails here.
    pub fn build(self) -> Result<Gateway, LoaderError> {
        let (config, sources) = match self.config {
            Some(config) => (config, None),
            None => (self.sources.load()?, Some(self.sources)),
        };

        let settings = ProxySettings::from_config(&config)?;
        logging::init_with_config(&settings.logging);
        info_fmt!("Startup", "Portcullis starting up");

        let server_config = ServerConfig::from_config(&config)?;

        let compiler = RouteCompiler::new(
            Arc::new(self.filters),
            settings.global_filters.clone(),
            RouteDefaults {
                connect_timeout: Duration::from_millis(settings.timeouts.connect_ms),
                response_timeout: Duration::from_millis(settings.timeouts.response_ms),
            },
        );
        let routes: Vec<RouteConfig> = config.get_or_default("routes", Vec::new())?;
        let store = Arc::new(RouteStore::new(&routes, compiler)?);

        let (registry, static_registry) = match self.registry {
            Some(registry) => (registry, None),
            None => {
                let upstreams: HashMap<String, Vec<String>> =
                    config.get_or_default("upstreams", HashMap::new())?;
                let static_registry = Arc::new(StaticServiceRegistry::from_config(&upstreams)?);
                info_fmt!("Startup", "Loaded {} upstream service(s)", upstreams.len());
                (
                    static_registry.clone() as Arc<dyn ServiceRegistry>,
                    Some(static_registry),
                )
            }
        };
        let balancer = self
            .balancer
            .unwrap_or_else(|| Arc::new(RoundRobinBalancer::new()));

        let dispatcher = Dispatcher::new(
            UpstreamResolver::new(registry, balancer),
            settings.retry,
            settings.pool,
        );
        let access_sink = self.access_sink.unwrap_or_else(|| Arc::new(LogAccessSink));

        let core = Arc::new(ProxyCore::new(
            store,
            Arc::new(dispatcher),
            access_sink,
            settings.request_timeout(),
        ));
        let server = ProxyServer::new(server_config, core.clone());

        Ok(Gateway {
            config,
            sources,
            core,
            server,
            static_registry,
        })
    }
}

/// A fully wired gateway.
#[derive(Debug, Clone)]
pub struct Gateway {
    config: Config,
    /// `None` when built from a ready-made [`Config`]
    sources: Option<ConfigSources>,
    core: Arc<ProxyCore>,
    server: ProxyServer,
    static_registry: Option<Arc<StaticServiceRegistry>>,
}

impl Gateway {
    pub fn loader() -> GatewayLoader {
        GatewayLoader::new()
    }

    /// The configuration the gateway was built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn core(&self) -> &Arc<ProxyCore> {
        &self.core
    }

    pub fn routes(&self) -> &Arc<RouteStore> {
        self.core.routes()
    }

    /// Serve on the configured address until Ctrl-C or SIGTERM.
    pub async fn start(&self) -> Result<(), LoaderError> {
        self.server.start().await.map_err(LoaderError::ProxyError)
    }

    /// Serve on an already bound listener until `signal` resolves.
    pub async fn serve_with_shutdown<F>(
        &self,
        listener: TcpListener,
        signal: F,
    ) -> Result<(), LoaderError>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        self.server
            .serve_with_shutdown(listener, signal)
            .await
            .map_err(LoaderError::ProxyError)
    }

    /// Replace routes and static upstreams from `config`.
    ///
    /// Either both are replaced or neither is.  Global filters and server
    /// settings keep their startup values.  Returns the new route table
    /// generation.
    pub fn reload(&self, config: &Config) -> Result<u64, LoaderError> {
        let routes: Vec<RouteConfig> = config.get_or_default("routes", Vec::new())?;

        let services = match &self.static_registry {
            Some(_) => {
                let upstreams: HashMap<String, Vec<String>> =
                    config.get_or_default("upstreams", HashMap::new())?;
                Some(StaticServiceRegistry::parse_config(&upstreams)?)
            }
            None => None,
        };

        let generation = self.core.routes().reload(&routes)?;

        if let (Some(registry), Some(services)) = (&self.static_registry, services) {
            registry.replace(services);
        }
        Ok(generation)
    }

    /// Read the configuration sources again and reload from them.
    ///
    /// A gateway built from a ready-made [`Config`] reloads that same
    /// configuration.
    pub fn reload_from_sources(&self) -> Result<u64, LoaderError> {
        let Some(sources) = &self.sources else {
            return self.reload(&self.config);
        };

        match sources.load() {
            Ok(config) => self.reload(&config),
            Err(e) => {
                warn_fmt!("Reload", "Failed to read configuration: {}", e);
                Err(e.into())
            }
        }
    }
}
