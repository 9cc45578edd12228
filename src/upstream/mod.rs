// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Upstream targets, service discovery hooks & the dispatcher.
//!
//! A route target is either a fixed base URL (`http://orders:8080/api`) or a
//! logical service (`lb://order-svc`).  Logical services are resolved on
//! every dispatch attempt through a [`ServiceRegistry`] and a
//! [`LoadBalancer`], so a retry may land on a different instance.

mod dispatcher;


pub use dispatcher::{ClientPool, Dispatcher, calculate_backoff};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use rand::Rng;
use reqwest::Url;

use crate::core::{DispatchError, DispatchErrorKind, ProxyError};
use crate::router::Route;
use crate::trace_fmt;

const SERVICE_SCHEME: &str = "lb://";

/// Where a route sends its traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetSpec {
    /// A fixed `http(s)` base URL
    Url(Url),
    /// A logical service resolved per attempt
    Service { name: String, hint: Option<String> },
}

impl TargetSpec {
    pub fn parse(target: &str, hint: Option<String>) -> Result<Self, ProxyError> {
        if let Some(name) = target.strip_prefix(SERVICE_SCHEME) {
            let name = name.trim_end_matches('/');
            if name.is_empty() || name.contains('/') {
                return Err(ProxyError::Configuration(format!(
                    "invalid service target '{target}'"
                )));
            }
            return Ok(TargetSpec::Service {
                name: name.to_string(),
                hint,
            });
        }

        let url = Url::parse(target)
            .map_err(|e| ProxyError::Configuration(format!("invalid target '{target}': {e}")))?;
        check_base_url(&url).map_err(|msg| {
            ProxyError::Configuration(format!("invalid target '{target}': {msg}"))
        })?;
        Ok(TargetSpec::Url(url))
    }
}

fn check_base_url(url: &Url) -> Result<(), &'static str> {
    if !matches!(url.scheme(), "http" | "https") {
        return Err("scheme must be http, https or lb");
    }
    if url.host_str().is_none() {
        return Err("missing host");
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err("base URL cannot carry a query or fragment");
    }
    Ok(())
}

/// A fully resolved destination for one dispatch attempt.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub base: Url,
    /// Instance id when resolved through a service registry
    pub instance: Option<String>,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
}

impl UpstreamTarget {
    /// Join the base path with the outbound path and attach the query.
    pub fn url_for(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.base.clone();
        let base_path = self.base.path().trim_end_matches('/');
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        url.set_path(&format!("{base_path}{path}"));
        url.set_query(query.filter(|q| !q.is_empty()));
        url
    }
}

impl fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.base.as_str().trim_end_matches('/'))
    }
}

/// One addressable instance of a logical service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInstance {
    pub id: String,
    pub url: Url,
}

impl ServiceInstance {
    pub fn parse(raw: &str) -> Result<Self, ProxyError> {
        let url = Url::parse(raw)
            .map_err(|e| ProxyError::Configuration(format!("invalid instance '{raw}': {e}")))?;
        check_base_url(&url)
            .map_err(|msg| ProxyError::Configuration(format!("invalid instance '{raw}': {msg}")))?;
        Ok(Self {
            id: raw.trim_end_matches('/').to_string(),
            url,
        })
    }
}

/// Source of instances for logical services.
pub trait ServiceRegistry: fmt::Debug + Send + Sync {
    /// Current instances of `service`, or `None` if it is unknown.
    fn instances(&self, service: &str) -> Option<Arc<Vec<ServiceInstance>>>;
}

/// Picks one instance per attempt.
pub trait LoadBalancer: fmt::Debug + Send + Sync {
    fn select(
        &self,
        service: &str,
        instances: &[ServiceInstance],
        hint: Option<&str>,
    ) -> Option<ServiceInstance>;
}

type InstanceMap = HashMap<String, Arc<Vec<ServiceInstance>>>;

/// Registry backed by the `upstreams` configuration section.
#[derive(Debug, Default)]
pub struct StaticServiceRegistry {
    services: ArcSwap<InstanceMap>,
}

impl StaticServiceRegistry {
    pub fn new(services: HashMap<String, Vec<ServiceInstance>>) -> Self {
        Self {
            services: ArcSwap::from_pointee(Self::index(services)),
        }
    }

    /// Parse `{ service: [url, ...] }`.
    pub fn from_config(config: &HashMap<String, Vec<String>>) -> Result<Self, ProxyError> {
        Ok(Self::new(Self::parse_config(config)?))
    }

    pub fn parse_config(
        config: &HashMap<String, Vec<String>>,
    ) -> Result<HashMap<String, Vec<ServiceInstance>>, ProxyError> {
        config
            .iter()
            .map(|(service, urls)| {
                let instances = urls
                    .iter()
                    .map(|url| ServiceInstance::parse(url))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| match e {
                        ProxyError::Configuration(msg) => {
                            ProxyError::Configuration(format!("upstream '{service}': {msg}"))
                        }
                        other => other,
                    })?;
                Ok((service.clone(), instances))
            })
            .collect()
    }

    /// Swap in a new instance set for every service at once.
    pub fn replace(&self, services: HashMap<String, Vec<ServiceInstance>>) {
        self.services.store(Arc::new(Self::index(services)));
    }

    fn index(services: HashMap<String, Vec<ServiceInstance>>) -> InstanceMap {
        services
            .into_iter()
            .map(|(name, instances)| (name, Arc::new(instances)))
            .collect()
    }
}

impl ServiceRegistry for StaticServiceRegistry {
    fn instances(&self, service: &str) -> Option<Arc<Vec<ServiceInstance>>> {
        self.services.load().get(service).cloned()
    }
}

fn pinned(instances: &[ServiceInstance], hint: Option<&str>) -> Option<ServiceInstance> {
    let hint = hint?;
    instances.iter().find(|i| i.id == hint).cloned()
}

/// Cycles through instances per service.  A hint naming an instance id
/// pins the selection to it.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    counters: RwLock<HashMap<String, AtomicUsize>>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_index(&self, service: &str) -> usize {
        {
            let counters = self.counters.read().unwrap_or_else(|p| p.into_inner());
            if let Some(counter) = counters.get(service) {
                return counter.fetch_add(1, Ordering::Relaxed);
            }
        }
        let mut counters = self.counters.write().unwrap_or_else(|p| p.into_inner());
        counters
            .entry(service.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn select(
        &self,
        service: &str,
        instances: &[ServiceInstance],
        hint: Option<&str>,
    ) -> Option<ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        if let Some(instance) = pinned(instances, hint) {
            return Some(instance);
        }
        let index = self.next_index(service) % instances.len();
        instances.get(index).cloned()
    }
}

/// Uniformly random selection.
#[derive(Debug, Default)]
pub struct RandomBalancer;

impl LoadBalancer for RandomBalancer {
    fn select(
        &self,
        _service: &str,
        instances: &[ServiceInstance],
        hint: Option<&str>,
    ) -> Option<ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        if let Some(instance) = pinned(instances, hint) {
            return Some(instance);
        }
        let index = rand::thread_rng().gen_range(0..instances.len());
        instances.get(index).cloned()
    }
}

/// Turns a route's [`TargetSpec`] into an [`UpstreamTarget`].
#[derive(Debug, Clone)]
pub struct UpstreamResolver {
    registry: Arc<dyn ServiceRegistry>,
    balancer: Arc<dyn LoadBalancer>,
}

impl UpstreamResolver {
    pub fn new(registry: Arc<dyn ServiceRegistry>, balancer: Arc<dyn LoadBalancer>) -> Self {
        Self { registry, balancer }
    }

    pub fn resolve(&self, route: &Route) -> Result<UpstreamTarget, DispatchError> {
        let (base, instance) = match &route.target {
            TargetSpec::Url(url) => (url.clone(), None),
            TargetSpec::Service { name, hint } => {
                let instances = self.registry.instances(name).ok_or_else(|| {
                    DispatchError::new(
                        DispatchErrorKind::NoInstance,
                        format!("unknown service '{name}'"),
                    )
                })?;
                let chosen = self
                    .balancer
                    .select(name, &instances, hint.as_deref())
                    .ok_or_else(|| {
                        DispatchError::new(
                            DispatchErrorKind::NoInstance,
                            format!("no instance available for service '{name}'"),
                        )
                    })?;
                trace_fmt!("Upstream", "Service '{}' resolved to {}", name, chosen.id);
                (chosen.url, Some(chosen.id))
            }
        };

        Ok(UpstreamTarget {
            base,
            instance,
            connect_timeout: route.connect_timeout,
            response_timeout: route.response_timeout,
        })
    }
}
