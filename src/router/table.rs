// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compiled routes, immutable route tables and the swappable store.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;

use super::{FilterConfig, Predicate, PredicateFactory, RouteConfig};
use crate::core::{InboundRequest, ProxyError};
use crate::filters::{FilterChain, FilterRegistry};
use crate::upstream::TargetSpec;
use crate::{debug_fmt, info_fmt, warn_fmt};

/// A route compiled from its [`RouteConfig`].
pub struct Route {
    pub id: String,
    pub target: TargetSpec,
    pub priority: i32,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    /// Overrides the dispatcher-wide retry bound when set.
    pub max_retries: Option<u32>,
    /// Generation of the table this route was compiled into.
    pub generation: u64,
    predicates: Vec<Arc<dyn Predicate>>,
    chain: FilterChain,
    literal_segments: usize,
    declared_at: usize,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("priority", &self.priority)
            .field("generation", &self.generation)
            .field("predicates", &self.predicates)
            .field("filters", &self.chain.len())
            .finish()
    }
}

impl Route {
    /// True when every predicate accepts the request.
    pub fn matches(&self, request: &InboundRequest) -> bool {
        self.predicates.iter().all(|p| p.matches(request))
    }

    pub fn chain(&self) -> &FilterChain {
        &self.chain
    }

    /// Literal segments of the route's path pattern.
    pub fn specificity(&self) -> usize {
        self.literal_segments
    }
}

/// Timeouts applied to routes that do not override them.
#[derive(Debug, Clone, Copy)]
pub struct RouteDefaults {
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
}

impl Default for RouteDefaults {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(5_000),
            response_timeout: Duration::from_millis(30_000),
        }
    }
}

/// Turns route definitions into [`Route`]s.
#[derive(Debug)]
pub struct RouteCompiler {
    registry: Arc<FilterRegistry>,
    global_filters: Vec<FilterConfig>,
    defaults: RouteDefaults,
}

impl RouteCompiler {
    pub fn new(
        registry: Arc<FilterRegistry>,
        global_filters: Vec<FilterConfig>,
        defaults: RouteDefaults,
    ) -> Self {
        Self {
            registry,
            global_filters,
            defaults,
        }
    }

    fn compile(
        &self,
        config: &RouteConfig,
        generation: u64,
        declared_at: usize,
    ) -> Result<Route, ProxyError> {
        if config.id.trim().is_empty() {
            return Err(ProxyError::Configuration(format!(
                "route #{declared_at} has an empty id"
            )));
        }

        let target = TargetSpec::parse(&config.target, config.selection_hint.clone())
            .map_err(|e| with_route(&config.id, e))?;

        let predicates = config
            .predicates
            .iter()
            .map(|p| PredicateFactory::create_predicate(&p.type_, p.config.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| with_route(&config.id, e))?;

        let literal_segments = predicates
            .iter()
            .map(|p| p.specificity())
            .max()
            .unwrap_or(0);

        let chain = FilterChain::build(&config.filters, &self.global_filters, &self.registry)
            .map_err(|e| with_route(&config.id, e))?;

        let timeouts = config.timeouts.clone().unwrap_or_default();

        Ok(Route {
            id: config.id.clone(),
            target,
            priority: config.priority,
            connect_timeout: timeouts
                .connect_ms
                .map(Duration::from_millis)
                .unwrap_or(self.defaults.connect_timeout),
            response_timeout: timeouts
                .response_ms
                .map(Duration::from_millis)
                .unwrap_or(self.defaults.response_timeout),
            max_retries: config.max_retries,
            generation,
            predicates,
            chain,
            literal_segments,
            declared_at,
        })
    }
}

fn with_route(id: &str, err: ProxyError) -> ProxyError {
    match err {
        ProxyError::Configuration(msg) => ProxyError::Configuration(format!("route '{id}': {msg}")),
        other => other,
    }
}

/// One immutable generation of compiled routes.
#[derive(Debug, Default)]
pub struct RouteTable {
    generation: u64,
    routes: HashMap<String, Arc<Route>>,
    ordered: Vec<Arc<Route>>,
}

impl RouteTable {
    /// Compile every definition; the first invalid one fails the whole table.
    pub fn build(definitions: &[RouteConfig], compiler: &RouteCompiler) -> Result<Self, ProxyError> {
        Self::build_generation(definitions, compiler, 1)
    }

    fn build_generation(
        definitions: &[RouteConfig],
        compiler: &RouteCompiler,
        generation: u64,
    ) -> Result<Self, ProxyError> {
        let mut routes = HashMap::with_capacity(definitions.len());
        let mut ordered = Vec::with_capacity(definitions.len());

        for (index, definition) in definitions.iter().enumerate() {
            let route = Arc::new(compiler.compile(definition, generation, index)?);
            if routes.insert(route.id.clone(), route.clone()).is_some() {
                return Err(ProxyError::Configuration(format!(
                    "duplicate route id '{}'",
                    route.id
                )));
            }
            ordered.push(route);
        }

        // stable: declaration order survives full ties
        ordered.sort_by_key(|r| (Reverse(r.priority), Reverse(r.literal_segments), r.declared_at));

        Ok(Self {
            generation,
            routes,
            ordered,
        })
    }

    /// First route, in evaluation order, whose predicates all hold.
    pub fn find(&self, request: &InboundRequest) -> Option<Arc<Route>> {
        let found = self.ordered.iter().find(|r| r.matches(request)).cloned();
        if let Some(route) = &found {
            debug_fmt!("Router", "Route '{}' matched {} {}", route.id, request.method, request.path);
        }
        found
    }

    pub fn get(&self, id: &str) -> Option<Arc<Route>> {
        self.routes.get(id).cloned()
    }

    /// Routes in evaluation order.
    pub fn routes(&self) -> &[Arc<Route>] {
        &self.ordered
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Holds the active [`RouteTable`] and swaps it on reload.
///
/// Lookups load the current snapshot without locking; reloads are
/// serialized among themselves.
pub struct RouteStore {
    current: ArcSwap<RouteTable>,
    compiler: RouteCompiler,
    generation: AtomicU64,
    reload_lock: Mutex<()>,
}

impl fmt::Debug for RouteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.current.load();
        f.debug_struct("RouteStore")
            .field("generation", &table.generation())
            .field("routes", &table.len())
            .finish()
    }
}

impl RouteStore {
    /// Build the first table from `definitions`.
    pub fn new(definitions: &[RouteConfig], compiler: RouteCompiler) -> Result<Self, ProxyError> {
        let table = RouteTable::build_generation(definitions, &compiler, 1)?;
        info_fmt!("Router", "Loaded {} route(s), generation 1", table.len());
        Ok(Self {
            current: ArcSwap::from_pointee(table),
            compiler,
            generation: AtomicU64::new(1),
            reload_lock: Mutex::new(()),
        })
    }

    /// The table currently in effect.
    pub fn snapshot(&self) -> Arc<RouteTable> {
        self.current.load_full()
    }

    /// Compile `definitions` and make them the active table.
    ///
    /// On error the active table is left untouched.
    pub fn reload(&self, definitions: &[RouteConfig]) -> Result<u64, ProxyError> {
        let _guard = self.reload_lock.lock().unwrap_or_else(|p| p.into_inner());
        let next = self.generation.load(Ordering::Acquire) + 1;

        let table = match RouteTable::build_generation(definitions, &self.compiler, next) {
            Ok(table) => table,
            Err(err) => {
                warn_fmt!(
                    "Router",
                    "Reload rejected, keeping generation {}: {}",
                    self.generation.load(Ordering::Acquire),
                    err
                );
                return Err(err);
            }
        };

        let count = table.len();
        self.current.store(Arc::new(table));
        self.generation.store(next, Ordering::Release);
        info_fmt!("Router", "Loaded {} route(s), generation {}", count, next);
        Ok(next)
    }
}
