// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Routing DSL – *predicates*, the route table & the matcher.
//!
//! A [`RouteTable`] owns an immutable, pre-sorted vector of compiled
//! [`Route`]s.  The first route whose **predicate stack** returns `true`
//! wins.  Evaluation order is fixed when the table is built:
//!
//! 1. higher `priority` first,
//! 2. then the route whose path pattern has more literal segments,
//! 3. then declaration order.
//!
//! Tables are never mutated; [`RouteStore`] swaps whole snapshots.
//!
//! ### Built-in predicates
//! | type     | configuration                                  |
//! |----------|------------------------------------------------|
//! | `path`   | `{ "pattern": "/orders/:id/*" }`               |
//! | `method` | `{ "methods": ["GET", "HEAD"] }`               |
//! | `header` | `{ "headers": { "x-tenant": "acme" } }`        |
//! | `query`  | `{ "params": { "tenant": "acme" } }`           |
//! | `host`   | `{ "patterns": ["*.example.com"] }`            |

mod predicates;
mod table;


pub use predicates::*;
pub use table::{Route, RouteCompiler, RouteDefaults, RouteStore, RouteTable};

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::{InboundRequest, ProxyError};
use crate::error_fmt;

/// Configuration for a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// The ID of the route (for logging and reference)
    pub id: String,
    /// `http(s)://host[:port][/base]` or `lb://<service>`
    pub target: String,
    /// Passed to the load balancer for `lb://` targets
    #[serde(default)]
    pub selection_hint: Option<String>,
    /// Filters to apply to this route
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
    /// Priority of the route (higher means evaluated earlier)
    #[serde(default)]
    pub priority: i32,
    /// Predicates for this route, AND-combined
    #[serde(default)]
    pub predicates: Vec<PredicateConfig>,
    /// Per-route timeout overrides
    #[serde(default)]
    pub timeouts: Option<RouteTimeoutConfig>,
    /// Per-route override of the retry bound
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl RouteConfig {
    pub fn new(id: &str, target: &str) -> Self {
        Self {
            id: id.to_string(),
            target: target.to_string(),
            selection_hint: None,
            filters: Vec::new(),
            priority: 0,
            predicates: Vec::new(),
            timeouts: None,
            max_retries: None,
        }
    }

    pub fn with_predicate(mut self, type_: &str, config: serde_json::Value) -> Self {
        self.predicates.push(PredicateConfig {
            type_: type_.to_string(),
            config,
        });
        self
    }

    pub fn with_filter(mut self, type_: &str, config: serde_json::Value) -> Self {
        self.filters.push(FilterConfig::new(type_, config));
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Per-route timeouts, in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteTimeoutConfig {
    #[serde(default)]
    pub connect_ms: Option<u64>,
    #[serde(default)]
    pub response_ms: Option<u64>,
}

/// Configuration for a filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// The registered name of the filter
    #[serde(rename = "type")]
    pub type_: String,
    /// The configuration for the filter
    #[serde(default)]
    pub config: serde_json::Value,
    /// Explicit position; the chain is stably sorted on this (default 0)
    #[serde(default)]
    pub order: i32,
}

impl FilterConfig {
    pub fn new(type_: &str, config: serde_json::Value) -> Self {
        Self {
            type_: type_.to_string(),
            config,
            order: 0,
        }
    }
}

/// Configuration for a predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredicateConfig {
    /// The type of predicate
    #[serde(rename = "type")]
    pub type_: String,
    /// The configuration for the predicate
    #[serde(default)]
    pub config: serde_json::Value,
}

/// A single matching condition of a route.
pub trait Predicate: Send + Sync + std::fmt::Debug {
    /// Check if the request matches this predicate.
    fn matches(&self, request: &InboundRequest) -> bool;

    /// Get the predicate type.
    fn predicate_type(&self) -> &str;

    /// Number of literal path segments this predicate pins down.
    fn specificity(&self) -> usize {
        0
    }
}

/// Factory for creating predicates based on configuration.
#[derive(Debug)]
pub struct PredicateFactory;

impl PredicateFactory {
    /// Create a predicate based on the predicate type and configuration.
    pub fn create_predicate(
        predicate_type: &str,
        config: serde_json::Value,
    ) -> Result<Arc<dyn Predicate>, ProxyError> {
        match predicate_type {
            "path" => {
                let config: PathPredicateConfig = parse_config(predicate_type, config)?;
                Ok(Arc::new(PathPredicate::new(config)?))
            }
            "method" => {
                let config: MethodPredicateConfig = parse_config(predicate_type, config)?;
                Ok(Arc::new(MethodPredicate::new(config)))
            }
            "header" => {
                let config: HeaderPredicateConfig = parse_config(predicate_type, config)?;
                Ok(Arc::new(HeaderPredicate::new(config)))
            }
            "query" => {
                let config: QueryPredicateConfig = parse_config(predicate_type, config)?;
                Ok(Arc::new(QueryPredicate::new(config)))
            }
            "host" => {
                let config: HostPredicateConfig = parse_config(predicate_type, config)?;
                Ok(Arc::new(HostPredicate::new(config)?))
            }
            _ => {
                let err = ProxyError::Configuration(format!(
                    "unknown predicate type: {predicate_type}"
                ));
                error_fmt!("Router", "{}", err);
                Err(err)
            }
        }
    }
}

fn parse_config<T: serde::de::DeserializeOwned>(
    predicate_type: &str,
    config: serde_json::Value,
) -> Result<T, ProxyError> {
    serde_json::from_value(config).map_err(|e| {
        let err = ProxyError::Configuration(format!(
            "invalid {predicate_type} predicate config: {e}"
        ));
        error_fmt!("Router", "{}", err);
        err
    })
}
