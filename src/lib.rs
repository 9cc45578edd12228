// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Portcullis - a configuration-driven HTTP API gateway library
//!
//! Every inbound request is matched against an ordered route table, run
//! through the route's filter chain and forwarded to an upstream, with the
//! upstream response streamed back through the same chain in reverse.
//!
//! # Core Principles
//!
//! - **Routing**: predicates (path, method, header, query, host) are
//!   AND-combined; the highest-priority, most specific route wins
//! - **Filters**: pre/post hooks that may rewrite the request, decorate the
//!   response or answer on their own (auth, rate limits)
//! - **Upstreams**: fixed URLs or `lb://` services resolved per attempt,
//!   with bounded retries for idempotent requests
//! - **Reload**: route tables are immutable and swapped atomically
//!
//! # Configuration System
//!
//! - **Multiple Configuration Sources**: files (JSON, TOML, YAML) and
//!   environment variables.
//! - **Layered Configuration**: later providers override earlier ones.
//! - **Extensibility**: implement [`ConfigProvider`] for custom sources.
//!
//! # Custom Filters
//!
//! Implement [`Filter`] and register a constructor with the loader:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use portcullis::{Exchange, Filter, FilterAction, FilterType, GatewayLoader, ProxyError};
//!
//! #[derive(Debug)]
//! struct TenantHeader;
//!
//! #[async_trait]
//! impl Filter for TenantHeader {
//!     fn filter_type(&self) -> FilterType {
//!         FilterType::Pre
//!     }
//!
//!     fn name(&self) -> &str {
//!         "tenant_header"
//!     }
//!
//!     async fn pre_filter(&self, exchange: &mut Exchange) -> Result<FilterAction, ProxyError> {
//!         exchange
//!             .outbound
//!             .headers
//!             .insert("x-tenant", "acme".parse().unwrap());
//!         Ok(FilterAction::Continue)
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let gateway = GatewayLoader::new()
//!     .with_config_file("portcullis.toml")
//!     .with_filter("tenant_header", |_| Ok(Arc::new(TenantHeader)))
//!     .build()?;
//! gateway.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod filters;
pub mod loader;
pub mod logging;
pub mod router;
pub mod server;
pub mod upstream;

// Re-export key types at the crate root for convenience
pub use config::{Config, ConfigError, ConfigProvider, ConfigProviderExt};
pub use core::{
    Dispatch, DispatchError, DispatchErrorKind, Exchange, Filter, FilterAction, FilterType,
    HttpMethod, InboundRequest, ProxyCore, ProxyError, ProxyRequest, ProxyResponse,
};
pub use filters::{FilterChain, FilterRegistry};
pub use loader::{Gateway, GatewayLoader, LoaderError};
pub use logging::access::{AccessRecord, AccessSink};
pub use router::{Predicate, PredicateFactory, Route, RouteConfig, RouteStore, RouteTable};
pub use server::ProxyServer;
pub use upstream::{Dispatcher, LoadBalancer, ServiceRegistry, TargetSpec};
