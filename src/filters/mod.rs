// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Built-in filters & the filter registry
//!
//! Filters are **opt-in** – you must reference them in the `filters` array of
//! a route (or in `proxy.global_filters`) for them to execute.  Names are
//! resolved through a [`FilterRegistry`] when the route table is built, so a
//! typo fails the build instead of a request.
//!
//! | name            | phase | config                                                   |
//! |-----------------|-------|----------------------------------------------------------|
//! | `logging`       | both  | [`LoggingFilterConfig`]                                  |
//! | `header`        | both  | [`HeaderFilterConfig`]                                   |
//! | `path_rewrite`  | pre   | [`PathRewriteFilterConfig`]                              |
//! | `strip_prefix`  | pre   | `{ "parts": 1 }`                                         |
//! | `preserve_host` | pre   | none                                                     |
//! | `forwarded`     | pre   | [`ForwardedFilterConfig`]                                |
//! | `request_id`    | both  | `{ "header": "x-request-id" }`                           |
//! | `basic_auth`    | pre   | [`BasicAuthFilterConfig`]                                |
//! | `rate_limit`    | pre   | [`RateLimitFilterConfig`]                                |

mod auth;
mod chain;
mod forwarded;
mod rate_limit;


pub use auth::{BasicAuthFilter, BasicAuthFilterConfig};
pub use chain::FilterChain;
pub use forwarded::{ForwardedFilter, ForwardedFilterConfig};
pub use rate_limit::{RateLimitFilter, RateLimitFilterConfig};

use std::cmp;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use http_body_util::BodyExt;
use log::Level;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::{Exchange, Filter, FilterAction, FilterType, ProxyError, REQUEST_ID_HEADER};
use crate::router::FilterConfig;
use crate::{debug_fmt, error_fmt, info_fmt, trace_fmt, warn_fmt};

/// Constructor signature every filter must implement.
pub type FilterConstructor = fn(serde_json::Value) -> Result<Arc<dyn Filter>, ProxyError>;

/// Exchange attribute set by `preserve_host`.
pub const PRESERVE_HOST_ATTRIBUTE: &str = "preserve_host";

/// Name → constructor map used while compiling route tables.
///
/// Populate it **before** the gateway is built:
///
/// ```rust
/// use portcullis::{Filter, FilterType};
/// use portcullis::filters::FilterRegistry;
///
/// #[derive(Debug)]
/// struct MyFilter;
///
/// #[async_trait::async_trait]
/// impl Filter for MyFilter {
///     fn filter_type(&self) -> FilterType { FilterType::Pre }
///     fn name(&self) -> &str { "my_filter" }
/// }
///
/// let mut registry = FilterRegistry::with_builtins();
/// registry.register("my_filter", |_cfg| Ok(std::sync::Arc::new(MyFilter)));
/// assert!(registry.contains("my_filter"));
/// ```
#[derive(Debug, Clone)]
pub struct FilterRegistry {
    constructors: HashMap<String, FilterConstructor>,
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl FilterRegistry {
    /// A registry with no filters at all.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// A registry pre-populated with every built-in filter.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("logging", |cfg| {
            Ok(Arc::new(LoggingFilter::new(parse_filter_config("logging", cfg)?)))
        });
        registry.register("header", |cfg| {
            Ok(Arc::new(HeaderFilter::new(parse_filter_config("header", cfg)?)))
        });
        registry.register("path_rewrite", |cfg| {
            Ok(Arc::new(PathRewriteFilter::new(parse_filter_config(
                "path_rewrite",
                cfg,
            )?)?))
        });
        registry.register("strip_prefix", |cfg| {
            Ok(Arc::new(StripPrefixFilter::new(parse_filter_config(
                "strip_prefix",
                cfg,
            )?)?))
        });
        registry.register("preserve_host", |_| Ok(Arc::new(PreserveHostFilter)));
        registry.register("forwarded", |cfg| {
            Ok(Arc::new(ForwardedFilter::new(parse_filter_config("forwarded", cfg)?)))
        });
        registry.register("request_id", |cfg| {
            Ok(Arc::new(RequestIdFilter::new(parse_filter_config(
                "request_id",
                cfg,
            )?)?))
        });
        registry.register("basic_auth", |cfg| {
            Ok(Arc::new(BasicAuthFilter::new(parse_filter_config(
                "basic_auth",
                cfg,
            )?)?))
        });
        registry.register("rate_limit", |cfg| {
            Ok(Arc::new(RateLimitFilter::new(parse_filter_config(
                "rate_limit",
                cfg,
            )?)?))
        });
        registry
    }

    /// Register (or replace) a filter under a unique name.
    pub fn register(&mut self, name: &str, ctor: FilterConstructor) {
        self.constructors.insert(name.to_string(), ctor);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Instantiate the filter described by `config`.
    pub fn create(&self, config: &FilterConfig) -> Result<Arc<dyn Filter>, ProxyError> {
        debug_fmt!(
            "Filter",
            "Creating filter of type '{}' with config: {}",
            config.type_,
            config.config
        );

        let Some(ctor) = self.constructors.get(&config.type_) else {
            let err = ProxyError::Configuration(format!("unknown filter type: {}", config.type_));
            error_fmt!("Filter", "{}", err);
            return Err(err);
        };

        let raw = if config.config.is_null() {
            serde_json::json!({})
        } else {
            config.config.clone()
        };

        ctor(raw).map_err(|e| match e {
            ProxyError::Configuration(_) => e,
            other => ProxyError::Configuration(format!("filter '{}': {}", config.type_, other)),
        })
    }
}

fn parse_filter_config<T: DeserializeOwned>(
    name: &str,
    config: serde_json::Value,
) -> Result<T, ProxyError> {
    serde_json::from_value(config).map_err(|e| {
        let err = ProxyError::Configuration(format!("invalid {name} filter config: {e}"));
        error_fmt!("Filter", "{}", err);
        err
    })
}

fn default_true() -> bool {
    true
}

/// Configuration for a logging filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingFilterConfig {
    /// Whether to log request headers
    #[serde(default = "default_true")]
    pub log_request_headers: bool,

    /// Whether to log a prefix of the request body
    #[serde(default)]
    pub log_request_body: bool,

    /// Whether to log response headers
    #[serde(default = "default_true")]
    pub log_response_headers: bool,

    /// Whether to log a prefix of the response body
    #[serde(default)]
    pub log_response_body: bool,

    /// Log level to use
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Maximum body prefix to log (in bytes)
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

fn default_log_level() -> String {
    "trace".to_string()
}

fn default_max_body_size() -> usize {
    1024
}

impl Default for LoggingFilterConfig {
    fn default() -> Self {
        Self {
            log_request_headers: true,
            log_request_body: false,
            log_response_headers: true,
            log_response_body: false,
            log_level: default_log_level(),
            max_body_size: default_max_body_size(),
        }
    }
}

/// A filter that logs requests and responses.
#[derive(Debug)]
pub struct LoggingFilter {
    config: LoggingFilterConfig,
    level: Level,
}

impl Default for LoggingFilter {
    fn default() -> Self {
        Self::new(LoggingFilterConfig::default())
    }
}

impl LoggingFilter {
    pub fn new(config: LoggingFilterConfig) -> Self {
        let level = match config.log_level.to_lowercase().as_str() {
            "error" => Level::Error,
            "warn" => Level::Warn,
            "info" => Level::Info,
            "debug" => Level::Debug,
            _ => Level::Trace,
        };
        Self { config, level }
    }

    fn log(&self, exchange_id: &str, message: &str) {
        match self.level {
            Level::Error => error_fmt!("LoggingFilter", "[{}] {}", exchange_id, message),
            Level::Warn => warn_fmt!("LoggingFilter", "[{}] {}", exchange_id, message),
            Level::Info => info_fmt!("LoggingFilter", "[{}] {}", exchange_id, message),
            Level::Debug => debug_fmt!("LoggingFilter", "[{}] {}", exchange_id, message),
            Level::Trace => trace_fmt!("LoggingFilter", "[{}] {}", exchange_id, message),
        }
    }

    fn log_headers(&self, exchange_id: &str, marker: &str, headers: &HeaderMap) {
        for (name, value) in headers {
            if let Ok(value) = value.to_str() {
                self.log(exchange_id, &format!("{marker} {name}: {value}"));
            }
        }
    }

    fn format_body(&self, snippet: &[u8], complete: bool) -> String {
        if snippet.is_empty() {
            return "[Empty body]".to_string();
        }
        let text = String::from_utf8_lossy(snippet);
        if complete {
            text.into_owned()
        } else {
            format!("[Body truncated, showing first {} bytes]\n{}", snippet.len(), text)
        }
    }

    /// Log a bounded prefix of `body`, leaving a body that still yields
    /// every byte.
    async fn log_body(
        &self,
        exchange_id: &str,
        marker: &str,
        body: reqwest::Body,
    ) -> reqwest::Body {
        let limit = self.config.max_body_size;

        // already buffered: no need to touch the stream
        if let Some(bytes) = body.as_bytes() {
            let take = cmp::min(limit, bytes.len());
            let formatted = self.format_body(&bytes[..take], take == bytes.len());
            self.log(exchange_id, &format!("{marker} Body:\n{formatted}"));
            return body;
        }

        let (body, snippet, complete) = tee_body(body, limit).await;
        let formatted = self.format_body(&snippet, complete);
        self.log(exchange_id, &format!("{marker} Body:\n{formatted}"));
        body
    }
}

#[async_trait]
impl Filter for LoggingFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::Both
    }

    fn name(&self) -> &str {
        "logging"
    }

    async fn pre_filter(&self, exchange: &mut Exchange) -> Result<FilterAction, ProxyError> {
        if self.config.log_request_headers {
            self.log(
                &exchange.id,
                &format!(">> {} {}", exchange.outbound.method, exchange.outbound.path),
            );
            self.log_headers(&exchange.id, ">>", &exchange.outbound.headers);
        }
        if self.config.log_request_body {
            let body = std::mem::replace(&mut exchange.outbound.body, empty_body());
            exchange.outbound.body = self.log_body(&exchange.id, ">>", body).await;
        }
        Ok(FilterAction::Continue)
    }

    async fn post_filter(&self, exchange: &mut Exchange) -> Result<(), ProxyError> {
        let Some(response) = exchange.response.as_mut() else {
            return Ok(());
        };
        if self.config.log_response_headers {
            self.log(&exchange.id, &format!("<< {}", response.status));
            self.log_headers(&exchange.id, "<<", &response.headers);
        }
        if self.config.log_response_body {
            let body = std::mem::replace(&mut response.body, empty_body());
            response.body = self.log_body(&exchange.id, "<<", body).await;
        }
        Ok(())
    }
}

pub(crate) fn empty_body() -> reqwest::Body {
    reqwest::Body::from(Bytes::new())
}

/// Read up to `limit` bytes of `body` and hand back a body that replays them
/// before the rest of the stream.  Returns the captured prefix and whether
/// the body ended within it.  A read error is replayed in place, so the
/// downstream connection still sees the failure.
async fn tee_body(body: reqwest::Body, limit: usize) -> (reqwest::Body, Vec<u8>, bool) {
    let mut stream_in = body.into_data_stream();
    let mut captured = Vec::<u8>::with_capacity(limit);
    let mut chunks = Vec::new();
    let mut complete = false;

    while captured.len() < limit {
        match stream_in.next().await {
            Some(Ok(chunk)) => {
                let take = cmp::min(limit - captured.len(), chunk.len());
                captured.extend_from_slice(&chunk[..take]);
                chunks.push(Ok::<Bytes, std::io::Error>(chunk));
            }
            Some(Err(e)) => {
                chunks.push(Err(std::io::Error::other(e)));
                break;
            }
            None => {
                complete = true;
                break;
            }
        }
    }

    let combined =
        futures_util::stream::iter(chunks).chain(stream_in.map_err(std::io::Error::other));

    (reqwest::Body::wrap_stream(combined), captured, complete)
}

/// Configuration for a header modification filter.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HeaderFilterConfig {
    /// Headers to add or replace in the request
    #[serde(default)]
    pub add_request_headers: HashMap<String, String>,

    /// Headers to remove from the request
    #[serde(default)]
    pub remove_request_headers: Vec<String>,

    /// Headers to add or replace in the response
    #[serde(default)]
    pub add_response_headers: HashMap<String, String>,

    /// Headers to remove from the response
    #[serde(default)]
    pub remove_response_headers: Vec<String>,
}

/// A filter that modifies request and response headers.
#[derive(Debug)]
pub struct HeaderFilter {
    config: HeaderFilterConfig,
}

impl HeaderFilter {
    pub fn new(config: HeaderFilterConfig) -> Self {
        Self { config }
    }

    fn apply_headers(
        headers: &mut HeaderMap,
        add_headers: &HashMap<String, String>,
        remove_headers: &[String],
    ) {
        for header_name in remove_headers {
            if let Ok(name) = HeaderName::from_bytes(header_name.as_bytes()) {
                headers.remove(&name);
            }
        }

        for (name, value) in add_headers {
            if let (Ok(header_name), Ok(header_value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(header_name, header_value);
            }
        }
    }
}

#[async_trait]
impl Filter for HeaderFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::Both
    }

    fn name(&self) -> &str {
        "header"
    }

    async fn pre_filter(&self, exchange: &mut Exchange) -> Result<FilterAction, ProxyError> {
        Self::apply_headers(
            &mut exchange.outbound.headers,
            &self.config.add_request_headers,
            &self.config.remove_request_headers,
        );
        Ok(FilterAction::Continue)
    }

    async fn post_filter(&self, exchange: &mut Exchange) -> Result<(), ProxyError> {
        if let Some(response) = exchange.response.as_mut() {
            Self::apply_headers(
                &mut response.headers,
                &self.config.add_response_headers,
                &self.config.remove_response_headers,
            );
        }
        Ok(())
    }
}

/// Configuration for a path rewrite filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRewriteFilterConfig {
    /// The pattern to match (regex)
    pub pattern: String,
    /// The replacement, `$1`-style group references allowed
    pub replacement: String,
}

/// A filter that rewrites the outbound path with a regex.
#[derive(Debug)]
pub struct PathRewriteFilter {
    config: PathRewriteFilterConfig,
    regex: Regex,
}

impl PathRewriteFilter {
    pub fn new(config: PathRewriteFilterConfig) -> Result<Self, ProxyError> {
        let regex = Regex::new(&config.pattern).map_err(|e| {
            let err = ProxyError::Configuration(format!(
                "invalid regex pattern '{}': {}",
                config.pattern, e
            ));
            error_fmt!("PathRewriteFilter", "{}", err);
            err
        })?;

        Ok(Self { config, regex })
    }
}

#[async_trait]
impl Filter for PathRewriteFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::Pre
    }

    fn name(&self) -> &str {
        "path_rewrite"
    }

    async fn pre_filter(&self, exchange: &mut Exchange) -> Result<FilterAction, ProxyError> {
        let rewritten = self
            .regex
            .replace_all(&exchange.outbound.path, self.config.replacement.as_str())
            .into_owned();

        if rewritten != exchange.outbound.path {
            debug_fmt!(
                "PathRewriteFilter",
                "Rewriting path from {} to {}",
                exchange.outbound.path,
                rewritten
            );
            exchange.outbound.path = if rewritten.starts_with('/') {
                rewritten
            } else {
                format!("/{rewritten}")
            };
        }

        Ok(FilterAction::Continue)
    }
}

/// Configuration for a strip prefix filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripPrefixFilterConfig {
    /// Number of leading path segments to drop
    pub parts: usize,
}

/// Drops the first `parts` segments of the outbound path.
#[derive(Debug)]
pub struct StripPrefixFilter {
    parts: usize,
}

impl StripPrefixFilter {
    pub fn new(config: StripPrefixFilterConfig) -> Result<Self, ProxyError> {
        if config.parts == 0 {
            return Err(ProxyError::Configuration(
                "strip_prefix needs parts >= 1".into(),
            ));
        }
        Ok(Self {
            parts: config.parts,
        })
    }

    fn strip(&self, path: &str) -> String {
        let trailing_slash = path.len() > 1 && path.ends_with('/');
        let remaining: Vec<&str> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .skip(self.parts)
            .collect();

        if remaining.is_empty() {
            return "/".to_string();
        }
        let mut stripped = format!("/{}", remaining.join("/"));
        if trailing_slash {
            stripped.push('/');
        }
        stripped
    }
}

#[async_trait]
impl Filter for StripPrefixFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::Pre
    }

    fn name(&self) -> &str {
        "strip_prefix"
    }

    async fn pre_filter(&self, exchange: &mut Exchange) -> Result<FilterAction, ProxyError> {
        exchange.outbound.path = self.strip(&exchange.outbound.path);
        Ok(FilterAction::Continue)
    }
}

/// Forwards the caller's Host header instead of the upstream authority.
#[derive(Debug)]
pub struct PreserveHostFilter;

#[async_trait]
impl Filter for PreserveHostFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::Pre
    }

    fn name(&self) -> &str {
        "preserve_host"
    }

    async fn pre_filter(&self, exchange: &mut Exchange) -> Result<FilterAction, ProxyError> {
        exchange.set_attribute(PRESERVE_HOST_ATTRIBUTE, true);
        Ok(FilterAction::Continue)
    }
}

/// Configuration for the request id filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestIdFilterConfig {
    #[serde(default = "default_request_id_header")]
    pub header: String,
}

fn default_request_id_header() -> String {
    REQUEST_ID_HEADER.to_string()
}

/// Puts the exchange id on the outbound request and echoes it back.
#[derive(Debug)]
pub struct RequestIdFilter {
    header: HeaderName,
}

impl RequestIdFilter {
    pub fn new(config: RequestIdFilterConfig) -> Result<Self, ProxyError> {
        let header = HeaderName::from_bytes(config.header.as_bytes()).map_err(|e| {
            ProxyError::Configuration(format!("invalid header name '{}': {}", config.header, e))
        })?;
        Ok(Self { header })
    }
}

#[async_trait]
impl Filter for RequestIdFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::Both
    }

    fn name(&self) -> &str {
        "request_id"
    }

    async fn pre_filter(&self, exchange: &mut Exchange) -> Result<FilterAction, ProxyError> {
        if !exchange.outbound.headers.contains_key(&self.header) {
            let value = HeaderValue::from_str(&exchange.id)
                .map_err(|e| ProxyError::Filter(format!("unusable request id: {e}")))?;
            exchange.outbound.headers.insert(self.header.clone(), value);
        }
        Ok(FilterAction::Continue)
    }

    async fn post_filter(&self, exchange: &mut Exchange) -> Result<(), ProxyError> {
        let value = exchange
            .outbound
            .headers
            .get(&self.header)
            .cloned()
            .or_else(|| HeaderValue::from_str(&exchange.id).ok());
        if let (Some(response), Some(value)) = (exchange.response.as_mut(), value) {
            response.headers.insert(self.header.clone(), value);
        }
        Ok(())
    }
}
