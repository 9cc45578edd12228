// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Core primitives – exchanges, errors, the filter contract & the pipeline.
//!
//! Everything that physically moves through the gateway is defined in this
//! module.  No socket handling lives here; that sits in `server` (inbound IO)
//! and `upstream` (outbound IO).  [`ProxyCore`] is the glue that runs
//! *Matcher → Filter Chain → Dispatcher* for one [`Exchange`] and turns every
//! possible outcome into exactly one [`ProxyResponse`].

mod exchange;

#[cfg(test)]
mod tests;

pub use exchange::{Exchange, InboundRequest, ProxyRequest, ProxyResponse, REQUEST_ID_HEADER};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::timeout;

use crate::logging::access::{AccessRecord, AccessSink};
use crate::router::RouteStore;
use crate::{debug_fmt, error_fmt, warn_fmt};

/// Errors that can occur while building or running the gateway.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Invalid route, predicate, filter or target definition.
    ///
    /// Only ever produced at startup or reload.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A filter aborted the chain.
    #[error("filter error: {0}")]
    Filter(String),

    /// The upstream call failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The global request timeout elapsed.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<crate::config::ConfigError> for ProxyError {
    fn from(err: crate::config::ConfigError) -> Self {
        ProxyError::Configuration(err.to_string())
    }
}

impl ProxyError {
    /// Status code the gateway answers with when this error ends a request.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::Dispatch(e) => e.kind.status_code(),
            ProxyError::Timeout(_) => 504,
            _ => 500,
        }
    }

    /// Short machine-readable label used in error bodies and access records.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Configuration(_) => "configuration",
            ProxyError::Filter(_) => "filter",
            ProxyError::Dispatch(e) => e.kind.as_str(),
            ProxyError::Timeout(_) => "timeout",
            ProxyError::Io(_) | ProxyError::Other(_) => "internal",
        }
    }
}

/// Classification of upstream failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchErrorKind {
    /// Connect or response timeout elapsed.
    Timeout,
    /// Connection refused, reset or aborted before a response arrived.
    Unreachable,
    /// A logical service had no instance to send to.
    NoInstance,
    /// Anything else the upstream exchange produced (malformed response,
    /// invalid URL, client construction failure ...).
    UpstreamProtocolError,
}

impl DispatchErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchErrorKind::Timeout => "timeout",
            DispatchErrorKind::Unreachable => "unreachable",
            DispatchErrorKind::NoInstance => "no_instance",
            DispatchErrorKind::UpstreamProtocolError => "upstream_protocol",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            DispatchErrorKind::Timeout => 504,
            DispatchErrorKind::Unreachable => 502,
            DispatchErrorKind::NoInstance => 503,
            DispatchErrorKind::UpstreamProtocolError => 502,
        }
    }

    /// Only connection-level failures are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchErrorKind::Unreachable)
    }
}

impl fmt::Display for DispatchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of the terminal dispatch step.
#[derive(Error, Debug)]
#[error("{kind} after {attempts} attempt(s): {message}")]
pub struct DispatchError {
    pub kind: DispatchErrorKind,
    pub message: String,
    pub attempts: u32,
}

impl DispatchError {
    pub fn new(kind: DispatchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            attempts: 0,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// HTTP methods supported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Trace,
    Connect,
}

impl HttpMethod {
    /// Map a wire method onto the supported set; extension methods yield `None`.
    pub fn from_method(method: &reqwest::Method) -> Option<Self> {
        match *method {
            reqwest::Method::GET => Some(HttpMethod::Get),
            reqwest::Method::POST => Some(HttpMethod::Post),
            reqwest::Method::PUT => Some(HttpMethod::Put),
            reqwest::Method::DELETE => Some(HttpMethod::Delete),
            reqwest::Method::HEAD => Some(HttpMethod::Head),
            reqwest::Method::OPTIONS => Some(HttpMethod::Options),
            reqwest::Method::PATCH => Some(HttpMethod::Patch),
            reqwest::Method::TRACE => Some(HttpMethod::Trace),
            reqwest::Method::CONNECT => Some(HttpMethod::Connect),
            _ => None,
        }
    }

    /// RFC 9110 §9.2.2 idempotent methods.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            HttpMethod::Get
                | HttpMethod::Head
                | HttpMethod::Options
                | HttpMethod::Trace
                | HttpMethod::Put
                | HttpMethod::Delete
        )
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Trace => "TRACE",
            HttpMethod::Connect => "CONNECT",
        };
        f.write_str(name)
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Options => reqwest::Method::OPTIONS,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Trace => reqwest::Method::TRACE,
            HttpMethod::Connect => reqwest::Method::CONNECT,
        }
    }
}

/// Describes in which phase(s) a filter participates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    /// Runs before the upstream call
    Pre,
    /// Runs after the upstream call, in reverse chain order
    Post,
    /// Wraps the upstream call
    Both,
}

impl FilterType {
    pub fn is_pre(&self) -> bool {
        matches!(self, FilterType::Pre | FilterType::Both)
    }

    pub fn is_post(&self) -> bool {
        matches!(self, FilterType::Post | FilterType::Both)
    }
}

/// What a pre-filter wants the chain to do next.
#[derive(Debug)]
pub enum FilterAction {
    /// Hand control to the next link.
    Continue,
    /// Answer the caller directly; nothing downstream runs.
    Respond(ProxyResponse),
}

/// A unit of request/response transformation or short-circuit logic.
///
/// Filters are built once per route-table generation and shared by every
/// request hitting that route, so any state they keep must be synchronized.
#[async_trait]
pub trait Filter: fmt::Debug + Send + Sync {
    /// Get the filter type.
    fn filter_type(&self) -> FilterType;

    /// Get the filter name.
    fn name(&self) -> &str;

    /// Inspect or mutate the exchange before dispatch.
    async fn pre_filter(&self, _exchange: &mut Exchange) -> Result<FilterAction, ProxyError> {
        Ok(FilterAction::Continue)
    }

    /// Inspect or mutate the response draft after dispatch.
    async fn post_filter(&self, _exchange: &mut Exchange) -> Result<(), ProxyError> {
        Ok(())
    }
}

/// The terminal step of a filter chain.
#[async_trait]
pub trait Dispatch: fmt::Debug + Send + Sync {
    /// Forward the outbound draft and store the upstream response in
    /// `exchange.response`.
    async fn dispatch(&self, exchange: &mut Exchange) -> Result<(), DispatchError>;
}

/// Runs one exchange through the gateway pipeline.
#[derive(Debug)]
pub struct ProxyCore {
    routes: Arc<RouteStore>,
    dispatcher: Arc<dyn Dispatch>,
    access_sink: Arc<dyn AccessSink>,
    request_timeout: Duration,
}

impl ProxyCore {
    pub fn new(
        routes: Arc<RouteStore>,
        dispatcher: Arc<dyn Dispatch>,
        access_sink: Arc<dyn AccessSink>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            routes,
            dispatcher,
            access_sink,
            request_timeout,
        }
    }

    /// The route store backing this core.
    pub fn routes(&self) -> &Arc<RouteStore> {
        &self.routes
    }

    /// Process a request and produce the single response for it.
    ///
    /// Never fails: no-match, filter aborts, dispatch failures and the global
    /// timeout are all mapped onto error responses here.
    pub async fn handle(&self, mut exchange: Exchange) -> ProxyResponse {
        let result = match timeout(self.request_timeout, self.run(&mut exchange)).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::Timeout(self.request_timeout)),
        };

        let response = match result {
            Ok(Some(response)) => response,
            Ok(None) => {
                debug_fmt!(
                    "ProxyCore",
                    "No route matched {} {}",
                    exchange.inbound.method,
                    exchange.inbound.path
                );
                exchange.failure = Some("no_match");
                error_response(
                    &exchange,
                    404,
                    "no_match",
                    &format!(
                        "no route matches {} {}",
                        exchange.inbound.method, exchange.inbound.path
                    ),
                )
            }
            Err(err) => {
                let status = err.status_code();
                if status >= 500 && !matches!(err, ProxyError::Dispatch(_) | ProxyError::Timeout(_)) {
                    error_fmt!(
                        "ProxyCore",
                        "Request {} {} failed: {}",
                        exchange.inbound.method,
                        exchange.inbound.path,
                        err
                    );
                } else {
                    warn_fmt!(
                        "ProxyCore",
                        "Request {} {} failed: {}",
                        exchange.inbound.method,
                        exchange.inbound.path,
                        err
                    );
                }
                exchange.failure.get_or_insert(err.kind());
                error_response(&exchange, status, err.kind(), &err.to_string())
            }
        };

        self.access_sink
            .record(&AccessRecord::from_exchange(&exchange, response.status));
        response
    }

    async fn run(&self, exchange: &mut Exchange) -> Result<Option<ProxyResponse>, ProxyError> {
        let snapshot = self.routes.snapshot();
        let Some(route) = snapshot.find(&exchange.inbound) else {
            return Ok(None);
        };
        exchange.route = Some(route.clone());

        route.chain().execute(exchange, self.dispatcher.as_ref()).await?;

        exchange
            .response
            .take()
            .map(Some)
            .ok_or_else(|| ProxyError::Other("pipeline completed without a response".into()))
    }
}

/// Build the structured error body the gateway answers with.
fn error_response(exchange: &Exchange, status: u16, kind: &str, message: &str) -> ProxyResponse {
    let body = serde_json::json!({
        "error": {
            "status": status,
            "kind": kind,
            "message": message,
            "request_id": exchange.id,
        }
    });
    let mut response = ProxyResponse::json(status, &body);
    if let Ok(value) = reqwest::header::HeaderValue::from_str(&exchange.id) {
        response.headers.insert(REQUEST_ID_HEADER, value);
    }
    response
}
