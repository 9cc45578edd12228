// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-request context threaded through the pipeline.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, HOST, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

use crate::core::HttpMethod;
use crate::logging::structured::generate_request_id;
use crate::router::Route;

/// Header carrying the correlation id of an exchange.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Read-only view of the request as it arrived at the gateway.
///
/// The body is not part of this snapshot; it is moved straight into the
/// outbound draft so it can be streamed upstream.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    /// Authority from the request target (HTTP/2 `:authority`, absolute-form URIs).
    pub authority: Option<String>,
    pub version: reqwest::Version,
}

impl InboundRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            authority: None,
            version: reqwest::Version::HTTP_11,
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Add a header; invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    /// Host the caller addressed, without port.
    pub fn host(&self) -> Option<&str> {
        let raw = self
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .or(self.authority.as_deref())?;
        Some(strip_port(raw))
    }
}

fn strip_port(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        // IPv6 literal
        return rest.split(']').next().unwrap_or(rest);
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => authority,
    }
}

/// Mutable draft of the request that will be sent upstream.
#[derive(Debug)]
pub struct ProxyRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: reqwest::Body,
}

/// Mutable draft of the response that will be written to the caller.
#[derive(Debug)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: reqwest::Body,
}

impl ProxyResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: reqwest::Body::from(Bytes::new()),
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        let mut response = Self::new(status);
        response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        response.body = reqwest::Body::from(body.into());
        response
    }

    pub fn json(status: u16, body: &Value) -> Self {
        let mut response = Self::new(status);
        response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response.body = reqwest::Body::from(body.to_string());
        response
    }
}

/// Per-request context.
///
/// Created when the request enters the gateway and owned by the task
/// handling it.  Filters receive it by `&mut` and cannot keep it.
#[derive(Debug)]
pub struct Exchange {
    /// Correlation id, also used for the `x-request-id` header.
    pub id: String,
    pub client_addr: Option<SocketAddr>,
    pub started_at: Instant,
    pub inbound: InboundRequest,
    /// Route selected by the matcher.
    pub route: Option<Arc<Route>>,
    pub outbound: ProxyRequest,
    pub response: Option<ProxyResponse>,
    /// Last upstream the dispatcher talked to.
    pub upstream: Option<String>,
    /// Kind of the failure that ended the exchange, if any.
    pub failure: Option<&'static str>,
    /// Free-form values filters use to talk to each other.
    pub attributes: HashMap<String, Value>,
}

impl Exchange {
    /// Create an exchange whose outbound draft mirrors the inbound request.
    pub fn new(inbound: InboundRequest, body: reqwest::Body) -> Self {
        let outbound = ProxyRequest {
            method: inbound.method,
            path: inbound.path.clone(),
            query: inbound.query.clone(),
            headers: inbound.headers.clone(),
            body,
        };

        let id = inbound
            .headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(generate_request_id);

        Self {
            id,
            client_addr: None,
            started_at: Instant::now(),
            inbound,
            route: None,
            outbound,
            response: None,
            upstream: None,
            failure: None,
            attributes: HashMap::new(),
        }
    }

    pub fn with_client_addr(mut self, addr: SocketAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    pub fn route_id(&self) -> Option<&str> {
        self.route.as_ref().map(|r| r.id.as_str())
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(key.into(), value.into());
    }
}
