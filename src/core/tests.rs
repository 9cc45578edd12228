// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::*;
use crate::filters::FilterRegistry;
use crate::logging::access::MemoryAccessSink;
use crate::router::{RouteCompiler, RouteConfig, RouteDefaults, RouteStore};

#[derive(Debug)]
enum Scripted {
    Respond(u16),
    Fail(DispatchErrorKind),
    Hang,
}

#[derive(Debug)]
struct ScriptedDispatch {
    script: Scripted,
    calls: AtomicUsize,
}

impl ScriptedDispatch {
    fn new(script: Scripted) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Dispatch for ScriptedDispatch {
    async fn dispatch(&self, exchange: &mut Exchange) -> Result<(), DispatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        exchange.upstream = Some("http://upstream.test".to_string());
        match &self.script {
            Scripted::Respond(status) => {
                exchange.response = Some(ProxyResponse::text(*status, "upstream says hi"));
                Ok(())
            }
            Scripted::Fail(kind) => Err(DispatchError::new(*kind, "scripted failure").with_attempts(1)),
            Scripted::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        }
    }
}

#[derive(Debug)]
struct FailingFilter;

#[async_trait]
impl Filter for FailingFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::Pre
    }

    fn name(&self) -> &str {
        "failing"
    }

    async fn pre_filter(&self, _exchange: &mut Exchange) -> Result<FilterAction, ProxyError> {
        Err(ProxyError::Other("boom".into()))
    }
}

fn build_core(
    routes: &[RouteConfig],
    dispatcher: Arc<dyn Dispatch>,
    request_timeout: Duration,
) -> (ProxyCore, Arc<MemoryAccessSink>) {
    let mut registry = FilterRegistry::with_builtins();
    registry.register("failing", |_| Ok(Arc::new(FailingFilter)));
    let compiler = RouteCompiler::new(Arc::new(registry), Vec::new(), RouteDefaults::default());
    let store = Arc::new(RouteStore::new(routes, compiler).unwrap());
    let sink = Arc::new(MemoryAccessSink::new());
    (
        ProxyCore::new(store, dispatcher, sink.clone(), request_timeout),
        sink,
    )
}

fn orders_route() -> RouteConfig {
    RouteConfig::new("orders", "http://orders.test")
        .with_predicate("path", json!({ "pattern": "/orders/*" }))
}

fn get(path: &str) -> Exchange {
    Exchange::new(
        InboundRequest::new(HttpMethod::Get, path),
        reqwest::Body::from(""),
    )
}

fn body_json(response: &ProxyResponse) -> Value {
    serde_json::from_slice(response.body.as_bytes().unwrap()).unwrap()
}

#[test]
fn test_http_method_from() {
    assert_eq!(HttpMethod::from_method(&reqwest::Method::GET), Some(HttpMethod::Get));
    assert_eq!(HttpMethod::from_method(&reqwest::Method::POST), Some(HttpMethod::Post));
    assert_eq!(HttpMethod::from_method(&reqwest::Method::PATCH), Some(HttpMethod::Patch));
    assert_eq!(
        HttpMethod::from_method(&reqwest::Method::CONNECT),
        Some(HttpMethod::Connect)
    );
    let purge = reqwest::Method::from_bytes(b"PURGE").unwrap();
    assert_eq!(HttpMethod::from_method(&purge), None);
}

#[test]
fn test_http_method_to_string() {
    assert_eq!(HttpMethod::Get.to_string(), "GET");
    assert_eq!(HttpMethod::Delete.to_string(), "DELETE");
    assert_eq!(HttpMethod::Options.to_string(), "OPTIONS");
    assert_eq!(reqwest::Method::from(HttpMethod::Put), reqwest::Method::PUT);
}

#[test]
fn test_idempotent_methods() {
    assert!(HttpMethod::Get.is_idempotent());
    assert!(HttpMethod::Put.is_idempotent());
    assert!(HttpMethod::Delete.is_idempotent());
    assert!(!HttpMethod::Post.is_idempotent());
    assert!(!HttpMethod::Patch.is_idempotent());
}

#[test]
fn test_dispatch_error_kinds() {
    assert_eq!(DispatchErrorKind::Timeout.status_code(), 504);
    assert_eq!(DispatchErrorKind::Unreachable.status_code(), 502);
    assert_eq!(DispatchErrorKind::NoInstance.status_code(), 503);
    assert_eq!(DispatchErrorKind::UpstreamProtocolError.status_code(), 502);

    assert!(DispatchErrorKind::Unreachable.is_retryable());
    assert!(!DispatchErrorKind::Timeout.is_retryable());
    assert!(!DispatchErrorKind::NoInstance.is_retryable());

    let err = DispatchError::new(DispatchErrorKind::Unreachable, "refused").with_attempts(2);
    assert_eq!(err.to_string(), "unreachable after 2 attempt(s): refused");

    let proxy_err: ProxyError = err.into();
    assert_eq!(proxy_err.status_code(), 502);
    assert_eq!(proxy_err.kind(), "unreachable");
    assert_eq!(ProxyError::Timeout(Duration::from_secs(1)).status_code(), 504);
    assert_eq!(ProxyError::Filter("x".into()).status_code(), 500);
}

#[test]
fn test_filter_type_phases() {
    assert!(FilterType::Pre.is_pre() && !FilterType::Pre.is_post());
    assert!(!FilterType::Post.is_pre() && FilterType::Post.is_post());
    assert!(FilterType::Both.is_pre() && FilterType::Both.is_post());
}

#[test]
fn test_exchange_takes_incoming_request_id() {
    let inbound = InboundRequest::new(HttpMethod::Get, "/").with_header(REQUEST_ID_HEADER, "abc-123");
    let exchange = Exchange::new(inbound, reqwest::Body::from(""));
    assert_eq!(exchange.id, "abc-123");

    let generated = get("/");
    assert!(!generated.id.is_empty());
    assert_ne!(generated.id, get("/").id);
}

#[test]
fn test_inbound_host_strips_port() {
    let request = InboundRequest::new(HttpMethod::Get, "/").with_header("host", "api.example.com:8443");
    assert_eq!(request.host(), Some("api.example.com"));

    let mut v6 = InboundRequest::new(HttpMethod::Get, "/");
    v6.authority = Some("[::1]:8080".to_string());
    assert_eq!(v6.host(), Some("::1"));

    assert_eq!(InboundRequest::new(HttpMethod::Get, "/").host(), None);
}

#[tokio::test]
async fn test_successful_exchange() {
    let dispatcher = ScriptedDispatch::new(Scripted::Respond(200));
    let (core, sink) = build_core(&[orders_route()], dispatcher.clone(), Duration::from_secs(5));

    let response = core.handle(get("/orders/42")).await;
    assert_eq!(response.status, 200);
    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].route.as_deref(), Some("orders"));
    assert_eq!(records[0].status, 200);
    assert_eq!(records[0].upstream.as_deref(), Some("http://upstream.test"));
    assert!(records[0].error_kind.is_none());
}

#[tokio::test]
async fn test_no_match_is_404() {
    let dispatcher = ScriptedDispatch::new(Scripted::Respond(200));
    let (core, sink) = build_core(&[orders_route()], dispatcher.clone(), Duration::from_secs(5));

    let exchange = get("/users/1");
    let id = exchange.id.clone();
    let response = core.handle(exchange).await;

    assert_eq!(response.status, 404);
    assert_eq!(
        response.headers.get(REQUEST_ID_HEADER).unwrap().to_str().unwrap(),
        id
    );
    let body = body_json(&response);
    assert_eq!(body["error"]["kind"], "no_match");
    assert_eq!(body["error"]["request_id"], json!(id));
    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].route, None);
    assert_eq!(records[0].error_kind.as_deref(), Some("no_match"));
}

#[tokio::test]
async fn test_filter_error_is_500() {
    let dispatcher = ScriptedDispatch::new(Scripted::Respond(200));
    let route = orders_route().with_filter("failing", json!({}));
    let (core, sink) = build_core(&[route], dispatcher.clone(), Duration::from_secs(5));

    let response = core.handle(get("/orders/1")).await;
    assert_eq!(response.status, 500);
    assert_eq!(body_json(&response)["error"]["kind"], "filter");
    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);
    assert_eq!(sink.records()[0].error_kind.as_deref(), Some("filter"));
}

#[tokio::test]
async fn test_dispatch_failures_map_to_status() {
    let cases = [
        (DispatchErrorKind::Unreachable, 502, "unreachable"),
        (DispatchErrorKind::NoInstance, 503, "no_instance"),
        (DispatchErrorKind::Timeout, 504, "timeout"),
        (DispatchErrorKind::UpstreamProtocolError, 502, "upstream_protocol"),
    ];

    for (kind, status, label) in cases {
        let dispatcher = ScriptedDispatch::new(Scripted::Fail(kind));
        let (core, sink) = build_core(&[orders_route()], dispatcher, Duration::from_secs(5));

        let response = core.handle(get("/orders/1")).await;
        assert_eq!(response.status, status, "{label}");
        assert_eq!(body_json(&response)["error"]["kind"], label);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].error_kind.as_deref(), Some(label));
        assert_eq!(records[0].route.as_deref(), Some("orders"));
    }
}

#[tokio::test]
async fn test_global_timeout_is_504() {
    let dispatcher = ScriptedDispatch::new(Scripted::Hang);
    let (core, sink) = build_core(&[orders_route()], dispatcher, Duration::from_millis(50));

    let started = std::time::Instant::now();
    let response = core.handle(get("/orders/1")).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(response.status, 504);
    assert_eq!(body_json(&response)["error"]["kind"], "timeout");
    assert_eq!(sink.records()[0].error_kind.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn test_one_record_per_request() {
    let dispatcher = ScriptedDispatch::new(Scripted::Respond(204));
    let (core, sink) = build_core(&[orders_route()], dispatcher, Duration::from_secs(5));

    for path in ["/orders/1", "/nope", "/orders/2"] {
        core.handle(get(path)).await;
    }

    let statuses: Vec<u16> = sink.records().iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![204, 404, 204]);
}
