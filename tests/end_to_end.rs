// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end tests: real listener, real upstreams.

use std::time::{Duration, Instant};

use base64::{Engine as _, engine::general_purpose};
use serde_json::{Value, json};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod common;
use common::{TestGateway, closed_port_url, config_from};

fn base_config(routes: Value, upstreams: Value) -> Value {
    json!({
        "server": { "host": "127.0.0.1", "port": 0 },
        "proxy": { "retry": { "max_retries": 0 } },
        "routes": routes,
        "upstreams": upstreams
    })
}

#[tokio::test]
async fn test_request_reaches_service_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orders/42"))
        .and(query_param("expand", "items"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/json")
                .set_body_json(json!({ "id": 42 })),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let gateway = TestGateway::start(base_config(
        json!([{
            "id": "orders",
            "target": "lb://order-svc",
            "predicates": [{ "type": "path", "config": { "pattern": "/orders/*" } }]
        }]),
        json!({ "order-svc": [upstream.uri()] }),
    ))
    .await;

    let response = reqwest::get(gateway.url("/orders/42?expand=items")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["id"], 42);

    let records = gateway.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].route.as_deref(), Some("orders"));
    assert_eq!(records[0].status, 200);
    assert_eq!(records[0].upstream.as_deref(), Some(upstream.uri().as_str()));

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_filters_rewrite_request_and_response() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/users/7"))
        .and(header("x-gateway", "portcullis"))
        .respond_with(ResponseTemplate::new(200).set_body_string("user 7"))
        .expect(1)
        .mount(&upstream)
        .await;

    let gateway = TestGateway::start(base_config(
        json!([{
            "id": "users",
            "target": format!("{}/v1", upstream.uri()),
            "predicates": [{ "type": "path", "config": { "pattern": "/api/users/*" } }],
            "filters": [
                { "type": "strip_prefix", "config": { "parts": 1 } },
                { "type": "header", "config": {
                    "add_request_headers": { "x-gateway": "portcullis" },
                    "add_response_headers": { "x-served-by": "portcullis" }
                } },
                { "type": "request_id" }
            ]
        }]),
        json!({}),
    ))
    .await;

    let response = reqwest::Client::new()
        .get(gateway.url("/api/users/7"))
        .header("x-request-id", "trace-me")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers().get("x-served-by").unwrap(), "portcullis");
    assert_eq!(response.headers().get("x-request-id").unwrap(), "trace-me");
    assert_eq!(response.text().await.unwrap(), "user 7");

    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received[0].headers.get("x-request-id").unwrap(), "trace-me");

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_unmatched_request_is_404() {
    let gateway = TestGateway::start(base_config(json!([]), json!({}))).await;

    let response = reqwest::get(gateway.url("/nothing/here")).await.unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "no_match");

    assert_eq!(gateway.sink.records()[0].error_kind.as_deref(), Some("no_match"));
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_basic_auth_short_circuits() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("secret"))
        .expect(1)
        .mount(&upstream)
        .await;

    let gateway = TestGateway::start(base_config(
        json!([{
            "id": "admin",
            "target": upstream.uri(),
            "filters": [{ "type": "basic_auth", "config": { "credentials": ["admin:hunter2"] } }]
        }]),
        json!({}),
    ))
    .await;
    let client = reqwest::Client::new();

    let denied = client.get(gateway.url("/admin")).send().await.unwrap();
    assert_eq!(denied.status(), 401);
    assert!(denied.headers().contains_key("www-authenticate"));

    let token = general_purpose::STANDARD.encode("admin:hunter2");
    let allowed = client
        .get(gateway.url("/admin"))
        .header("authorization", format!("Basic {token}"))
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 200);

    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert!(received[0].headers.get("authorization").is_none());

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_slow_upstream_times_out_with_504() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&upstream)
        .await;

    let gateway = TestGateway::start(base_config(
        json!([{
            "id": "slow",
            "target": upstream.uri(),
            "timeouts": { "response_ms": 200 }
        }]),
        json!({}),
    ))
    .await;

    let started = Instant::now();
    let response = reqwest::get(gateway.url("/slow")).await.unwrap();
    assert_eq!(response.status(), 504);
    assert!(started.elapsed() < Duration::from_secs(2));

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "timeout");

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_request_timeout_bounds_the_whole_exchange() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&upstream)
        .await;

    let mut config = base_config(
        json!([{ "id": "slow", "target": upstream.uri() }]),
        json!({}),
    );
    config["proxy"]["request_timeout_ms"] = json!(300);
    let gateway = TestGateway::start(config).await;

    let started = Instant::now();
    let response = reqwest::get(gateway.url("/slow")).await.unwrap();
    assert_eq!(response.status(), 504);
    assert!(started.elapsed() < Duration::from_secs(2));

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_upstream_is_502() {
    let gateway = TestGateway::start(base_config(
        json!([{ "id": "down", "target": closed_port_url() }]),
        json!({}),
    ))
    .await;

    let response = reqwest::get(gateway.url("/anything")).await.unwrap();
    assert_eq!(response.status(), 502);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "unreachable");

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_empty_service_is_503() {
    let gateway = TestGateway::start(base_config(
        json!([{ "id": "svc", "target": "lb://nobody" }]),
        json!({ "nobody": [] }),
    ))
    .await;

    let response = reqwest::get(gateway.url("/x")).await.unwrap();
    assert_eq!(response.status(), 503);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_request_body_is_forwarded() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&upstream)
        .await;

    let gateway = TestGateway::start(base_config(
        json!([{ "id": "upload", "target": upstream.uri() }]),
        json!({}),
    ))
    .await;

    let payload = "x".repeat(256 * 1024);
    let response = reqwest::Client::new()
        .post(gateway.url("/upload"))
        .body(payload.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received[0].body.len(), payload.len());

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_reload_swaps_routes_and_keeps_old_table_on_error() {
    let first = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("first"))
        .mount(&first)
        .await;
    let second = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("second"))
        .mount(&second)
        .await;

    let route = |id: &str| {
        json!([{
            "id": id,
            "target": "lb://svc",
            "predicates": [{ "type": "path", "config": { "pattern": "/svc/*" } }]
        }])
    };

    let gateway = TestGateway::start(base_config(route("svc"), json!({ "svc": [first.uri()] }))).await;
    let fetch = |url: String| async move { reqwest::get(url).await.unwrap().text().await.unwrap() };

    assert_eq!(fetch(gateway.url("/svc/a")).await, "first");

    let (next, _file) = config_from(&base_config(route("svc-v2"), json!({ "svc": [second.uri()] })));
    assert_eq!(gateway.gateway.reload(&next).unwrap(), 2);
    assert_eq!(fetch(gateway.url("/svc/a")).await, "second");
    assert_eq!(gateway.sink.records().last().unwrap().route.as_deref(), Some("svc-v2"));

    let (broken, _file) = config_from(&base_config(
        json!([{ "id": "bad", "target": "lb://svc", "filters": [{ "type": "missing" }] }]),
        json!({ "svc": [first.uri()] }),
    ));
    assert!(gateway.gateway.reload(&broken).is_err());

    // neither routes nor upstreams changed
    assert_eq!(gateway.gateway.routes().snapshot().generation(), 2);
    assert_eq!(fetch(gateway.url("/svc/a")).await, "second");

    gateway.shutdown().await;
}

/// Upstream that promises 64 bytes, sends 7 and hangs up.
async fn truncating_upstream() -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 64\r\ncontent-type: text/plain\r\n\r\npartial")
                .await;
            let _ = socket.flush().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(socket);
        }
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_upstream_failure_mid_body_aborts_downstream() {
    let upstream = truncating_upstream().await;
    let gateway = TestGateway::start(base_config(
        json!([{ "id": "truncated", "target": upstream }]),
        json!({}),
    ))
    .await;

    let response = reqwest::get(gateway.url("/download")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.bytes().await.is_err());

    let records = gateway.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].route.as_deref(), Some("truncated"));
    assert_eq!(records[0].status, 200);

    gateway.shutdown().await;
}
