// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{GatewayLoader, LoaderError};
use crate::config::{Config, ConfigError, ConfigProvider};
use crate::core::{Filter, FilterType, ProxyError};

// Mock config provider for testing
#[derive(Debug, Default)]
struct MockConfigProvider {
    values: HashMap<String, Value>,
}

impl MockConfigProvider {
    fn with(mut self, key: &str, value: Value) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }
}

impl ConfigProvider for MockConfigProvider {
    fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    fn provider_name(&self) -> &str {
        "mock"
    }

    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        Ok(self.values.get(key).cloned())
    }
}

fn orders_route(id: &str) -> Value {
    json!({
        "id": id,
        "target": "lb://order-svc",
        "predicates": [{ "type": "path", "config": { "pattern": "/orders/*" } }]
    })
}

fn base_provider() -> MockConfigProvider {
    MockConfigProvider::default()
        .with("server.port", json!(9000))
        .with("server.host", json!("127.0.0.1"))
        .with("routes", json!([orders_route("orders")]))
        .with("upstreams", json!({ "order-svc": ["http://127.0.0.1:9001"] }))
}

#[tokio::test]
async fn test_loader_with_provider() {
    let gateway = GatewayLoader::new().with_provider(base_provider()).build().unwrap();

    let config = gateway.config();
    assert_eq!(config.get::<u64>("server.port").unwrap().unwrap(), 9000);
    assert_eq!(config.get::<String>("server.host").unwrap().unwrap(), "127.0.0.1");

    let table = gateway.routes().snapshot();
    assert_eq!(table.generation(), 1);
    assert_eq!(table.len(), 1);
    assert!(table.get("orders").is_some());
}

#[tokio::test]
async fn test_loader_with_layered_config() {
    let overrides = MockConfigProvider::default().with("server.port", json!(9100));
    let config = Config::builder()
        .with_provider(base_provider())
        .with_provider(overrides)
        .build();

    assert_eq!(config.get::<u64>("server.port").unwrap().unwrap(), 9100);
    assert_eq!(config.get::<String>("server.host").unwrap().unwrap(), "127.0.0.1");
}

#[tokio::test]
async fn test_unknown_filter_fails_build() {
    let provider = MockConfigProvider::default().with(
        "routes",
        json!([{
            "id": "broken",
            "target": "http://127.0.0.1:9001",
            "filters": [{ "type": "does_not_exist" }]
        }]),
    );

    let err = GatewayLoader::new().with_provider(provider).build().unwrap_err();
    match err {
        LoaderError::ProxyError(ProxyError::Configuration(msg)) => {
            assert!(msg.contains("broken"), "{msg}");
            assert!(msg.contains("does_not_exist"), "{msg}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_upstream_fails_build() {
    let provider = base_provider().with("upstreams", json!({ "order-svc": ["ftp://nope"] }));
    let err = GatewayLoader::new().with_provider(provider).build().unwrap_err();
    assert!(matches!(
        err,
        LoaderError::ProxyError(ProxyError::Configuration(_))
    ));
}

#[derive(Debug)]
struct TagFilter;

#[async_trait]
impl Filter for TagFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::Pre
    }

    fn name(&self) -> &str {
        "tag"
    }
}

#[tokio::test]
async fn test_custom_filter_is_available_to_routes() {
    let provider = MockConfigProvider::default().with(
        "routes",
        json!([{
            "id": "tagged",
            "target": "http://127.0.0.1:9001",
            "filters": [{ "type": "tag" }]
        }]),
    );

    let gateway = GatewayLoader::new()
        .with_provider(provider)
        .with_filter("tag", |_| Ok(Arc::new(TagFilter)))
        .build()
        .unwrap();

    let route = gateway.routes().snapshot().get("tagged").unwrap();
    assert_eq!(route.chain().names(), vec!["tag"]);
}

#[tokio::test]
async fn test_global_filters_run_before_route_filters() {
    let provider = MockConfigProvider::default()
        .with("proxy.global_filters", json!([{ "type": "request_id" }]))
        .with(
            "routes",
            json!([{
                "id": "r",
                "target": "http://127.0.0.1:9001",
                "filters": [{ "type": "preserve_host" }]
            }]),
        );

    let gateway = GatewayLoader::new().with_provider(provider).build().unwrap();
    let route = gateway.routes().snapshot().get("r").unwrap();
    assert_eq!(route.chain().names(), vec!["request_id", "preserve_host"]);
}

#[tokio::test]
async fn test_reload_swaps_routes_and_rejects_invalid() {
    let gateway = GatewayLoader::new().with_provider(base_provider()).build().unwrap();

    let next = Config::builder()
        .with_provider(
            base_provider().with("routes", json!([orders_route("orders"), orders_route("orders-2")])),
        )
        .build();
    assert_eq!(gateway.reload(&next).unwrap(), 2);
    assert_eq!(gateway.routes().snapshot().len(), 2);

    let duplicate = Config::builder()
        .with_provider(
            base_provider().with("routes", json!([orders_route("dup"), orders_route("dup")])),
        )
        .build();
    assert!(gateway.reload(&duplicate).is_err());

    let table = gateway.routes().snapshot();
    assert_eq!(table.generation(), 2);
    assert!(table.get("orders-2").is_some());

    let bad_upstreams = Config::builder()
        .with_provider(base_provider().with("upstreams", json!({ "order-svc": ["not a url"] })))
        .build();
    assert!(gateway.reload(&bad_upstreams).is_err());
    assert_eq!(gateway.routes().snapshot().generation(), 2);
}

#[tokio::test]
async fn test_reload_from_sources_rereads_file() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    write!(
        file,
        r#"
[server]
port = 0

[[routes]]
id = "first"
target = "http://127.0.0.1:9001"
"#
    )
    .unwrap();
    file.flush().unwrap();

    let path = file.path().to_str().unwrap().to_string();
    let gateway = GatewayLoader::new().with_config_file(&path).build().unwrap();
    assert!(gateway.routes().snapshot().get("first").is_some());

    std::fs::write(
        &path,
        r#"
[server]
port = 0

[[routes]]
id = "second"
target = "http://127.0.0.1:9002"
priority = 5
"#,
    )
    .unwrap();

    assert_eq!(gateway.reload_from_sources().unwrap(), 2);
    let table = gateway.routes().snapshot();
    assert!(table.get("first").is_none());
    assert_eq!(table.get("second").unwrap().priority, 5);
}

#[tokio::test]
async fn test_missing_config_file_fails_build() {
    let err = GatewayLoader::new()
        .with_config_file("/definitely/not/here/portcullis.toml")
        .build()
        .unwrap_err();
    assert!(matches!(err, LoaderError::ConfigError(_)));
}
