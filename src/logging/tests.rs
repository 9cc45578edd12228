// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use log::LevelFilter;
use serde_json::json;

use super::access::{AccessRecord, AccessSink, LogAccessSink, MemoryAccessSink};
use super::config::LoggingConfig;
use super::structured::{LogFormat, LoggerConfig, create_logger, generate_request_id};
use crate::core::{Exchange, HttpMethod, InboundRequest};
use crate::router::{RouteCompiler, RouteConfig, RouteDefaults, RouteTable};
use crate::filters::FilterRegistry;

fn sample_record() -> AccessRecord {
    AccessRecord {
        request_id: "req-1".to_string(),
        method: "GET".to_string(),
        path: "/orders/42".to_string(),
        route: Some("orders".to_string()),
        status: 502,
        latency_ms: 12,
        upstream: Some("http://10.0.0.1:8080".to_string()),
        error_kind: Some("unreachable".to_string()),
        timestamp: "2026-01-01T00:00:00.000Z".to_string(),
    }
}

#[test]
fn test_level_filter() {
    let mut config = LoggingConfig::default();
    assert_eq!(config.level_filter(), LevelFilter::Info);

    for (name, expected) in [
        ("TRACE", LevelFilter::Trace),
        ("debug", LevelFilter::Debug),
        ("warning", LevelFilter::Warn),
        ("critical", LevelFilter::Error),
        ("off", LevelFilter::Off),
        ("chatty", LevelFilter::Info),
    ] {
        config.level = name.to_string();
        assert_eq!(config.level_filter(), expected, "{name}");
    }
}

#[test]
fn test_logging_config_deserializes_with_defaults() {
    let config: LoggingConfig = serde_json::from_value(json!({
        "structured": true,
        "format": "json",
        "static_fields": { "service": "gateway" }
    }))
    .unwrap();

    assert!(config.structured);
    assert_eq!(config.level, "info");
    assert!(config.include_location);

    let logger_config = config.to_logger_config();
    assert_eq!(logger_config.format, LogFormat::Json);
    assert_eq!(logger_config.level, slog::Level::Info);
    assert_eq!(
        logger_config.static_fields,
        vec![("service".to_string(), "gateway".to_string())]
    );
}

#[test]
fn test_create_logger_for_each_format() {
    for format in [LogFormat::Terminal, LogFormat::Json] {
        let logger = create_logger(&LoggerConfig {
            format,
            level: slog::Level::Debug,
            include_location: true,
            include_thread_id: false,
            static_fields: vec![("env".to_string(), "test".to_string())],
        });
        slog::debug!(logger, "logger built"; "format" => format!("{format:?}"));
    }
}

#[test]
fn test_init_is_idempotent() {
    super::init(Some(LevelFilter::Warn));
    super::init(Some(LevelFilter::Debug));
    assert!(!super::is_structured_logging());
}

#[test]
fn test_generate_request_id() {
    let a = generate_request_id();
    let b = generate_request_id();
    assert_ne!(a, b);
    assert!(uuid::Uuid::parse_str(&a).is_ok());
}

#[test]
fn test_access_record_from_exchange() {
    let compiler = RouteCompiler::new(
        Arc::new(FilterRegistry::with_builtins()),
        Vec::new(),
        RouteDefaults::default(),
    );
    let table = RouteTable::build(&[RouteConfig::new("orders", "http://orders.test")], &compiler).unwrap();

    let inbound = InboundRequest::new(HttpMethod::Post, "/orders").with_header("x-request-id", "abc");
    let mut exchange = Exchange::new(inbound, reqwest::Body::from(""));
    exchange.route = table.get("orders");
    exchange.upstream = Some("http://orders.test".to_string());
    exchange.failure = Some("timeout");

    let record = AccessRecord::from_exchange(&exchange, 504);
    assert_eq!(record.request_id, "abc");
    assert_eq!(record.method, "POST");
    assert_eq!(record.path, "/orders");
    assert_eq!(record.route.as_deref(), Some("orders"));
    assert_eq!(record.status, 504);
    assert_eq!(record.upstream.as_deref(), Some("http://orders.test"));
    assert_eq!(record.error_kind.as_deref(), Some("timeout"));
    assert!(chrono::DateTime::parse_from_rfc3339(&record.timestamp).is_ok());
}

#[test]
fn test_access_record_display_and_json() {
    let record = sample_record();
    assert_eq!(
        record.to_string(),
        "req-1 GET /orders/42 502 12ms route=orders upstream=http://10.0.0.1:8080 error=unreachable"
    );

    let value = serde_json::to_value(&record).unwrap();
    assert_eq!(value["status"], 502);
    assert_eq!(value["error_kind"], "unreachable");

    let unmatched = AccessRecord {
        route: None,
        upstream: None,
        error_kind: None,
        ..sample_record()
    };
    assert!(unmatched.to_string().contains("route=- upstream=- error=-"));
}

#[test]
fn test_memory_sink_collects_records() {
    let sink = MemoryAccessSink::new();
    assert!(sink.is_empty());

    sink.record(&sample_record());
    sink.record(&AccessRecord {
        status: 200,
        ..sample_record()
    });

    assert_eq!(sink.len(), 2);
    assert_eq!(sink.records()[1].status, 200);
}

#[test]
fn test_log_sink_accepts_records() {
    LogAccessSink.record(&sample_record());
}
