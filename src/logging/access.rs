// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One record per handled request.

use std::fmt;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::core::Exchange;
use crate::logging::is_structured_logging;

/// What the gateway did with one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessRecord {
    pub request_id: String,
    pub method: String,
    pub path: String,
    /// `None` when no route matched
    pub route: Option<String>,
    pub status: u16,
    pub latency_ms: u64,
    pub upstream: Option<String>,
    pub error_kind: Option<String>,
    /// RFC 3339, UTC
    pub timestamp: String,
}

impl AccessRecord {
    pub fn from_exchange(exchange: &Exchange, status: u16) -> Self {
        Self {
            request_id: exchange.id.clone(),
            method: exchange.inbound.method.to_string(),
            path: exchange.inbound.path.clone(),
            route: exchange.route_id().map(str::to_owned),
            status,
            latency_ms: u64::try_from(exchange.started_at.elapsed().as_millis())
                .unwrap_or(u64::MAX),
            upstream: exchange.upstream.clone(),
            error_kind: exchange.failure.map(str::to_owned),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

impl fmt::Display for AccessRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}ms route={} upstream={} error={}",
            self.request_id,
            self.method,
            self.path,
            self.status,
            self.latency_ms,
            self.route.as_deref().unwrap_or("-"),
            self.upstream.as_deref().unwrap_or("-"),
            self.error_kind.as_deref().unwrap_or("-"),
        )
    }
}

/// Receives every [`AccessRecord`].
pub trait AccessSink: fmt::Debug + Send + Sync {
    fn record(&self, record: &AccessRecord);
}

/// Writes records to the active logger.
#[derive(Debug, Default)]
pub struct LogAccessSink;

impl AccessSink for LogAccessSink {
    fn record(&self, record: &AccessRecord) {
        if is_structured_logging() {
            slog::info!(slog_scope::logger(), "access";
                "request_id" => &record.request_id,
                "method" => &record.method,
                "path" => &record.path,
                "route" => record.route.as_deref().unwrap_or("-"),
                "status" => record.status,
                "latency_ms" => record.latency_ms,
                "upstream" => record.upstream.as_deref().unwrap_or("-"),
                "error_kind" => record.error_kind.as_deref().unwrap_or("-"),
                "timestamp" => &record.timestamp
            );
        } else {
            log::info!(target: "portcullis::access", "{record}");
        }
    }
}

/// Keeps records in memory; useful for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryAccessSink {
    records: Mutex<Vec<AccessRecord>>,
}

impl MemoryAccessSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AccessRecord> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AccessSink for MemoryAccessSink {
    fn record(&self, record: &AccessRecord) {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(record.clone());
    }
}
