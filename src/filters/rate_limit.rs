// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Token bucket rate limiting per client key.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue, RETRY_AFTER};
use serde::{Deserialize, Serialize};

use crate::core::{Exchange, Filter, FilterAction, FilterType, ProxyError, ProxyResponse};
use crate::{trace_fmt, warn_fmt};

/// Configuration for the rate limit filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitFilterConfig {
    /// Sustained requests per second per key
    pub requests_per_second: f64,
    /// Bucket capacity; defaults to `requests_per_second`
    #[serde(default)]
    pub burst: Option<f64>,
    /// Key requests by this header instead of the client IP
    #[serde(default)]
    pub key_header: Option<String>,
    /// How often buckets that have refilled are forgotten
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Tracked keys beyond which a sweep runs on the next request
    #[serde(default = "default_max_keys")]
    pub max_keys: usize,
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_max_keys() -> usize {
    10_000
}

struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant, capacity: f64, refill_rate: f64) {
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_update = now;
    }

    fn try_acquire(&mut self, capacity: f64, refill_rate: f64) -> bool {
        self.refill(Instant::now(), capacity, refill_rate);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct Buckets {
    by_key: HashMap<String, TokenBucket>,
    last_sweep: Instant,
}

/// Short-circuits with 429 once a key's bucket is empty.
///
/// A full bucket is indistinguishable from a fresh one, so sweeps drop
/// them; the key map stays bounded by the keys active within one sweep
/// interval.
pub struct RateLimitFilter {
    rate: f64,
    burst: f64,
    key_header: Option<HeaderName>,
    sweep_interval: Duration,
    max_keys: usize,
    buckets: Mutex<Buckets>,
}

impl std::fmt::Debug for RateLimitFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitFilter")
            .field("rate", &self.rate)
            .field("burst", &self.burst)
            .field("key_header", &self.key_header)
            .field("sweep_interval", &self.sweep_interval)
            .finish()
    }
}

impl RateLimitFilter {
    pub fn new(config: RateLimitFilterConfig) -> Result<Self, ProxyError> {
        if config.requests_per_second.is_nan() || config.requests_per_second <= 0.0 {
            return Err(ProxyError::Configuration(
                "rate_limit requests_per_second must be positive".into(),
            ));
        }
        let burst = config.burst.unwrap_or(config.requests_per_second).max(1.0);
        let key_header = config
            .key_header
            .map(|name| {
                HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                    ProxyError::Configuration(format!("invalid key_header '{name}': {e}"))
                })
            })
            .transpose()?;

        Ok(Self {
            rate: config.requests_per_second,
            burst,
            key_header,
            sweep_interval: Duration::from_millis(config.sweep_interval_ms),
            max_keys: config.max_keys.max(1),
            buckets: Mutex::new(Buckets {
                by_key: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        })
    }

    fn key(&self, exchange: &Exchange) -> String {
        if let Some(header) = &self.key_header {
            if let Some(value) = exchange
                .inbound
                .headers
                .get(header)
                .and_then(|v| v.to_str().ok())
            {
                return value.to_string();
            }
        }
        exchange
            .client_addr
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Take one token for `key`.
    pub fn check(&self, key: &str) -> bool {
        let mut buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());

        let now = Instant::now();
        if buckets.by_key.len() >= self.max_keys
            || now.duration_since(buckets.last_sweep) >= self.sweep_interval
        {
            self.sweep(&mut buckets, now);
        }

        let bucket = buckets
            .by_key
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.burst));
        bucket.try_acquire(self.burst, self.rate)
    }

    fn sweep(&self, buckets: &mut Buckets, now: Instant) {
        let before = buckets.by_key.len();
        buckets.by_key.retain(|_, bucket| {
            bucket.refill(now, self.burst, self.rate);
            bucket.tokens < self.burst
        });
        buckets.last_sweep = now;
        trace_fmt!(
            "RateLimitFilter",
            "Swept {} idle keys, {} tracked",
            before - buckets.by_key.len(),
            buckets.by_key.len()
        );
    }

    /// Number of keys currently holding a partially drained bucket.
    pub fn tracked_keys(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .by_key
            .len()
    }
}

#[async_trait]
impl Filter for RateLimitFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::Pre
    }

    fn name(&self) -> &str {
        "rate_limit"
    }

    async fn pre_filter(&self, exchange: &mut Exchange) -> Result<FilterAction, ProxyError> {
        let key = self.key(exchange);
        if self.check(&key) {
            return Ok(FilterAction::Continue);
        }

        warn_fmt!("RateLimitFilter", "[{}] rate limit exceeded for {}", exchange.id, key);
        let mut response = ProxyResponse::json(
            429,
            &serde_json::json!({
                "error": {
                    "status": 429,
                    "kind": "rate_limited",
                    "message": "rate limit exceeded",
                    "request_id": exchange.id,
                }
            }),
        );
        let retry_after = (1.0 / self.rate).ceil().max(1.0) as u64;
        if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
            response.headers.insert(RETRY_AFTER, value);
        }
        Ok(FilterAction::Respond(response))
    }
}
