// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `X-Forwarded-*` headers.

use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::core::{Exchange, Filter, FilterAction, FilterType, ProxyError};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Configuration for the forwarded filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardedFilterConfig {
    /// Scheme reported in `X-Forwarded-Proto`
    #[serde(default = "default_proto")]
    pub proto: String,
    /// Keep an `X-Forwarded-Proto` the caller already sent
    #[serde(default)]
    pub trust_incoming_proto: bool,
}

fn default_proto() -> String {
    "http".to_string()
}

impl Default for ForwardedFilterConfig {
    fn default() -> Self {
        Self {
            proto: default_proto(),
            trust_incoming_proto: false,
        }
    }
}

/// Appends the client address to `X-Forwarded-For` and sets
/// `X-Forwarded-Proto` / `X-Forwarded-Host`.
#[derive(Debug)]
pub struct ForwardedFilter {
    config: ForwardedFilterConfig,
}

impl ForwardedFilter {
    pub fn new(config: ForwardedFilterConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Filter for ForwardedFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::Pre
    }

    fn name(&self) -> &str {
        "forwarded"
    }

    async fn pre_filter(&self, exchange: &mut Exchange) -> Result<FilterAction, ProxyError> {
        let headers = &mut exchange.outbound.headers;

        if let Some(addr) = exchange.client_addr {
            let client = addr.ip().to_string();
            let chain = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(existing) if !existing.trim().is_empty() => format!("{existing}, {client}"),
                _ => client,
            };
            if let Ok(value) = HeaderValue::from_str(&chain) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }

        if !(self.config.trust_incoming_proto && headers.contains_key(&X_FORWARDED_PROTO)) {
            if let Ok(value) = HeaderValue::from_str(&self.config.proto) {
                headers.insert(X_FORWARDED_PROTO, value);
            }
        }

        if let Some(host) = exchange
            .inbound
            .headers
            .get(reqwest::header::HOST)
            .cloned()
            .or_else(|| {
                exchange
                    .inbound
                    .authority
                    .as_deref()
                    .and_then(|a| HeaderValue::from_str(a).ok())
            })
        {
            headers.insert(X_FORWARDED_HOST, host);
        }

        Ok(FilterAction::Continue)
    }
}
