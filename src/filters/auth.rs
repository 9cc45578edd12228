// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP Basic authentication.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use globset::{Glob, GlobSet, GlobSetBuilder};
use reqwest::header::{AUTHORIZATION, HeaderValue, WWW_AUTHENTICATE};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::core::{Exchange, Filter, FilterAction, FilterType, ProxyError, ProxyResponse};
use crate::{debug_fmt, trace_fmt, warn_fmt};

const BASIC: &str = "basic ";

/// Requests that skip authentication.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BypassRuleConfig {
    /// Methods, or `*` for all
    pub methods: Vec<String>,
    /// Path glob
    pub path: String,
}

#[derive(Debug)]
struct BypassRule {
    methods: Vec<String>,
    paths: GlobSet,
}

impl BypassRule {
    fn matches(&self, method: &str, path: &str) -> bool {
        let method_match = self.methods.iter().any(|m| m == "*" || m == method);
        method_match && self.paths.is_match(path)
    }
}

/// Configuration for the basic auth filter.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BasicAuthFilterConfig {
    /// `username:password` pairs
    pub credentials: Vec<String>,
    /// Realm announced in `WWW-Authenticate`
    #[serde(default = "default_realm")]
    pub realm: String,
    #[serde(default)]
    pub bypass: Vec<BypassRuleConfig>,
    /// Drop the Authorization header before forwarding
    #[serde(default = "default_strip")]
    pub strip_credentials: bool,
}

fn default_realm() -> String {
    "portcullis".to_string()
}

fn default_strip() -> bool {
    true
}

/// Checks `Authorization: Basic` credentials and answers 401 on failure.
#[derive(Debug)]
pub struct BasicAuthFilter {
    credentials: Vec<(String, String)>,
    rules: Vec<BypassRule>,
    challenge: HeaderValue,
    strip_credentials: bool,
}

impl BasicAuthFilter {
    pub fn new(config: BasicAuthFilterConfig) -> Result<Self, ProxyError> {
        if config.credentials.is_empty() {
            return Err(ProxyError::Configuration(
                "basic_auth needs at least one credential".into(),
            ));
        }

        let credentials = config
            .credentials
            .iter()
            .map(|pair| {
                pair.split_once(':')
                    .map(|(user, pass)| (user.to_string(), pass.to_string()))
                    .ok_or_else(|| {
                        ProxyError::Configuration(
                            "credentials must be formatted as 'username:password'".into(),
                        )
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let rules = config
            .bypass
            .iter()
            .map(|raw| {
                let glob = Glob::new(&raw.path).map_err(|e| {
                    ProxyError::Configuration(format!("invalid bypass path '{}': {}", raw.path, e))
                })?;
                let paths = GlobSetBuilder::new().add(glob).build().map_err(|e| {
                    ProxyError::Configuration(format!("invalid bypass path '{}': {}", raw.path, e))
                })?;
                Ok(BypassRule {
                    methods: raw.methods.iter().map(|m| m.to_ascii_uppercase()).collect(),
                    paths,
                })
            })
            .collect::<Result<Vec<_>, ProxyError>>()?;

        let challenge = HeaderValue::from_str(&format!(
            "Basic realm=\"{}\", charset=\"UTF-8\"",
            config.realm.replace('"', "")
        ))
        .map_err(|e| ProxyError::Configuration(format!("invalid realm: {e}")))?;

        Ok(Self {
            credentials,
            rules,
            challenge,
            strip_credentials: config.strip_credentials,
        })
    }

    /// Compare against every stored pair so timing does not depend on which
    /// one matched.
    pub fn validate_credentials(&self, username: &str, password: &str) -> bool {
        let mut valid = false;
        for (stored_user, stored_pass) in &self.credentials {
            let user_match = stored_user.as_bytes().ct_eq(username.as_bytes());
            let pass_match = stored_pass.as_bytes().ct_eq(password.as_bytes());
            valid |= bool::from(user_match & pass_match);
        }
        valid
    }

    fn decode(header: &str) -> Option<(String, String)> {
        if header.len() < BASIC.len() || !header[..BASIC.len()].eq_ignore_ascii_case(BASIC) {
            return None;
        }
        let decoded = general_purpose::STANDARD
            .decode(header[BASIC.len()..].trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, pass) = decoded.split_once(':')?;
        Some((user.to_string(), pass.to_string()))
    }

    fn unauthorized(&self) -> ProxyResponse {
        let mut response = ProxyResponse::json(
            401,
            &serde_json::json!({
                "error": { "status": 401, "kind": "unauthorized", "message": "authentication required" }
            }),
        );
        response
            .headers
            .insert(WWW_AUTHENTICATE, self.challenge.clone());
        response
    }
}

#[async_trait]
impl Filter for BasicAuthFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::Pre
    }

    fn name(&self) -> &str {
        "basic_auth"
    }

    async fn pre_filter(&self, exchange: &mut Exchange) -> Result<FilterAction, ProxyError> {
        let method = exchange.inbound.method.to_string();
        if self
            .rules
            .iter()
            .any(|r| r.matches(&method, &exchange.inbound.path))
        {
            debug_fmt!("BasicAuthFilter", "Bypass for {} {}", method, exchange.inbound.path);
            return Ok(FilterAction::Continue);
        }

        let credentials = exchange
            .inbound
            .headers
            .get(AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(Self::decode);

        match credentials {
            Some((user, pass)) if self.validate_credentials(&user, &pass) => {
                trace_fmt!("BasicAuthFilter", "[{}] authenticated '{}'", exchange.id, user);
                if self.strip_credentials {
                    exchange.outbound.headers.remove(AUTHORIZATION);
                }
                Ok(FilterAction::Continue)
            }
            Some(_) => {
                warn_fmt!("BasicAuthFilter", "[{}] invalid credentials", exchange.id);
                Ok(FilterAction::Respond(self.unauthorized()))
            }
            None => {
                debug_fmt!("BasicAuthFilter", "[{}] missing credentials", exchange.id);
                Ok(FilterAction::Respond(self.unauthorized()))
            }
        }
    }
}
