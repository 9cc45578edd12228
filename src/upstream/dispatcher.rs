// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Streaming forwarder with bounded retries.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::io;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use reqwest::header::{CONNECTION, HOST, HeaderMap, HeaderName, HeaderValue};

use super::{UpstreamResolver, UpstreamTarget};
use crate::config::{PoolSettings, RetrySettings};
use crate::core::{Dispatch, DispatchError, DispatchErrorKind, Exchange, ProxyResponse};
use crate::filters::{PRESERVE_HOST_ATTRIBUTE, empty_body};
use crate::{debug_fmt, info_fmt, warn_fmt};

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Exponential backoff with up to 10% jitter.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let capped_delay = base_ms.saturating_mul(exponential_base).min(max_ms);

    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}

/// One keep-alive `reqwest::Client` per distinct connect timeout.
#[derive(Debug)]
pub struct ClientPool {
    clients: RwLock<HashMap<Duration, reqwest::Client>>,
    settings: PoolSettings,
}

impl ClientPool {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            settings,
        }
    }

    pub fn client(&self, connect_timeout: Duration) -> Result<reqwest::Client, DispatchError> {
        if let Some(client) = self
            .clients
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&connect_timeout)
        {
            return Ok(client.clone());
        }

        let mut clients = self.clients.write().unwrap_or_else(|p| p.into_inner());
        if let Some(client) = clients.get(&connect_timeout) {
            return Ok(client.clone());
        }

        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(self.settings.max_idle_per_host)
            .pool_idle_timeout(Duration::from_millis(self.settings.idle_timeout_ms))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| {
                DispatchError::new(
                    DispatchErrorKind::UpstreamProtocolError,
                    format!("failed to build HTTP client: {e}"),
                )
            })?;
        debug_fmt!("Dispatcher", "Created client for connect timeout {:?}", connect_timeout);
        clients.insert(connect_timeout, client.clone());
        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.clients.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Forwards the outbound draft of an exchange to its upstream.
#[derive(Debug)]
pub struct Dispatcher {
    resolver: UpstreamResolver,
    clients: ClientPool,
    retry: RetrySettings,
}

impl Dispatcher {
    pub fn new(resolver: UpstreamResolver, retry: RetrySettings, pool: PoolSettings) -> Self {
        Self {
            resolver,
            clients: ClientPool::new(pool),
            retry,
        }
    }

    pub fn resolver(&self) -> &UpstreamResolver {
        &self.resolver
    }

    async fn send_once(
        &self,
        exchange: &Exchange,
        target: &UpstreamTarget,
        body: reqwest::Body,
    ) -> Result<ProxyResponse, DispatchError> {
        let client = self.clients.client(target.connect_timeout)?;
        let url = target.url_for(&exchange.outbound.path, exchange.outbound.query.as_deref());
        let headers = outbound_headers(exchange);

        debug_fmt!(
            "Dispatcher",
            "[{}] {} {}",
            exchange.id,
            exchange.outbound.method,
            url
        );

        let request = client
            .request(exchange.outbound.method.into(), url)
            .headers(headers)
            .body(body)
            .timeout(target.response_timeout);

        let response = match tokio::time::timeout(target.response_timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Err(DispatchError::new(classify(&e), format!("{target}: {e}")));
            }
            Err(_) => {
                return Err(DispatchError::new(
                    DispatchErrorKind::Timeout,
                    format!("{target} sent no response within {:?}", target.response_timeout),
                ));
            }
        };

        let status = response.status().as_u16();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);

        Ok(ProxyResponse {
            status,
            headers,
            body: reqwest::Body::wrap_stream(response.bytes_stream()),
        })
    }
}

#[async_trait]
impl Dispatch for Dispatcher {
    async fn dispatch(&self, exchange: &mut Exchange) -> Result<(), DispatchError> {
        let route = exchange.route.clone().ok_or_else(|| {
            DispatchError::new(
                DispatchErrorKind::UpstreamProtocolError,
                "exchange reached the dispatcher without a route",
            )
        })?;
        let max_retries = route.max_retries.unwrap_or(self.retry.max_retries);

        let body = std::mem::replace(&mut exchange.outbound.body, empty_body());
        // streamed bodies cannot be sent twice
        let replay: Option<Bytes> = if exchange.outbound.method.is_idempotent() {
            body.as_bytes().map(Bytes::copy_from_slice)
        } else {
            None
        };
        let mut first = Some(body);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let target = self
                .resolver
                .resolve(&route)
                .map_err(|e| e.with_attempts(attempt))?;
            exchange.upstream = Some(target.to_string());

            let body = match first.take() {
                Some(body) => body,
                None => replay
                    .clone()
                    .map(reqwest::Body::from)
                    .unwrap_or_else(empty_body),
            };

            match self.send_once(exchange, &target, body).await {
                Ok(response) => {
                    exchange.response = Some(response);
                    return Ok(());
                }
                Err(err) => {
                    let retry = err.kind.is_retryable()
                        && replay.is_some()
                        && attempt <= max_retries;
                    if !retry {
                        warn_fmt!(
                            "Dispatcher",
                            "[{}] route '{}' failed on attempt {}: {}",
                            exchange.id,
                            route.id,
                            attempt,
                            err.message
                        );
                        return Err(err.with_attempts(attempt));
                    }

                    let delay =
                        calculate_backoff(attempt, self.retry.base_delay_ms, self.retry.max_delay_ms);
                    info_fmt!(
                        "Dispatcher",
                        "[{}] retrying route '{}' in {:?} after: {}",
                        exchange.id,
                        route.id,
                        delay,
                        err.message
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Headers for the upstream request: hop-by-hop removed, Host set to the
/// upstream authority unless `preserve_host` asked otherwise.
fn outbound_headers(exchange: &Exchange) -> HeaderMap {
    let mut headers = exchange.outbound.headers.clone();
    strip_hop_by_hop(&mut headers);

    let preserve_host = exchange
        .attribute(PRESERVE_HOST_ATTRIBUTE)
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    if preserve_host {
        let host = exchange.inbound.headers.get(HOST).cloned().or_else(|| {
            exchange
                .inbound
                .authority
                .as_deref()
                .and_then(|a| HeaderValue::from_str(a).ok())
        });
        if let Some(host) = host {
            headers.insert(HOST, host);
        }
    } else {
        headers.remove(HOST);
    }
    headers
}

/// Remove hop-by-hop headers, including any the Connection header names.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Map a client error onto the gateway's failure kinds.
fn classify(err: &reqwest::Error) -> DispatchErrorKind {
    if err.is_timeout() {
        return DispatchErrorKind::Timeout;
    }
    if err.is_connect() {
        return DispatchErrorKind::Unreachable;
    }

    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::TimedOut => return DispatchErrorKind::Timeout,
                io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::NotConnected => return DispatchErrorKind::Unreachable,
                _ => {}
            }
        }
        if let Some(hyper_err) = cause.downcast_ref::<hyper::Error>() {
            if hyper_err.is_incomplete_message() || hyper_err.is_closed() || hyper_err.is_canceled()
            {
                return DispatchErrorKind::Unreachable;
            }
        }
        source = cause.source();
    }

    DispatchErrorKind::UpstreamProtocolError
}
