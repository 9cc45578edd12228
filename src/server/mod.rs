// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP server implementation for the gateway.
//!
//! Accepts HTTP/1.1 and HTTP/2 connections, turns every request into an
//! [`Exchange`], hands it to [`ProxyCore`] and writes back whatever response
//! comes out.  Request and response bodies are streamed in both directions.

pub mod health;


pub use health::HealthServer;

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body as _, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::ServerConfig;
use crate::core::{Exchange, HttpMethod, InboundRequest, ProxyCore, ProxyError, ProxyResponse};
use crate::{debug_fmt, error_fmt, info_fmt, warn_fmt};

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
/// Pause after a failed `accept`; errors like EMFILE repeat immediately.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// HTTP server that forwards every request through a [`ProxyCore`].
#[derive(Debug, Clone)]
pub struct ProxyServer {
    config: ServerConfig,
    core: Arc<ProxyCore>,
    drain_timeout: Duration,
}

impl ProxyServer {
    pub fn new(config: ServerConfig, core: Arc<ProxyCore>) -> Self {
        Self {
            config,
            core,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// How long in-flight connections get to finish after shutdown starts.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn core(&self) -> &Arc<ProxyCore> {
        &self.core
    }

    /// Bind the configured address and serve until Ctrl-C or SIGTERM.
    pub async fn start(&self) -> Result<(), ProxyError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            error_fmt!("Server", "Failed to bind {}: {}", addr, e);
            ProxyError::Io(e)
        })?;

        let health = match self.config.health_port {
            Some(port) => {
                let health_addr = format!("{}:{}", self.config.host, port);
                match health_addr.parse::<SocketAddr>() {
                    Ok(health_addr) => match HealthServer::bind(health_addr).await {
                        Ok(server) => Some(server),
                        Err(e) => {
                            error_fmt!("Server", "Health server failed to bind {}: {}", health_addr, e);
                            None
                        }
                    },
                    Err(e) => {
                        error_fmt!("Server", "Invalid health address {}: {}", health_addr, e);
                        None
                    }
                }
            }
            None => None,
        };

        let signal = shutdown_signal()?;
        if let Some(health) = &health {
            health.set_ready();
        }

        let result = self.serve_with_shutdown(listener, signal).await;

        if let Some(health) = &health {
            health.set_not_ready();
        }
        result
    }

    /// Serve connections from `listener` until `signal` resolves, then stop
    /// accepting and drain in-flight connections.
    pub async fn serve_with_shutdown<F>(
        &self,
        listener: TcpListener,
        signal: F,
    ) -> Result<(), ProxyError>
    where
        F: Future<Output = ()> + Send,
    {
        let local_addr = listener.local_addr()?;
        info_fmt!("Server", "Listening on http://{}", local_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info_fmt!("Server", "Shutdown signal received, no longer accepting connections");
                    break;
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error_fmt!("Server", "Connection task panicked: {}", e);
                        }
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        connections.spawn(serve_connection(
                            stream,
                            remote_addr,
                            self.core.clone(),
                            shutdown_rx.clone(),
                        ));
                    }
                    Err(e) => accept_failed("Server", &e).await,
                }
            }
        }

        drop(listener);
        let _ = shutdown_tx.send(true);

        let in_flight = connections.len();
        if in_flight > 0 {
            info_fmt!("Server", "Draining {} connection(s)", in_flight);
        }
        let drained = tokio::time::timeout(self.drain_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn_fmt!(
                "Server",
                "{} connection(s) still open after {:?}, aborting",
                connections.len(),
                self.drain_timeout
            );
            connections.shutdown().await;
        }

        info_fmt!("Server", "Server on {} stopped", local_addr);
        Ok(())
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub(crate) async fn accept_failed(component: &str, err: &std::io::Error) {
    warn_fmt!(component, "Accept failed: {}", err);
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

fn shutdown_signal() -> Result<impl Future<Output = ()> + Send, ProxyError> {
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    Ok(async move {
        #[cfg(unix)]
        let terminated = async move {
            terminate.recv().await;
        };
        #[cfg(not(unix))]
        let terminated = std::future::pending::<()>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info_fmt!("Server", "Received Ctrl-C"),
            _ = terminated => info_fmt!("Server", "Received SIGTERM"),
        }
    })
}

async fn serve_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    core: Arc<ProxyCore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let service = service_fn(move |req: Request<Incoming>| {
        let core = core.clone();
        async move { Ok::<_, Infallible>(handle_request(req, remote_addr, core).await) }
    });

    let builder = AutoBuilder::new(TokioExecutor::new());
    let connection = builder.serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = shutdown.changed() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };

    if let Err(err) = result {
        debug_fmt!("Server", "Connection from {} ended with error: {}", remote_addr, err);
    }
}

async fn handle_request(
    req: Request<Incoming>,
    remote_addr: SocketAddr,
    core: Arc<ProxyCore>,
) -> Response<reqwest::Body> {
    match convert_hyper_request(req, remote_addr) {
        Some(exchange) => convert_proxy_response(core.handle(exchange).await),
        None => convert_proxy_response(ProxyResponse::json(
            501,
            &serde_json::json!({
                "error": {
                    "status": 501,
                    "kind": "unsupported_method",
                    "message": "method not supported by the gateway",
                }
            }),
        )),
    }
}

/// Turn an inbound hyper request into an exchange, streaming the body.
///
/// Returns `None` for extension methods the gateway does not route.
fn convert_hyper_request(req: Request<Incoming>, remote_addr: SocketAddr) -> Option<Exchange> {
    let (parts, body) = req.into_parts();

    let Some(method) = HttpMethod::from_method(&parts.method) else {
        warn_fmt!("Server", "Unsupported method {} from {}", parts.method, remote_addr);
        return None;
    };

    let inbound = InboundRequest {
        method,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_owned),
        headers: parts.headers,
        authority: parts.uri.authority().map(|a| a.to_string()),
        version: parts.version,
    };

    let body = if body.is_end_stream() {
        reqwest::Body::from(Bytes::new())
    } else {
        reqwest::Body::wrap_stream(body.into_data_stream())
    };

    Some(Exchange::new(inbound, body).with_client_addr(remote_addr))
}

fn convert_proxy_response(response: ProxyResponse) -> Response<reqwest::Body> {
    let mut converted = Response::new(response.body);
    *converted.status_mut() =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    *converted.headers_mut() = response.headers;
    converted
}
