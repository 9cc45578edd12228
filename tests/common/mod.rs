// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common helpers for the gateway integration tests.

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use portcullis::logging::access::MemoryAccessSink;
use portcullis::{Config, Gateway, GatewayLoader};
use serde_json::Value;
use tempfile::NamedTempFile;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Write `config` to a temporary JSON file.
pub fn write_config(config: &Value) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".json")
        .tempfile()
        .expect("create temp config");
    file.write_all(config.to_string().as_bytes())
        .expect("write temp config");
    file.flush().expect("flush temp config");
    file
}

/// Load a [`Config`] from an inline JSON document.
#[allow(dead_code)]
pub fn config_from(config: &Value) -> (Config, NamedTempFile) {
    let file = write_config(config);
    let path = file.path().to_str().expect("utf-8 path").to_string();
    (Config::default_file(&path).expect("load config"), file)
}

/// A gateway serving on an ephemeral port.
#[allow(dead_code)]
pub struct TestGateway {
    pub addr: SocketAddr,
    pub gateway: Gateway,
    pub sink: Arc<MemoryAccessSink>,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    _config: NamedTempFile,
}

#[allow(dead_code)]
impl TestGateway {
    pub async fn start(config: Value) -> Self {
        let file = write_config(&config);
        let sink = Arc::new(MemoryAccessSink::new());
        let gateway = GatewayLoader::new()
            .with_config_file(file.path().to_str().expect("utf-8 path"))
            .with_access_sink(sink.clone())
            .build()
            .expect("gateway builds");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let (stop, stopped) = oneshot::channel::<()>();
        let serving = gateway.clone();
        let handle = tokio::spawn(async move {
            serving
                .serve_with_shutdown(listener, async {
                    let _ = stopped.await;
                })
                .await
                .expect("serve");
        });

        Self {
            addr,
            gateway,
            sink,
            stop,
            handle,
            _config: file,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        let _ = self.handle.await;
    }
}

/// An address nothing listens on.
#[allow(dead_code)]
pub fn closed_port_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    format!("http://127.0.0.1:{port}")
}
