// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Minimal CLI wrapper so the library can run as a stand-alone gateway.
//!
//!  Build it with `cargo build --release --bin portcullis`
//!  The binary honours PORTCULLIS_CONFIG_FILE or falls back to
//!  /etc/portcullis/config.toml.  SIGHUP reloads routes and upstreams.

use std::env;
use std::error::Error;

use portcullis::{Gateway, GatewayLoader, error_fmt, info_fmt};

const FALLBACK_CONFIG: &str = "/etc/portcullis/config.toml";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let path = match env::var("PORTCULLIS_CONFIG_FILE") {
        Ok(path) => path,
        Err(_) => {
            if !std::path::Path::new(FALLBACK_CONFIG).exists() {
                eprintln!(
                    "No PORTCULLIS_CONFIG_FILE set and {FALLBACK_CONFIG} does not exist"
                );
                return Err(Box::from("No configuration file found."));
            }
            FALLBACK_CONFIG.to_string()
        }
    };

    let gateway = match GatewayLoader::new()
        .with_config_file(&path)
        .with_env_vars()
        .build()
    {
        Ok(gateway) => gateway,
        Err(e) => {
            eprintln!("Failed to build gateway: {e}");
            return Err(e.into());
        }
    };
    info_fmt!("Portcullis", "Using configuration from {}", path);

    #[cfg(unix)]
    spawn_reload_on_hangup(gateway.clone())?;

    match gateway.start().await {
        Ok(()) => {
            info_fmt!("Portcullis", "Gateway stopped gracefully");
            Ok(())
        }
        Err(e) => {
            error_fmt!("Portcullis", "Gateway failed: {}", e);
            Err(e.into())
        }
    }
}

#[cfg(unix)]
fn spawn_reload_on_hangup(gateway: Gateway) -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match gateway.reload_from_sources() {
                Ok(generation) => {
                    info_fmt!("Portcullis", "Reloaded configuration, generation {}", generation)
                }
                Err(e) => error_fmt!("Portcullis", "Reload failed, keeping current routes: {}", e),
            }
        }
    });
    Ok(())
}
