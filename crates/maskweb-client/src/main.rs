//! Headless client: restores the server registry, connects every server and
//! keeps the registry persisted until interrupted.
//!
//! Extra command-line arguments are server base addresses to register.

use std::time::Duration;

use maskweb_client::{ClientConfig, Registry, Server};
use tracing::{info, warn};

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    maskweb_client::init_tracing();

    info!("Starting maskweb client v{}", env!("CARGO_PKG_VERSION"));

    let config = ClientConfig::from_env();
    info!(?config, "Loaded configuration");

    let registry = Registry::init(&config)?;
    for address in std::env::args().skip(1) {
        let server = registry.add_address(&address)?;
        info!(server = %server.base_url(), "server registered");
    }

    if registry.is_empty() {
        warn!("No servers registered; pass a base address or set MASKWEB_DEFAULT_SERVER");
    }

    for server in registry.servers() {
        tokio::spawn(bring_up(server));
    }

    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => report(&registry),
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }

    info!("Shutting down");
    for server in registry.servers() {
        server.disconnect();
    }
    registry.persist_now();
    Ok(())
}

async fn bring_up(server: Server) {
    if let Err(e) = server.init_server().await {
        warn!(server = %server.base_url(), error = %e, "server initialisation failed");
        return;
    }
    match server.wait_settled().await {
        Ok(()) => info!(server = %server.base_url(), "server connected"),
        Err(e) => warn!(server = %server.base_url(), error = %e, "server not connected"),
    }
}

fn report(registry: &Registry) {
    for server in registry.servers() {
        let state = server.snapshot();
        let status = server.status();
        info!(
            server = %state.base_url,
            title = %state.title,
            state = ?status.state,
            unread = state.unread_count,
            latest = %state.preview,
            status = %status.error_message,
            "server status"
        );
    }
}
