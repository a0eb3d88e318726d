//! # maskweb-client
//!
//! Multi-server chat client core: the per-server entity that ties a session
//! to its messaging channel and message log, the registry of known servers,
//! and the active-server pointer used for unread accounting.

pub mod active;
pub mod config;
pub mod merge;
pub mod registry;
pub mod server;

mod error;

#[cfg(test)]
mod testing;

pub use active::ActiveServer;
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use merge::{merge_log, summarize, LogSummary};
pub use registry::Registry;
pub use server::{Server, ServerContext, ServerState};

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. Honours `RUST_LOG`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("maskweb_client=debug,maskweb_net=debug,maskweb_store=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
