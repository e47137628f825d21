//! webshell-gateway - bridges browser terminals to remote SSH shells
//!
//! A client opens a WebSocket, sends one JSON connection descriptor, and from
//! then on exchanges raw terminal text with an interactive shell on the host
//! it named.

// Use mimalloc as the global allocator for better performance
// with high-frequency small allocations (WebSocket frames, shell output chunks)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod bridge;
pub mod cli;
pub mod config;
pub mod session;
pub mod ssh;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging (`RUST_LOG`, default `info`)
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
