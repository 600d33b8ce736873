//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber once at startup
//! - Pick a sensible default filter when the environment gives none
//!
//! # Design Decisions
//! - `RUST_LOG` takes precedence when set
//! - `DEBUG=1` raises the default to debug without touching `RUST_LOG`

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global tracing subscriber.
pub fn init() {
    let default_filter = if std::env::var("DEBUG").map(|v| v == "1").unwrap_or(false) {
        "warp_tunnel=debug,tower_http=debug"
    } else {
        "warp_tunnel=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
