//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the `tracing` subscriber for applications embedding the crate
//! - Resolve the log filter from `RUST_LOG`, falling back to configuration
//!
//! # Design Decisions
//! - Library code only emits events; installing a subscriber is opt-in
//! - `try_init` so tests and embedding applications may call it more than once

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when neither `RUST_LOG` nor configuration provide one.
pub const DEFAULT_FILTER: &str = "dispatch_resilience=info";

/// Install a registry with an env filter and fmt layer.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init(fallback_level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback_filter(fallback_level)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

/// Expand a bare level (`debug`) into a crate-scoped directive.
fn fallback_filter(level: &str) -> String {
    let level = level.trim();
    if level.is_empty() {
        return DEFAULT_FILTER.to_string();
    }
    if level.contains('=') || level.contains(',') {
        level.to_string()
    } else {
        format!("dispatch_resilience={level}")
    }
}
