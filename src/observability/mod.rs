//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Pools, interceptors and the HTTP client produce:
//!     → tracing events (structured key/value fields)
//!     → metrics.rs (counters and gauges through the `metrics` facade)
//!
//! Consumers:
//!     → logging.rs installs a subscriber (stdout)
//!     → The embedding application installs a metrics exporter
//! ```
//!
//! # Design Decisions
//! - Debug level for per-request routing, info for lifecycle, warn for
//!   circuit opening, weight penalties and retries
//! - Metrics are cheap no-ops until a recorder is installed

pub mod logging;
pub mod metrics;
