//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Config → Logging → BalancedPool → CircuitBreaker → Retry
//!
//! Shutdown (shutdown.rs):
//!     close() → wait for queued and in-flight work → members closed
//!     grace elapsed → destroy() → outstanding handlers fail
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then pool, then interceptors
//! - Shutdown has timeout: forced destroy after deadline

pub mod shutdown;
pub mod startup;

pub use shutdown::{shutdown, ShutdownOutcome};
pub use startup::{build_stack, start, DispatchStack};
