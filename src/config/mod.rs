//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → DispatchConfig (validated, immutable)
//!     → schema.rs conversions into pool / breaker / retry options
//!     → lifecycle::startup builds the dispatcher stack
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a new stack
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    BalancerConfig, CircuitBreakerConfig, DispatchConfig, ObservabilityConfig, PoolConfig, RetryConfig,
};
pub use validation::{validate_config, ValidationError};
