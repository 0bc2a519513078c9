//! HTTP transport subsystem.
//!
//! # Data Flow
//! ```text
//! Pool member slot
//!     → client.rs (HttpClient: pipelining limit, timeouts, events)
//!     → hyper-util legacy client (connection pooling, HTTP/1.1 wire)
//!     → origin server
//! ```

pub mod client;

pub use client::{ClientOptions, HttpClient};
