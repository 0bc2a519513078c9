//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! dispatch(options, handler)
//!     → pool.rs (PoolBase: ask the strategy for candidates, offer in order)
//!         - round_robin.rs (N connections to one origin, rotating)
//!         - balanced.rs (weighted round-robin across upstream origins)
//!     → every candidate busy: queue.rs (FIFO until a member drains)
//!     → member drain: replay queued requests onto that member
//! ```
//!
//! # Design Decisions
//! - One generic pool owns queue, drain and lifecycle; strategies only order members
//! - Members are plain `Dispatcher`s, so pools nest (balanced over round-robin)
//! - Upstream weights react to connection errors, never to response statuses

pub mod balanced;
pub mod pool;
pub mod queue;
pub mod round_robin;
pub mod upstream;

pub use balanced::{round_robin_factory, BalancedPool, BalancedPoolOptions, UpstreamFactory, Weighted};
pub use pool::{Candidate, MemberFactory, PoolBase, PoolOptions, PoolStrategy, Spawn};
pub use queue::Queue;
pub use round_robin::{http_client_factory, RoundRobin, RoundRobinPool};
pub use upstream::normalize_origin;
