//! Upstream abstraction.
//!
//! # Responsibilities
//! - Represent a single origin a balanced pool routes to
//! - Track its adaptive weight (selection cost, failure penalty, recovery)
//! - Normalize origin strings so set operations are idempotent

use url::Url;

use crate::dispatcher::DispatcherId;
use crate::error::{DispatchError, DispatchResult};

/// Normalize `origin` to `scheme://host[:port]`, dropping default ports,
/// paths and trailing slashes.
pub fn normalize_origin(origin: &str) -> DispatchResult<String> {
    let url = Url::parse(origin)
        .map_err(|e| DispatchError::InvalidArgument(format!("invalid origin {origin:?}: {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(DispatchError::InvalidArgument(format!(
                "unsupported scheme {other:?} in origin {origin:?}"
            )))
        }
    }
    if url.host_str().is_none() {
        return Err(DispatchError::InvalidArgument(format!("origin {origin:?} has no host")));
    }

    Ok(url.origin().ascii_serialization())
}

/// A single upstream origin of a balanced pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    /// Normalized origin.
    pub origin: String,
    /// Member dispatcher serving this origin.
    pub member: DispatcherId,
    /// Current weight, in `[0, max_weight]`.
    pub current_weight: u32,
    pub max_weight: u32,
}

impl Upstream {
    /// Create an upstream at full weight.
    pub fn new(origin: String, member: DispatcherId, max_weight: u32) -> Self {
        Self {
            origin,
            member,
            current_weight: max_weight,
            max_weight,
        }
    }

    /// Weight 0 takes the upstream out of selection until it recovers.
    pub fn is_selectable(&self) -> bool {
        self.current_weight > 0
    }

    /// Charge one unit for a successful selection.
    pub fn consume(&mut self) {
        self.current_weight = self.current_weight.saturating_sub(1);
    }

    /// Apply a connection-error penalty.
    pub fn penalize(&mut self, penalty: u32) {
        self.current_weight = self.current_weight.saturating_sub(penalty);
    }

    /// Add `step`, capped at the maximum.
    pub fn recover(&mut self, step: u32) {
        self.current_weight = self.current_weight.saturating_add(step).min(self.max_weight);
    }

    pub fn reset(&mut self) {
        self.current_weight = self.max_weight;
    }
}
