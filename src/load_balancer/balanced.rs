//! Balanced pool: adaptive weighted round-robin across upstream origins.
//!
//! # Selection
//! ```text
//! plan():
//!     no upstreams            → MissingUpstream
//!     every weight 0          → reset all to max_weight_per_server
//!     cyclic scan after the last selected upstream, weight > 0 only
//!     stable sort by weight descending (cyclic order breaks ties)
//!
//! accepted by upstream i      → weight(i) -= 1
//! every upstreams.len() picks → weight += recovery_step for all (capped)
//! connection error on i       → weight(i) -= error_penalty (floored at 0)
//! ```

use std::fmt;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};

use crate::dispatcher::{Dispatcher, DispatcherId};
use crate::error::{DispatchError, DispatchResult};
use crate::load_balancer::pool::{Candidate, PoolBase, PoolOptions, PoolStrategy};
use crate::load_balancer::round_robin::RoundRobinPool;
use crate::load_balancer::upstream::{normalize_origin, Upstream};
use crate::observability::metrics;

/// Creates the member dispatcher for one upstream origin.
pub type UpstreamFactory = Arc<dyn Fn(&str, &PoolOptions) -> DispatchResult<Arc<dyn Dispatcher>> + Send + Sync>;

#[derive(Clone)]
pub struct BalancedPoolOptions {
    /// Starting and maximum weight of every upstream.
    pub max_weight_per_server: u32,
    /// Weight removed by one connection-level error.
    pub error_penalty: u32,
    /// Weight restored to every upstream after each full pass.
    pub recovery_step: u32,
    /// Options for the per-upstream pools.
    pub pool: PoolOptions,
    /// Upstream member factory; defaults to one `RoundRobinPool` per origin.
    pub factory: Option<UpstreamFactory>,
}

impl Default for BalancedPoolOptions {
    fn default() -> Self {
        Self {
            max_weight_per_server: 100,
            error_penalty: 15,
            recovery_step: 1,
            pool: PoolOptions::default(),
            factory: None,
        }
    }
}

impl fmt::Debug for BalancedPoolOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BalancedPoolOptions")
            .field("max_weight_per_server", &self.max_weight_per_server)
            .field("error_penalty", &self.error_penalty)
            .field("recovery_step", &self.recovery_step)
            .field("pool", &self.pool)
            .field("factory", &self.factory.as_ref().map(|_| "custom"))
            .finish()
    }
}

/// Factory building a `RoundRobinPool` per upstream.
pub fn round_robin_factory() -> UpstreamFactory {
    Arc::new(|origin: &str, options: &PoolOptions| {
        let pool: Arc<dyn Dispatcher> = RoundRobinPool::new(origin, options.clone())?;
        Ok(pool)
    })
}

/// Adaptive weighted round-robin over upstreams.
pub struct Weighted {
    upstreams: Vec<Upstream>,
    max_weight: u32,
    error_penalty: u32,
    recovery_step: u32,
    /// Index of the last selected upstream.
    last: Option<usize>,
    picks_in_pass: usize,
    factory: UpstreamFactory,
    pool: PoolOptions,
}

impl Weighted {
    fn new(options: BalancedPoolOptions) -> Self {
        Self {
            upstreams: Vec::new(),
            max_weight: options.max_weight_per_server,
            error_penalty: options.error_penalty,
            recovery_step: options.recovery_step,
            last: None,
            picks_in_pass: 0,
            factory: options.factory.unwrap_or_else(round_robin_factory),
            pool: options.pool,
        }
    }

    fn index_of(&self, member: DispatcherId) -> Option<usize> {
        self.upstreams.iter().position(|u| u.member == member)
    }

    fn contains(&self, origin: &str) -> bool {
        self.upstreams.iter().any(|u| u.origin == origin)
    }

    fn insert(&mut self, origin: String, member: DispatcherId) -> bool {
        if self.contains(&origin) {
            return false;
        }
        metrics::record_upstream_weight(&origin, self.max_weight);
        self.upstreams.push(Upstream::new(origin, member, self.max_weight));
        true
    }
}

impl PoolStrategy for Weighted {
    fn plan(&mut self) -> DispatchResult<Vec<Candidate>> {
        let len = self.upstreams.len();
        if len == 0 {
            return Err(DispatchError::MissingUpstream);
        }

        if self.upstreams.iter().all(|u| !u.is_selectable()) {
            tracing::debug!(upstreams = len, "All upstream weights exhausted, resetting");
            self.upstreams.iter_mut().for_each(Upstream::reset);
        }

        let start = self.last.map_or(0, |last| (last + 1) % len);
        let mut order: Vec<usize> = (0..len)
            .map(|i| (start + i) % len)
            .filter(|&i| self.upstreams[i].is_selectable())
            .collect();
        order.sort_by(|a, b| self.upstreams[*b].current_weight.cmp(&self.upstreams[*a].current_weight));

        Ok(order
            .into_iter()
            .map(|i| Candidate::Member(self.upstreams[i].member))
            .collect())
    }

    fn on_accepted(&mut self, member: DispatcherId) {
        let Some(index) = self.index_of(member) else {
            return;
        };
        self.upstreams[index].consume();
        self.last = Some(index);

        self.picks_in_pass += 1;
        if self.picks_in_pass >= self.upstreams.len() {
            self.picks_in_pass = 0;
            let step = self.recovery_step;
            self.upstreams.iter_mut().for_each(|u| u.recover(step));
        }
    }

    fn on_connection_error(&mut self, member: DispatcherId, err: &DispatchError) {
        let Some(index) = self.index_of(member) else {
            return;
        };
        let upstream = &mut self.upstreams[index];
        upstream.penalize(self.error_penalty);
        tracing::warn!(
            origin = %upstream.origin,
            weight = upstream.current_weight,
            error = %err,
            "Upstream penalized after connection error"
        );
        metrics::record_upstream_weight(&upstream.origin, upstream.current_weight);
    }

    fn on_member_removed(&mut self, member: DispatcherId) {
        let Some(index) = self.index_of(member) else {
            return;
        };
        self.upstreams.remove(index);
        self.last = match self.last {
            Some(last) if last > index => Some(last - 1),
            Some(last) if last == index => index.checked_sub(1),
            other => other,
        };
        if self.picks_in_pass >= self.upstreams.len() {
            self.picks_in_pass = 0;
        }
    }
}

/// Pool spreading requests across upstream origins by adaptive weight.
pub type BalancedPool = PoolBase<Weighted>;

impl PoolBase<Weighted> {
    /// Create a balanced pool over `upstreams` (may be empty).
    pub fn new<I, U>(upstreams: I, options: BalancedPoolOptions) -> DispatchResult<Arc<Self>>
    where
        I: IntoIterator<Item = U>,
        U: AsRef<str>,
    {
        if options.max_weight_per_server == 0 {
            return Err(DispatchError::InvalidArgument(
                "max_weight_per_server must be greater than 0".into(),
            ));
        }
        if options.pool.connections == 0 {
            return Err(DispatchError::InvalidArgument(
                "connections must be greater than 0".into(),
            ));
        }

        let pool = PoolBase::with_strategy("balanced", Weighted::new(options));
        for upstream in upstreams {
            pool.add_upstream(upstream.as_ref())?;
        }
        Ok(pool)
    }

    /// Add an upstream origin. Adding a known origin is a no-op.
    pub fn add_upstream(&self, origin: &str) -> DispatchResult<()> {
        let origin = normalize_origin(origin)?;
        let build = self.with_strategy_mut(|strategy| {
            (!strategy.contains(&origin)).then(|| (Arc::clone(&strategy.factory), strategy.pool.clone()))
        });
        let Some((factory, pool_options)) = build else {
            return Ok(());
        };

        let member = factory(&origin, &pool_options)?;
        let key = origin.clone();
        if self.add_member(member, move |strategy, id| strategy.insert(key, id))?.is_some() {
            tracing::info!(origin = %origin, "Upstream added");
        }
        Ok(())
    }

    /// Remove an upstream origin: it leaves selection at once and its member
    /// is closed gracefully. Removing an unknown origin is a no-op.
    pub fn remove_upstream(&self, origin: &str) -> BoxFuture<'static, DispatchResult<()>> {
        let origin = match normalize_origin(origin) {
            Ok(origin) => origin,
            Err(err) => return future::ready(Err(err)).boxed(),
        };
        let member = self.with_strategy_mut(|strategy| {
            strategy
                .upstreams
                .iter()
                .find(|u| u.origin == origin)
                .map(|u| u.member)
        });
        let Some(member) = member else {
            return future::ready(Ok(())).boxed();
        };

        tracing::info!(origin = %origin, "Upstream removed");
        self.remove_member(member).map(Ok).boxed()
    }

    /// Origins currently taking part in selection.
    pub fn upstreams(&self) -> Vec<String> {
        self.with_strategy_mut(|strategy| strategy.upstreams.iter().map(|u| u.origin.clone()).collect())
    }

    /// `(origin, current_weight)` for every upstream.
    pub fn upstream_weights(&self) -> Vec<(String, u32)> {
        self.with_strategy_mut(|strategy| {
            strategy
                .upstreams
                .iter()
                .map(|u| (u.origin.clone(), u.current_weight))
                .collect()
        })
    }
}
