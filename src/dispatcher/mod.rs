//! Dispatcher contracts shared by pools, interceptors and the HTTP client.
//!
//! # Responsibilities
//! - Define the `Dispatcher` capability every layer implements
//! - Define the handler callbacks a request's outcome is reported through
//! - Compose interceptors with `tower::Layer`
//!
//! # Data Flow
//! ```text
//! caller -> Retry -> CircuitBreaker -> Pool -> member Dispatcher -> wire
//!                                        |
//!                                        +-> Queue (when every member is busy)
//! ```
//!
//! # Design Decisions
//! - `dispatch` always takes ownership of the handler; `false` means queued
//!   or already settled with an error, never "dropped"
//! - `offer` is the non-queueing form used by pools: a refused request is
//!   handed back, and the drain waiter is notified once capacity returns

mod events;
mod handler;
mod request;
mod signal;

pub use events::{DispatcherEvent, DispatcherId, DispatcherListener, Listeners, SubscriptionId};
pub use handler::{AbortHandle, DispatchHandler, ResumeHandle};
pub use request::{DispatchOptions, DispatchRequest};
pub use signal::{AbortListenerId, AbortSignal};

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::error::{DispatchError, DispatchResult};

/// Callback notified once when a busy dispatcher drains (or is destroyed).
pub struct DrainWaiter {
    inner: Box<dyn FnOnce(Option<DispatchError>) + Send>,
}

impl DrainWaiter {
    pub fn new<F>(waiter: F) -> Self
    where
        F: FnOnce(Option<DispatchError>) + Send + 'static,
    {
        Self { inner: Box::new(waiter) }
    }

    /// `None` on drain, `Some(err)` when the dispatcher was destroyed.
    pub fn notify(self, err: Option<DispatchError>) {
        (self.inner)(err)
    }
}

impl fmt::Debug for DrainWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DrainWaiter")
    }
}

/// Point-in-time aggregate counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Members (or sockets) with an established connection.
    pub connected: usize,
    /// Members with spare capacity.
    pub free: usize,
    /// Requests accepted but not yet started by a member.
    pub pending: usize,
    /// Requests waiting in a pool queue.
    pub queued: usize,
    /// Requests currently on the wire.
    pub running: usize,
    /// Every request the dispatcher is responsible for.
    pub size: usize,
}

impl std::ops::Add for DispatcherStats {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            connected: self.connected + other.connected,
            free: self.free + other.free,
            pending: self.pending + other.pending,
            queued: self.queued + other.queued,
            running: self.running + other.running,
            size: self.size + other.size,
        }
    }
}

impl std::iter::Sum for DispatcherStats {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |acc, stats| acc + stats)
    }
}

/// The capability to carry requests to an origin.
pub trait Dispatcher: Send + Sync {
    fn id(&self) -> DispatcherId;

    /// Hand a request over. Returns `true` when it started immediately and
    /// `false` when it was queued or settled through `handler.on_error`.
    fn dispatch(&self, options: DispatchOptions, handler: Box<dyn DispatchHandler>) -> bool;

    /// Start the request now or hand it back. A refused request leaves
    /// `waiter` registered until the next drain.
    fn offer(
        &self,
        options: DispatchOptions,
        handler: Box<dyn DispatchHandler>,
        waiter: Option<DrainWaiter>,
    ) -> Result<(), DispatchRequest> {
        drop(waiter);
        self.dispatch(options, handler);
        Ok(())
    }

    /// Stop taking work and resolve once every accepted request settled.
    fn close(&self) -> BoxFuture<'static, DispatchResult<()>>;

    /// Fail all outstanding work with `err` (default `Destroyed`).
    fn destroy(&self, err: Option<DispatchError>) -> BoxFuture<'static, ()>;

    fn subscribe(&self, listener: Arc<dyn DispatcherListener>) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    fn stats(&self) -> DispatcherStats;

    /// `true` when another request would not start immediately.
    fn is_busy(&self) -> bool {
        false
    }

    fn is_closed(&self) -> bool;

    fn is_destroyed(&self) -> bool;
}

impl<D: Dispatcher + ?Sized> Dispatcher for Arc<D> {
    fn id(&self) -> DispatcherId {
        (**self).id()
    }

    fn dispatch(&self, options: DispatchOptions, handler: Box<dyn DispatchHandler>) -> bool {
        (**self).dispatch(options, handler)
    }

    fn offer(
        &self,
        options: DispatchOptions,
        handler: Box<dyn DispatchHandler>,
        waiter: Option<DrainWaiter>,
    ) -> Result<(), DispatchRequest> {
        (**self).offer(options, handler, waiter)
    }

    fn close(&self) -> BoxFuture<'static, DispatchResult<()>> {
        (**self).close()
    }

    fn destroy(&self, err: Option<DispatchError>) -> BoxFuture<'static, ()> {
        (**self).destroy(err)
    }

    fn subscribe(&self, listener: Arc<dyn DispatcherListener>) -> SubscriptionId {
        (**self).subscribe(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        (**self).unsubscribe(id)
    }

    fn stats(&self) -> DispatcherStats {
        (**self).stats()
    }

    fn is_busy(&self) -> bool {
        (**self).is_busy()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }

    fn is_destroyed(&self) -> bool {
        (**self).is_destroyed()
    }
}

/// Interceptor composition.
pub trait DispatcherExt: Dispatcher + Sized {
    /// Wrap `self` with an interceptor layer.
    fn layer<L: tower::Layer<Self>>(self, layer: L) -> L::Service {
        layer.layer(self)
    }

    fn boxed(self) -> Arc<dyn Dispatcher>
    where
        Self: 'static,
    {
        Arc::new(self)
    }
}

impl<D: Dispatcher + Sized> DispatcherExt for D {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_sum() {
        let a = DispatcherStats {
            connected: 1,
            free: 1,
            pending: 0,
            queued: 0,
            running: 1,
            size: 1,
        };
        let total: DispatcherStats = vec![a, a, DispatcherStats::default()].into_iter().sum();
        assert_eq!(total.connected, 2);
        assert_eq!(total.size, 2);
        assert_eq!(total.queued, 0);
    }

    #[test]
    fn test_drain_waiter_notified_with_error() {
        let (tx, rx) = std::sync::mpsc::channel();
        let waiter = DrainWaiter::new(move |err| {
            tx.send(err.map(|e| e.code())).ok();
        });
        waiter.notify(Some(DispatchError::Destroyed));
        assert_eq!(rx.recv().ok().flatten(), Some("UND_ERR_DESTROYED"));
    }
}
