//! Pool base shared by every pooled dispatcher.
//!
//! # Responsibilities
//! - Own the member dispatchers and subscribe to their lifecycle events
//! - Route requests to members in the order chosen by a `PoolStrategy`
//! - Queue requests when every member is busy and replay them on drain
//! - Graceful close and terminal destroy
//!
//! # Data Flow
//! ```text
//! dispatch(options, handler)
//!     → strategy.plan() (candidate members, in order)
//!     → member.offer() for each candidate until one accepts
//!     → none accepted: Queue.push, need_drain = true
//!
//! member emits drain
//!     → MemberListener → on_member_drain(member)
//!     → Queue.shift → member.offer (repeat while it accepts)
//!     → queue empty: flush drain waiters, emit pool drain, release close
//! ```
//!
//! # Design Decisions
//! - One mutex around the whole pool state; it is never held while calling a
//!   member, a handler, a listener or a waiter
//! - A drain epoch lets a dispatch that raced a drain re-run selection
//!   instead of parking its request behind a member that is already idle
//! - Members are subscribed through an explicit context struct holding a
//!   weak pool reference, so dropping the pool breaks the cycle

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures_util::future::{self, BoxFuture, FutureExt};
use tokio::sync::oneshot;

use crate::dispatcher::{
    AbortListenerId, DispatchHandler, DispatchOptions, DispatchRequest, Dispatcher, DispatcherEvent,
    DispatcherId, DispatcherListener, DispatcherStats, DrainWaiter, Listeners, SubscriptionId,
};
use crate::error::{DispatchError, DispatchResult};
use crate::http::ClientOptions;
use crate::load_balancer::queue::Queue;
use crate::observability::metrics::{self, DispatchOutcome};

const ERR_POISONED_POOL: &str = "pool state mutex poisoned";

/// Creates the member dispatcher for one origin.
pub type MemberFactory =
    Arc<dyn Fn(&str, &ClientOptions) -> DispatchResult<Arc<dyn Dispatcher>> + Send + Sync>;

/// Deferred member construction for a vacant slot.
pub type Spawn = Box<dyn FnOnce() -> DispatchResult<Arc<dyn Dispatcher>> + Send>;

/// Options shared by pools of leaf connections.
#[derive(Clone)]
pub struct PoolOptions {
    /// Number of member connections per origin.
    pub connections: usize,
    /// Options handed to the factory for every member.
    pub client: ClientOptions,
    /// Member factory; defaults to `HttpClient`.
    pub factory: Option<MemberFactory>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            connections: 10,
            client: ClientOptions::default(),
            factory: None,
        }
    }
}

impl fmt::Debug for PoolOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolOptions")
            .field("connections", &self.connections)
            .field("client", &self.client)
            .field("factory", &self.factory.as_ref().map(|_| "custom"))
            .finish()
    }
}

/// One entry of a strategy's candidate order.
pub enum Candidate {
    /// An existing member.
    Member(DispatcherId),
    /// A slot whose member has not been created yet.
    Vacant { slot: usize, spawn: Spawn },
}

/// Member selection policy plugged into `PoolBase`.
///
/// Every method runs under the pool lock and must not block.
pub trait PoolStrategy: Send + 'static {
    /// Candidates for the next dispatch, best first.
    fn plan(&mut self) -> DispatchResult<Vec<Candidate>>;

    /// Record that `member` now occupies `slot`. Returns `false` when the
    /// slot was filled concurrently.
    fn fill(&mut self, _slot: usize, _member: DispatcherId) -> bool {
        false
    }

    /// `true` while some slot still has no member.
    fn has_vacancy(&self) -> bool {
        false
    }

    /// A routed dispatch was accepted by `member`.
    fn on_accepted(&mut self, _member: DispatcherId) {}

    /// `member` reported a connection-level failure.
    fn on_connection_error(&mut self, _member: DispatcherId, _err: &DispatchError) {}

    /// `member` left candidate selection.
    fn on_member_removed(&mut self, _member: DispatcherId) {}
}

struct Member {
    id: DispatcherId,
    dispatcher: Arc<dyn Dispatcher>,
    subscription: SubscriptionId,
    /// Closing asynchronously; excluded from selection and drain replay.
    removing: bool,
}

struct Queued {
    id: u64,
    request: DispatchRequest,
}

struct PoolState<S> {
    strategy: S,
    members: Vec<Member>,
    queue: Queue<Queued>,
    /// Abort listener per queued request, `None` until registered.
    abort_listeners: HashMap<u64, Option<AbortListenerId>>,
    next_queued_id: u64,
    need_drain: bool,
    drain_waiters: Vec<DrainWaiter>,
    closed: bool,
    destroyed: bool,
    close_waiters: Vec<oneshot::Sender<()>>,
    /// Bumped on every member drain.
    epoch: u64,
}

impl<S> PoolState<S> {
    fn active_member(&self, id: DispatcherId) -> Option<Arc<dyn Dispatcher>> {
        self.members
            .iter()
            .find(|m| m.id == id && !m.removing)
            .map(|m| Arc::clone(&m.dispatcher))
    }

    fn active_members(&self) -> Vec<Arc<dyn Dispatcher>> {
        self.members
            .iter()
            .filter(|m| !m.removing)
            .map(|m| Arc::clone(&m.dispatcher))
            .collect()
    }
}

enum Target {
    Member(DispatcherId, Arc<dyn Dispatcher>),
    Vacant { slot: usize, spawn: Spawn },
}

enum Routed {
    Accepted(DispatcherId),
    Refused(DispatchRequest),
    Failed(DispatchRequest, DispatchError),
}

enum Enqueued {
    Queued(usize),
    /// A member drained while the request was being routed.
    Rerun(DispatchRequest),
    Rejected(DispatchRequest, DispatchError),
}

/// Queue, drain and lifecycle machinery parameterized by a selection strategy.
pub struct PoolBase<S: PoolStrategy> {
    id: DispatcherId,
    /// Label used in logs and metrics.
    name: String,
    this: Weak<PoolBase<S>>,
    state: Mutex<PoolState<S>>,
    listeners: Listeners,
}

impl<S: PoolStrategy> PoolBase<S> {
    pub(crate) fn with_strategy(name: impl Into<String>, strategy: S) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|this| PoolBase {
            id: DispatcherId::new(),
            name,
            this: this.clone(),
            state: Mutex::new(PoolState {
                strategy,
                members: Vec::new(),
                queue: Queue::new(),
                abort_listeners: HashMap::new(),
                next_queued_id: 0,
                need_drain: false,
                drain_waiters: Vec::new(),
                closed: false,
                destroyed: false,
                close_waiters: Vec::new(),
                epoch: 0,
            }),
            listeners: Listeners::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<S>> {
        self.state.lock().expect(ERR_POISONED_POOL)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests waiting for a member.
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// Run `f` against the strategy under the pool lock.
    pub(crate) fn with_strategy_mut<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.lock().strategy)
    }

    /// Member dispatchers currently taking part in selection.
    pub fn members(&self) -> Vec<Arc<dyn Dispatcher>> {
        self.lock().active_members()
    }

    fn member_listener(&self, member: DispatcherId) -> Arc<dyn DispatcherListener> {
        Arc::new(MemberListener {
            pool: self.this.clone(),
            member,
        })
    }

    /// Subscribe to `dispatcher` and add it to the member set.
    ///
    /// `register` records the member in the strategy under the same lock;
    /// when it declines (a concurrent insert won) the member is dropped and
    /// `Ok(None)` is returned.
    pub(crate) fn add_member<F>(&self, dispatcher: Arc<dyn Dispatcher>, register: F) -> DispatchResult<Option<DispatcherId>>
    where
        F: FnOnce(&mut S, DispatcherId) -> bool,
    {
        let id = dispatcher.id();
        let subscription = dispatcher.subscribe(self.member_listener(id));

        let mut state = self.lock();
        let outcome = if state.destroyed {
            Err(DispatchError::Destroyed)
        } else if register(&mut state.strategy, id) {
            Ok(Some(id))
        } else {
            Ok(None)
        };
        if let Ok(Some(_)) = outcome {
            state.members.push(Member {
                id,
                dispatcher,
                subscription,
                removing: false,
            });
            return outcome;
        }
        drop(state);

        dispatcher.unsubscribe(subscription);
        outcome
    }

    /// Take a member out of selection, close it, then forget it.
    pub(crate) fn remove_member(&self, id: DispatcherId) -> BoxFuture<'static, ()> {
        let removed = {
            let mut state = self.lock();
            state.strategy.on_member_removed(id);
            state
                .members
                .iter_mut()
                .find(|m| m.id == id && !m.removing)
                .map(|m| {
                    m.removing = true;
                    (Arc::clone(&m.dispatcher), m.subscription)
                })
        };
        let Some((dispatcher, subscription)) = removed else {
            return future::ready(()).boxed();
        };

        dispatcher.unsubscribe(subscription);
        tracing::info!(pool = %self.name, member = %id, "Removing pool member");
        let closing = dispatcher.close();
        let pool = self.this.clone();

        async move {
            if let Err(err) = closing.await {
                tracing::debug!(member = %id, error = %err, "Member close failed");
            }
            let Some(pool) = pool.upgrade() else {
                return;
            };
            let remaining = {
                let mut state = pool.lock();
                state.members.retain(|m| m.id != id);
                state.active_members()
            };
            let need_drain = remaining
                .iter()
                .any(|m| !m.is_closed() && !m.is_destroyed() && !m.is_busy());
            pool.lock().need_drain = need_drain;
        }
        .boxed()
    }

    fn ensure_open(&self) -> DispatchResult<()> {
        let state = self.lock();
        if state.destroyed {
            Err(DispatchError::Destroyed)
        } else if state.closed {
            Err(DispatchError::Closed)
        } else {
            Ok(())
        }
    }

    /// Try the strategy's candidates in order.
    fn route(&self, mut request: DispatchRequest) -> Routed {
        let targets: Vec<Target> = {
            let mut state = self.lock();
            let plan = match state.strategy.plan() {
                Ok(plan) => plan,
                Err(err) => return Routed::Failed(request, err),
            };
            plan.into_iter()
                .filter_map(|candidate| match candidate {
                    Candidate::Member(id) => state.active_member(id).map(|d| Target::Member(id, d)),
                    Candidate::Vacant { slot, spawn } => Some(Target::Vacant { slot, spawn }),
                })
                .collect()
        };

        for target in targets {
            let (id, dispatcher) = match target {
                Target::Member(id, dispatcher) => (id, dispatcher),
                Target::Vacant { slot, spawn } => match self.spawn_member(slot, spawn) {
                    Ok(Some(member)) => member,
                    Ok(None) => continue,
                    Err(err) => return Routed::Failed(request, err),
                },
            };

            let DispatchRequest { options, handler } = request;
            match dispatcher.offer(options, handler, None) {
                Ok(()) => {
                    self.lock().strategy.on_accepted(id);
                    return Routed::Accepted(id);
                }
                Err(refused) => request = refused,
            }
        }

        Routed::Refused(request)
    }

    fn spawn_member(&self, slot: usize, spawn: Spawn) -> DispatchResult<Option<(DispatcherId, Arc<dyn Dispatcher>)>> {
        let dispatcher = spawn()?;
        let added = self.add_member(Arc::clone(&dispatcher), |strategy, id| strategy.fill(slot, id));
        match added {
            Ok(Some(id)) => {
                tracing::debug!(pool = %self.name, member = %id, slot, "Created pool member");
                Ok(Some((id, dispatcher)))
            }
            Ok(None) | Err(DispatchError::Destroyed) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Park a request. `epoch` is the drain epoch observed before routing;
    /// `at_front` puts a replayed request back ahead of later arrivals.
    fn enqueue(&self, request: DispatchRequest, epoch: Option<u64>, at_front: bool) -> Enqueued {
        let signal = request.options.signal.clone();
        let (id, depth) = {
            let mut state = self.lock();
            if state.destroyed {
                return Enqueued::Rejected(request, DispatchError::Destroyed);
            }
            if epoch.is_some_and(|seen| seen != state.epoch) {
                return Enqueued::Rerun(request);
            }
            state.next_queued_id += 1;
            let id = state.next_queued_id;
            if at_front {
                state.queue.unshift(Queued { id, request });
            } else {
                state.queue.push(Queued { id, request });
            }
            state.abort_listeners.insert(id, None);
            state.need_drain = true;
            (id, state.queue.len())
        };
        metrics::record_queue_depth(&self.name, depth);

        if let Some(signal) = signal {
            let pool = self.this.clone();
            let registered = signal.on_abort(move |reason| {
                if let Some(pool) = pool.upgrade() {
                    pool.abort_queued(id, reason);
                }
            });
            if let Some(listener) = registered {
                let stale = {
                    let mut state = self.lock();
                    match state.abort_listeners.get_mut(&id) {
                        Some(slot) => {
                            *slot = Some(listener);
                            false
                        }
                        None => true,
                    }
                };
                if stale {
                    signal.remove(listener);
                }
            }
        }

        Enqueued::Queued(depth)
    }

    fn abort_queued(&self, id: u64, reason: DispatchError) {
        let (removed, close_waiters) = {
            let mut state = self.lock();
            state.abort_listeners.remove(&id);
            let removed = state.queue.remove_first(|queued| queued.id == id);
            let close_waiters = if removed.is_some() && state.closed && state.queue.is_empty() {
                std::mem::take(&mut state.close_waiters)
            } else {
                Vec::new()
            };
            (removed, close_waiters)
        };

        if let Some(mut queued) = removed {
            tracing::debug!(pool = %self.name, "Queued request aborted");
            queued.request.handler.on_error(reason);
        }
        for waiter in close_waiters {
            let _ = waiter.send(());
        }
    }

    /// Replay queued work onto a member that reported spare capacity.
    fn on_member_drain(&self, member_id: DispatcherId, event: &DispatcherEvent) {
        loop {
            let next = {
                let mut state = self.lock();
                state.epoch += 1;
                if state.destroyed {
                    return;
                }
                let Some(member) = state.active_member(member_id) else {
                    break;
                };
                match state.queue.shift() {
                    Some(queued) => {
                        let listener = state.abort_listeners.remove(&queued.id).flatten();
                        Some((member, queued, listener, state.queue.len()))
                    }
                    None => None,
                }
            };
            let Some((member, queued, listener, depth)) = next else {
                break;
            };
            metrics::record_queue_depth(&self.name, depth);

            let DispatchRequest { options, mut handler } = queued.request;
            if let Some(signal) = options.signal.as_ref() {
                if let Some(listener) = listener {
                    signal.remove(listener);
                }
                if let Some(reason) = signal.reason() {
                    handler.on_error(reason);
                    continue;
                }
            }

            match member.offer(options, handler, None) {
                Ok(()) => self.lock().strategy.on_accepted(member_id),
                Err(refused) => {
                    // Lost a race with another dispatcher of the member.
                    if let Enqueued::Rejected(mut request, err) = self.enqueue(refused, None, true) {
                        request.handler.on_error(err);
                    }
                    break;
                }
            }
        }

        let (waiters, emit_drain, close_waiters) = {
            let mut state = self.lock();
            if !state.queue.is_empty() {
                return;
            }
            let waiters = std::mem::take(&mut state.drain_waiters);
            let emit_drain = std::mem::replace(&mut state.need_drain, false);
            let close_waiters = if state.closed {
                std::mem::take(&mut state.close_waiters)
            } else {
                Vec::new()
            };
            (waiters, emit_drain, close_waiters)
        };

        for waiter in waiters {
            waiter.notify(None);
        }
        if emit_drain {
            tracing::debug!(pool = %self.name, member = %member_id, "Pool drained");
            self.listeners.emit(&event.forwarded(self.id));
        }
        for waiter in close_waiters {
            let _ = waiter.send(());
        }
    }

    fn on_member_event(&self, member_id: DispatcherId, event: &DispatcherEvent) {
        match event {
            DispatcherEvent::Drain { .. } => {
                self.on_member_drain(member_id, event);
                return;
            }
            DispatcherEvent::ConnectionError { error, .. } => {
                self.lock().strategy.on_connection_error(member_id, error);
            }
            DispatcherEvent::Disconnect { error, .. } if error.is_connection_error() => {
                self.lock().strategy.on_connection_error(member_id, error);
            }
            _ => {}
        }
        self.listeners.emit(&event.forwarded(self.id));
    }
}

/// Subscription context linking a member back to its pool.
struct MemberListener<S: PoolStrategy> {
    pool: Weak<PoolBase<S>>,
    member: DispatcherId,
}

impl<S: PoolStrategy> DispatcherListener for MemberListener<S> {
    fn on_event(&self, event: &DispatcherEvent) {
        if let Some(pool) = self.pool.upgrade() {
            pool.on_member_event(self.member, event);
        }
    }
}

impl<S: PoolStrategy> Dispatcher for PoolBase<S> {
    fn id(&self) -> DispatcherId {
        self.id
    }

    fn dispatch(&self, options: DispatchOptions, mut handler: Box<dyn DispatchHandler>) -> bool {
        if let Err(err) = self.ensure_open() {
            metrics::record_dispatch(&self.name, DispatchOutcome::Rejected);
            handler.on_error(err);
            return false;
        }
        if let Some(reason) = options.signal.as_ref().and_then(|s| s.reason()) {
            handler.on_error(reason);
            return false;
        }

        let mut request = DispatchRequest::new(options, handler);
        loop {
            let epoch = self.lock().epoch;
            match self.route(request) {
                Routed::Accepted(member) => {
                    tracing::debug!(pool = %self.name, member = %member, "Request dispatched");
                    metrics::record_dispatch(&self.name, DispatchOutcome::Accepted);
                    return true;
                }
                Routed::Failed(mut rejected, err) => {
                    tracing::debug!(pool = %self.name, error = %err, "Dispatch failed");
                    metrics::record_dispatch(&self.name, DispatchOutcome::Rejected);
                    rejected.handler.on_error(err);
                    return false;
                }
                Routed::Refused(refused) => match self.enqueue(refused, Some(epoch), false) {
                    Enqueued::Queued(depth) => {
                        tracing::debug!(pool = %self.name, queued = depth, "All members busy, request queued");
                        metrics::record_dispatch(&self.name, DispatchOutcome::Queued);
                        return false;
                    }
                    Enqueued::Rerun(again) => request = again,
                    Enqueued::Rejected(mut rejected, err) => {
                        metrics::record_dispatch(&self.name, DispatchOutcome::Rejected);
                        rejected.handler.on_error(err);
                        return false;
                    }
                },
            }
        }
    }

    fn offer(
        &self,
        options: DispatchOptions,
        mut handler: Box<dyn DispatchHandler>,
        mut waiter: Option<DrainWaiter>,
    ) -> Result<(), DispatchRequest> {
        if let Err(err) = self.ensure_open() {
            handler.on_error(err);
            return Ok(());
        }

        let mut request = DispatchRequest::new(options, handler);
        loop {
            let epoch = self.lock().epoch;
            match self.route(request) {
                Routed::Accepted(_) => return Ok(()),
                Routed::Failed(mut rejected, err) => {
                    rejected.handler.on_error(err);
                    return Ok(());
                }
                Routed::Refused(refused) => {
                    let mut state = self.lock();
                    if state.destroyed {
                        drop(state);
                        let mut refused = refused;
                        if let Some(waiter) = waiter.take() {
                            waiter.notify(Some(DispatchError::Destroyed));
                        }
                        refused.handler.on_error(DispatchError::Destroyed);
                        return Ok(());
                    }
                    if state.epoch != epoch {
                        drop(state);
                        request = refused;
                        continue;
                    }
                    state.need_drain = true;
                    if let Some(waiter) = waiter.take() {
                        state.drain_waiters.push(waiter);
                    }
                    return Err(refused);
                }
            }
        }
    }

    fn close(&self) -> BoxFuture<'static, DispatchResult<()>> {
        let pending = {
            let mut state = self.lock();
            if state.destroyed {
                return future::ready(Err(DispatchError::Destroyed)).boxed();
            }
            state.closed = true;
            if state.queue.is_empty() {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.close_waiters.push(tx);
                Some((rx, state.queue.len()))
            }
        };
        tracing::info!(
            pool = %self.name,
            queued = pending.as_ref().map_or(0, |(_, queued)| *queued),
            "Closing pool"
        );

        let pool = self.this.clone();
        async move {
            if let Some((rx, _)) = pending {
                let _ = rx.await;
            }
            let Some(pool) = pool.upgrade() else {
                return Ok(());
            };
            let members = {
                let state = pool.lock();
                if state.destroyed {
                    return Ok(());
                }
                state.active_members()
            };
            let results = future::join_all(members.iter().map(|m| m.close())).await;
            tracing::info!(pool = %pool.name, members = members.len(), "Pool closed");
            results.into_iter().collect::<DispatchResult<Vec<()>>>().map(|_| ())
        }
        .boxed()
    }

    fn destroy(&self, err: Option<DispatchError>) -> BoxFuture<'static, ()> {
        let err = err.unwrap_or(DispatchError::Destroyed);
        let (queued, abort_listeners, waiters, close_waiters, members) = {
            let mut state = self.lock();
            if state.destroyed {
                return future::ready(()).boxed();
            }
            state.destroyed = true;
            state.closed = true;
            let queued = state.queue.drain();
            let abort_listeners = std::mem::take(&mut state.abort_listeners);
            let waiters = std::mem::take(&mut state.drain_waiters);
            let close_waiters = std::mem::take(&mut state.close_waiters);
            let members: Vec<_> = state.members.iter().map(|m| Arc::clone(&m.dispatcher)).collect();
            (queued, abort_listeners, waiters, close_waiters, members)
        };
        tracing::info!(pool = %self.name, queued = queued.len(), error = %err, "Destroying pool");
        metrics::record_queue_depth(&self.name, 0);

        for waiter in waiters {
            waiter.notify(Some(err.clone()));
        }
        for mut queued in queued {
            if let (Some(signal), Some(Some(listener))) =
                (queued.request.options.signal.as_ref(), abort_listeners.get(&queued.id))
            {
                signal.remove(*listener);
            }
            queued.request.handler.on_error(err.clone());
        }
        for waiter in close_waiters {
            let _ = waiter.send(());
        }

        let pending: Vec<_> = members.iter().map(|m| m.destroy(Some(err.clone()))).collect();
        async move {
            future::join_all(pending).await;
        }
        .boxed()
    }

    fn subscribe(&self, listener: Arc<dyn DispatcherListener>) -> SubscriptionId {
        self.listeners.subscribe(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    fn stats(&self) -> DispatcherStats {
        let (queued, members) = {
            let state = self.lock();
            let members: Vec<_> = state.members.iter().map(|m| Arc::clone(&m.dispatcher)).collect();
            (state.queue.len(), members)
        };
        let total: DispatcherStats = members.iter().map(|m| m.stats()).sum();
        DispatcherStats {
            queued,
            pending: queued + total.pending,
            size: queued + total.size,
            ..total
        }
    }

    fn is_busy(&self) -> bool {
        let members = {
            let state = self.lock();
            if !state.queue.is_empty() {
                return true;
            }
            if state.strategy.has_vacancy() {
                return false;
            }
            state.active_members()
        };
        !members.is_empty() && members.iter().all(|m| m.is_busy())
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }
}

impl<S: PoolStrategy> fmt::Debug for PoolBase<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("PoolBase")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("members", &state.members.len())
            .field("queued", &state.queue.len())
            .field("closed", &state.closed)
            .field("destroyed", &state.destroyed)
            .finish()
    }
}
