//! Dispatcher identities and lifecycle events.
//!
//! # Responsibilities
//! - Generate unique dispatcher IDs for event targets and tracing
//! - Define the lifecycle events every dispatcher may emit
//! - Provide the explicit subscribe/unsubscribe registry
//!
//! # Design Decisions
//! - No global event bus: a listener only sees the dispatchers it subscribed to
//! - Listeners are snapshotted before emission so they may (un)subscribe re-entrantly

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::DispatchError;

/// Global atomic counter for dispatcher IDs.
/// Relaxed ordering is enough: only uniqueness matters.
static DISPATCHER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

static SUBSCRIPTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

const ERR_POISONED_LISTENERS: &str = "listener registry mutex poisoned";

/// Unique identifier for a dispatcher (client, pool, interceptor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatcherId(u64);

impl DispatcherId {
    /// Generate a new unique dispatcher ID.
    pub fn new() -> Self {
        Self(DISPATCHER_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for DispatcherId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DispatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dispatcher-{}", self.0)
    }
}

/// Handle returned by `subscribe`, needed to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        Self(SUBSCRIPTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Lifecycle events emitted by dispatchers.
///
/// `targets` lists the dispatchers the event travelled through, outermost
/// first: a pool forwarding a client's event prepends its own ID.
#[derive(Debug, Clone)]
pub enum DispatcherEvent {
    Connect {
        origin: String,
        targets: Vec<DispatcherId>,
    },
    Disconnect {
        origin: String,
        targets: Vec<DispatcherId>,
        error: DispatchError,
    },
    ConnectionError {
        origin: String,
        targets: Vec<DispatcherId>,
        error: DispatchError,
    },
    Drain {
        origin: String,
        targets: Vec<DispatcherId>,
    },
}

impl DispatcherEvent {
    pub fn origin(&self) -> &str {
        match self {
            DispatcherEvent::Connect { origin, .. }
            | DispatcherEvent::Disconnect { origin, .. }
            | DispatcherEvent::ConnectionError { origin, .. }
            | DispatcherEvent::Drain { origin, .. } => origin,
        }
    }

    pub fn targets(&self) -> &[DispatcherId] {
        match self {
            DispatcherEvent::Connect { targets, .. }
            | DispatcherEvent::Disconnect { targets, .. }
            | DispatcherEvent::ConnectionError { targets, .. }
            | DispatcherEvent::Drain { targets, .. } => targets,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DispatcherEvent::Connect { .. } => "connect",
            DispatcherEvent::Disconnect { .. } => "disconnect",
            DispatcherEvent::ConnectionError { .. } => "connectionError",
            DispatcherEvent::Drain { .. } => "drain",
        }
    }

    /// The same event as seen through `outer`.
    pub fn forwarded(&self, outer: DispatcherId) -> Self {
        let mut event = self.clone();
        let targets = match &mut event {
            DispatcherEvent::Connect { targets, .. }
            | DispatcherEvent::Disconnect { targets, .. }
            | DispatcherEvent::ConnectionError { targets, .. }
            | DispatcherEvent::Drain { targets, .. } => targets,
        };
        targets.insert(0, outer);
        event
    }
}

/// Receives lifecycle events from a dispatcher it subscribed to.
pub trait DispatcherListener: Send + Sync {
    fn on_event(&self, event: &DispatcherEvent);
}

impl<F> DispatcherListener for F
where
    F: Fn(&DispatcherEvent) + Send + Sync,
{
    fn on_event(&self, event: &DispatcherEvent) {
        self(event)
    }
}

/// Subscription registry embedded in every dispatcher.
#[derive(Default)]
pub struct Listeners {
    inner: Mutex<Vec<(SubscriptionId, Arc<dyn DispatcherListener>)>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn DispatcherListener>) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.inner.lock().expect(ERR_POISONED_LISTENERS).push((id, listener));
        id
    }

    /// Returns false when the subscription was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock().expect(ERR_POISONED_LISTENERS);
        let before = inner.len();
        inner.retain(|(sub, _)| *sub != id);
        inner.len() != before
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect(ERR_POISONED_LISTENERS).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn emit(&self, event: &DispatcherEvent) {
        let snapshot: Vec<Arc<dyn DispatcherListener>> = self
            .inner
            .lock()
            .expect(ERR_POISONED_LISTENERS)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        tracing::trace!(event = event.name(), origin = event.origin(), listeners = snapshot.len(), "Emitting dispatcher event");
        for listener in snapshot {
            listener.on_event(event);
        }
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn dispatcher_id_unique() {
        let id1 = DispatcherId::new();
        let id2 = DispatcherId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn forwarded_prepends_outer_target() {
        let client = DispatcherId::new();
        let pool = DispatcherId::new();
        let event = DispatcherEvent::Drain {
            origin: "http://a".into(),
            targets: vec![client],
        };
        let forwarded = event.forwarded(pool);
        assert_eq!(forwarded.targets(), &[pool, client]);
        assert_eq!(forwarded.origin(), "http://a");
    }

    #[test]
    fn listeners_subscribe_and_unsubscribe() {
        let listeners = Listeners::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let id = listeners.subscribe(Arc::new(move |_: &DispatcherEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let event = DispatcherEvent::Connect {
            origin: "http://a".into(),
            targets: vec![],
        };
        listeners.emit(&event);
        assert!(listeners.unsubscribe(id));
        assert!(!listeners.unsubscribe(id));
        listeners.emit(&event);

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(listeners.is_empty());
    }
}
