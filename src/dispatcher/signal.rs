//! Caller-side cancellation carried in `DispatchOptions`.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::DispatchError;

const ERR_POISONED_SIGNAL: &str = "abort signal mutex poisoned";

type AbortListener = Box<dyn FnOnce(DispatchError) + Send>;

#[derive(Default)]
struct SignalState {
    reason: Option<DispatchError>,
    next_id: u64,
    listeners: Vec<(u64, AbortListener)>,
}

/// Shared cancellation flag; clones observe the same abort.
///
/// Each registered listener fires at most once. Registering on an already
/// aborted signal fires the listener immediately.
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Arc<Mutex<SignalState>>,
}

/// Identifies a listener registered with `AbortSignal::on_abort`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortListenerId(u64);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort with `DispatchError::Aborted`.
    pub fn abort(&self) {
        self.abort_with(DispatchError::Aborted);
    }

    /// Abort with a custom reason. Only the first call has effect.
    pub fn abort_with(&self, reason: DispatchError) {
        let listeners = {
            let mut state = self.inner.lock().expect(ERR_POISONED_SIGNAL);
            if state.reason.is_some() {
                return;
            }
            state.reason = Some(reason.clone());
            std::mem::take(&mut state.listeners)
        };

        for (_, listener) in listeners {
            listener(reason.clone());
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().expect(ERR_POISONED_SIGNAL).reason.is_some()
    }

    pub fn reason(&self) -> Option<DispatchError> {
        self.inner.lock().expect(ERR_POISONED_SIGNAL).reason.clone()
    }

    /// Register `listener`. Returns `None` when the signal had already
    /// aborted, in which case the listener has run.
    pub fn on_abort<F>(&self, listener: F) -> Option<AbortListenerId>
    where
        F: FnOnce(DispatchError) + Send + 'static,
    {
        let reason = {
            let mut state = self.inner.lock().expect(ERR_POISONED_SIGNAL);
            match state.reason.clone() {
                Some(reason) => reason,
                None => {
                    state.next_id += 1;
                    let id = state.next_id;
                    state.listeners.push((id, Box::new(listener)));
                    return Some(AbortListenerId(id));
                }
            }
        };

        listener(reason);
        None
    }

    /// Drop a listener that has not fired yet.
    pub fn remove(&self, id: AbortListenerId) {
        self.inner
            .lock()
            .expect(ERR_POISONED_SIGNAL)
            .listeners
            .retain(|(listener_id, _)| *listener_id != id.0);
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}
