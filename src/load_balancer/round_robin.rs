//! Round-robin pool: a fixed number of connections to one origin.

use std::sync::Arc;

use crate::dispatcher::{Dispatcher, DispatcherId};
use crate::error::{DispatchError, DispatchResult};
use crate::http::{ClientOptions, HttpClient};
use crate::load_balancer::pool::{Candidate, MemberFactory, PoolBase, PoolOptions, PoolStrategy};
use crate::load_balancer::upstream::normalize_origin;

/// Round-robin selector over `connections` slots.
/// Stores a cursor to rotate through slots; vacant slots get their member
/// from the factory the first time they are tried.
pub struct RoundRobin {
    origin: String,
    slots: Vec<Option<DispatcherId>>,
    /// Slot tried first by the next dispatch.
    cursor: usize,
    factory: MemberFactory,
    client: ClientOptions,
}

impl RoundRobin {
    fn new(origin: String, connections: usize, factory: MemberFactory, client: ClientOptions) -> Self {
        Self {
            origin,
            slots: vec![None; connections],
            cursor: 0,
            factory,
            client,
        }
    }

    fn slot_of(&self, member: DispatcherId) -> Option<usize> {
        self.slots.iter().position(|slot| *slot == Some(member))
    }
}

impl PoolStrategy for RoundRobin {
    fn plan(&mut self) -> DispatchResult<Vec<Candidate>> {
        let len = self.slots.len();
        let candidates = (0..len)
            .map(|i| (self.cursor + i) % len)
            .map(|slot| match self.slots[slot] {
                Some(member) => Candidate::Member(member),
                None => {
                    let factory = Arc::clone(&self.factory);
                    let origin = self.origin.clone();
                    let client = self.client.clone();
                    Candidate::Vacant {
                        slot,
                        spawn: Box::new(move || factory(&origin, &client)),
                    }
                }
            })
            .collect();
        Ok(candidates)
    }

    fn fill(&mut self, slot: usize, member: DispatcherId) -> bool {
        match self.slots.get_mut(slot) {
            Some(entry) if entry.is_none() => {
                *entry = Some(member);
                true
            }
            _ => false,
        }
    }

    fn has_vacancy(&self) -> bool {
        self.slots.iter().any(Option::is_none)
    }

    fn on_accepted(&mut self, member: DispatcherId) {
        // Every refused candidate before `slot` counts as an attempt too.
        if let Some(slot) = self.slot_of(member) {
            self.cursor = (slot + 1) % self.slots.len();
        }
    }

    fn on_member_removed(&mut self, member: DispatcherId) {
        if let Some(slot) = self.slot_of(member) {
            self.slots[slot] = None;
        }
    }
}

/// Pool cycling across `connections` members bound to one origin.
pub type RoundRobinPool = PoolBase<RoundRobin>;

/// Factory building an `HttpClient` per slot.
pub fn http_client_factory() -> MemberFactory {
    Arc::new(|origin: &str, options: &ClientOptions| {
        let client: Arc<dyn Dispatcher> = Arc::new(HttpClient::new(origin, options.clone())?);
        Ok(client)
    })
}

impl PoolBase<RoundRobin> {
    /// Create a pool of `options.connections` members for `origin`.
    pub fn new(origin: &str, options: PoolOptions) -> DispatchResult<Arc<Self>> {
        if options.connections == 0 {
            return Err(DispatchError::InvalidArgument(
                "connections must be greater than 0".into(),
            ));
        }
        let origin = normalize_origin(origin)?;
        let factory = options.factory.unwrap_or_else(http_client_factory);

        tracing::info!(origin = %origin, connections = options.connections, "Round-robin pool created");
        let strategy = RoundRobin::new(origin.clone(), options.connections, factory, options.client);
        Ok(PoolBase::with_strategy(origin, strategy))
    }

    pub fn origin(&self) -> &str {
        self.name()
    }

    /// Number of member connections this pool cycles across.
    pub fn connections(&self) -> usize {
        self.with_strategy_mut(|strategy| strategy.slots.len())
    }
}
