// pump.rs - A single named broadcast channel

use sluice_core::DynamicValue;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Callback invoked with `(pump name, value)` for every post.
pub type Listener = Arc<dyn Fn(&str, &DynamicValue) + Send + Sync>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PumpKind {
    /// Posts with no listener are discarded.
    Stream,
    /// Posts with no listener are retained for the next subscriber.
    MailDrop,
}

#[derive(Default)]
struct PumpState {
    listeners: Vec<(SubscriptionId, Listener)>,
    retained: VecDeque<DynamicValue>,
}

struct PumpInner {
    name: String,
    kind: PumpKind,
    state: Mutex<PumpState>,
}

/// Cheap, cloneable handle to a named channel.
#[derive(Clone)]
pub struct Pump {
    inner: Arc<PumpInner>,
}

impl Pump {
    pub(crate) fn new(name: &str, kind: PumpKind) -> Self {
        Self {
            inner: Arc::new(PumpInner {
                name: name.to_string(),
                kind,
                state: Mutex::new(PumpState::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> PumpKind {
        self.inner.kind
    }

    fn lock(&self) -> MutexGuard<'_, PumpState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    pub(crate) fn is_idle(&self) -> bool {
        let state = self.lock();
        state.listeners.is_empty() && state.retained.is_empty()
    }

    /// Deliver `value` to every current listener. Returns how many were
    /// called.
    pub fn post(&self, value: DynamicValue) -> usize {
        let listeners: Vec<Listener> = {
            let mut state = self.lock();
            if state.listeners.is_empty() {
                if self.inner.kind == PumpKind::MailDrop {
                    state.retained.push_back(value);
                    tracing::trace!(pump = %self.inner.name, retained = state.retained.len(), "post retained");
                }
                return 0;
            }
            state.listeners.iter().map(|(_, l)| l.clone()).collect()
        };

        for listener in &listeners {
            listener(&self.inner.name, &value);
        }
        listeners.len()
    }

    /// Register `listener` and hand back whatever was retained for it. The
    /// caller delivers the backlog once it holds no other locks.
    pub(crate) fn attach(&self, id: SubscriptionId, listener: Listener) -> Vec<DynamicValue> {
        let mut state = self.lock();
        state.listeners.push((id, listener));
        state.retained.drain(..).collect()
    }

    pub(crate) fn remove_listener(&self, id: SubscriptionId) -> bool {
        let mut state = self.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(existing, _)| *existing != id);
        state.listeners.len() != before
    }
}

impl std::fmt::Debug for Pump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pump")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("listeners", &self.listener_count())
            .finish()
    }
}
