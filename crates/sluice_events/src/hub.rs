// hub.rs - Name → pump table with auto-vivification

use crate::pump::{Listener, Pump, PumpKind, SubscriptionId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use sluice_core::DynamicValue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static GLOBAL: Lazy<PumpHub> = Lazy::new(PumpHub::new);

#[derive(Default)]
struct HubInner {
    pumps: DashMap<String, Pump>,
    next_subscription: AtomicU64,
    next_unique: AtomicU64,
}

/// Cloneable handle to a set of named pumps.
#[derive(Clone, Default)]
pub struct PumpHub {
    inner: Arc<HubInner>,
}

/// Handle returned by [`PumpHub::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pump: String,
    id: SubscriptionId,
}

impl Subscription {
    pub fn pump(&self) -> &str {
        &self.pump
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl PumpHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide hub.
    pub fn global() -> PumpHub {
        GLOBAL.clone()
    }

    /// The pump called `name`, created on first use.
    pub fn obtain(&self, name: &str) -> Pump {
        self.obtain_kind(name, PumpKind::Stream)
    }

    /// Like [`obtain`](Self::obtain), but a newly created pump retains posts
    /// until someone subscribes. An existing pump keeps its kind.
    pub fn obtain_mail_drop(&self, name: &str) -> Pump {
        self.obtain_kind(name, PumpKind::MailDrop)
    }

    fn obtain_kind(&self, name: &str, kind: PumpKind) -> Pump {
        let pump = self
            .inner
            .pumps
            .entry(name.to_string())
            .or_insert_with(|| Pump::new(name, kind))
            .clone();
        if pump.kind() != kind {
            tracing::debug!(pump = name, existing = ?pump.kind(), requested = ?kind, "pump already exists with another kind");
        }
        pump
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.pumps.contains_key(name)
    }

    /// Deliver `value` synchronously to every subscriber of `name`.
    ///
    /// Returns the number of listeners called.
    pub fn post(&self, name: &str, value: impl Into<DynamicValue>) -> usize {
        let pump = self.obtain(name);
        let value = value.into();
        tracing::trace!(pump = name, %value, "post");
        pump.post(value)
    }

    pub fn subscribe<F>(&self, name: &str, listener: F) -> Subscription
    where
        F: Fn(&str, &DynamicValue) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        let listener: Listener = Arc::new(listener);
        // Attach while holding the entry so `release` cannot drop the pump
        // in between.
        let backlog = self
            .inner
            .pumps
            .entry(name.to_string())
            .or_insert_with(|| Pump::new(name, PumpKind::Stream))
            .attach(id, listener.clone());
        for value in &backlog {
            listener(name, value);
        }
        Subscription {
            pump: name.to_string(),
            id,
        }
    }

    /// Subscribe for as long as the returned guard lives.
    pub fn subscribe_scoped<F>(&self, name: &str, listener: F) -> ScopedSubscription
    where
        F: Fn(&str, &DynamicValue) + Send + Sync + 'static,
    {
        ScopedSubscription {
            hub: self.clone(),
            subscription: Some(self.subscribe(name, listener)),
        }
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let pump = self
            .inner
            .pumps
            .get(&subscription.pump)
            .map(|entry| entry.value().clone());
        match pump {
            Some(pump) => pump.remove_listener(subscription.id),
            None => false,
        }
    }

    /// Invent and reserve a pump name starting with `prefix` that no pump
    /// currently uses.
    pub fn unique_name(&self, prefix: &str) -> String {
        loop {
            let n = self.inner.next_unique.fetch_add(1, Ordering::Relaxed);
            let candidate = format!("{prefix}{n}");
            if let Entry::Vacant(vacant) = self.inner.pumps.entry(candidate.clone()) {
                vacant.insert(Pump::new(&candidate, PumpKind::Stream));
                return candidate;
            }
        }
    }

    /// Forget `name` if nobody listens and nothing is retained.
    pub fn release(&self, name: &str) -> bool {
        self.inner
            .pumps
            .remove_if(name, |_, pump| pump.is_idle())
            .is_some()
    }

    pub fn pump_count(&self) -> usize {
        self.inner.pumps.len()
    }
}

/// Subscription that is dropped together with this guard.
pub struct ScopedSubscription {
    hub: PumpHub,
    subscription: Option<Subscription>,
}

impl ScopedSubscription {
    pub fn subscription(&self) -> Option<&Subscription> {
        self.subscription.as_ref()
    }

    /// Keep the subscription alive past this guard.
    pub fn release(mut self) -> Option<Subscription> {
        self.subscription.take()
    }
}

impl Drop for ScopedSubscription {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            self.hub.unsubscribe(&subscription);
        }
    }
}
