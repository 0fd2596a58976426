// registry.rs - Name → instance table holding weak references only
//
// The registry never extends an instance's lifetime: entries resolve while
// some owner still holds an `Arc`, and stop resolving as soon as the last
// owner lets go.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;

static NEXT_ANONYMOUS: AtomicU64 = AtomicU64::new(1);

/// Errors that can occur while registering an instance by name.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("an instance named '{name}' is already registered")]
    DuplicateName { name: String },
}

/// Invent a process-unique name carrying `prefix`.
///
/// Names come from a monotonic counter, so they are never reused for the
/// lifetime of the process.
pub fn anonymous_name(prefix: &str) -> String {
    let id = NEXT_ANONYMOUS.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}{id}")
}

/// Weak-reference table keyed by name.
pub struct Registry<T> {
    entries: DashMap<String, Weak<T>>,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Record `instance` under `name`.
    ///
    /// Fails if a live instance already holds the name. An entry whose
    /// instance has been dropped is silently replaced.
    pub fn register(&self, name: &str, instance: &Arc<T>) -> Result<(), RegistryError> {
        match self.entries.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => {
                // Never upgrade while holding the shard lock: dropping the
                // upgraded Arc could re-enter this map from a Drop impl.
                if occupied.get().strong_count() > 0 {
                    return Err(RegistryError::DuplicateName {
                        name: name.to_string(),
                    });
                }
                occupied.insert(Arc::downgrade(instance));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::downgrade(instance));
            }
        }
        Ok(())
    }

    /// Resolve `name` to a strong reference if the instance is still alive.
    pub fn lookup(&self, name: &str) -> Option<Arc<T>> {
        let weak = self.entries.get(name).map(|entry| entry.value().clone())?;
        weak.upgrade()
    }

    /// Drop the entry for `name` if it no longer resolves.
    pub fn unregister_if_dead(&self, name: &str) -> bool {
        self.entries
            .remove_if(name, |_, weak| weak.strong_count() == 0)
            .is_some()
    }

    /// Names of every live instance, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}
