//! Sluice Core
//!
//! Contains the host-side primitives the scripting bridge is built on:
//! - Named work queues with a process-wide weak registry
//! - The dynamic value model shared by hosts, pumps and scripts
//! - The application lifecycle flag coroutines consult on resume

pub mod lifecycle;
pub mod queue;
pub mod registry;
pub mod value;

pub use lifecycle::{AppStatus, Lifecycle};
pub use queue::{QueueError, Repeat, Task, WorkQueue};
#[cfg(feature = "metrics")]
pub use queue::QueueStats;
pub use registry::{Registry, RegistryError};
pub use value::DynamicValue;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
