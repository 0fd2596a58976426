//! Sluice Event Pumps
//!
//! Named broadcast channels with synchronous delivery.
//!
//! ## Architecture
//!
//! - **Pump:** one named channel; `post` calls every current listener inline
//!   before returning, so delivery is FIFO per pump and per posting thread
//! - **PumpHub:** name → pump table; pumps spring into existence on first
//!   reference instead of erroring when absent
//! - **Mail drop:** a pump variant that keeps posts made while nobody listens
//!   and hands them to the next subscriber
//!
//! Listeners run on the posting thread. A listener may post, subscribe or
//! unsubscribe re-entrantly: delivery works from a snapshot of the listener
//! list taken when `post` starts.

pub mod hub;
pub mod pump;

pub use hub::{PumpHub, ScopedSubscription, Subscription};
pub use pump::{Listener, Pump, PumpKind, SubscriptionId};
