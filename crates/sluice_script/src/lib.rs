//! Sluice Scripting System
//!
//! JavaScript coroutines (QuickJS via `rquickjs`) that talk to the rest of
//! the process through event pumps.
//!
//! ## Architecture
//!
//! - **Bridge:** converts between [`DynamicValue`](sluice_core::DynamicValue)
//!   and interpreter values, with a bounded nesting depth
//! - **Host:** one interpreter per [`CoroutineHost`]; each script line runs as
//!   an `async` body scheduled on a [`WorkQueue`](sluice_core::WorkQueue)
//! - **Coroutines:** a script suspends only at `await get_event_next()` and is
//!   resumed, on the posting thread, by a post to its reply pump
//!
//! Scripts see three functions:
//!
//! ```text
//! post_on(pump, data)        // publish data on a pump
//! get_event_pumps()          // [replyPump, commandPump]
//! await get_event_next()     // [pump, data] of the next post to replyPump
//! ```

pub mod bridge;
pub mod coroutine;
pub mod error;
pub mod host;
pub mod runtime;

pub use bridge::{StackBudget, ValueBridge};
pub use coroutine::{CoroutineState, ScriptFuture, ScriptOutcome};
pub use error::{ConversionError, ScriptError};
pub use host::CoroutineHost;
pub use runtime::ScriptRuntime;

pub use rquickjs;
