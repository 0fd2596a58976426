// coroutine.rs - Per-evaluation state and the outcome handed back to callers

use rquickjs::{Ctx, Function, Persistent};
use sluice_core::DynamicValue;
use sluice_events::Subscription;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

pub(crate) const CANCELLED_MESSAGE: &str = "script cancelled: host is shutting down";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CoroutineState {
    Created,
    Running,
    Suspended,
    Completed,
    Errored,
    Cancelled,
}

impl CoroutineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CoroutineState::Completed | CoroutineState::Errored | CoroutineState::Cancelled
        )
    }
}

/// Result of one script line.
///
/// `count` is 0 when the script returned nothing, 1 when it returned a value
/// (even `null`) and negative on failure, in which case `value` holds the
/// error message.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptOutcome {
    pub count: i32,
    pub value: DynamicValue,
    pub state: CoroutineState,
}

impl ScriptOutcome {
    pub(crate) fn returned(count: i32, value: DynamicValue) -> Self {
        Self {
            count,
            value,
            state: CoroutineState::Completed,
        }
    }

    pub(crate) fn errored(message: impl Into<String>) -> Self {
        Self {
            count: -1,
            value: DynamicValue::String(message.into()),
            state: CoroutineState::Errored,
        }
    }

    pub(crate) fn cancelled() -> Self {
        Self {
            count: -1,
            value: DynamicValue::from(CANCELLED_MESSAGE),
            state: CoroutineState::Cancelled,
        }
    }

    pub fn is_error(&self) -> bool {
        self.count < 0
    }

    pub fn into_pair(self) -> (i32, DynamicValue) {
        (self.count, self.value)
    }
}

/// Pending result of [`CoroutineHost::start_script_line`](crate::CoroutineHost::start_script_line).
///
/// Await it, block on it with [`wait`](Self::wait), or poll it with
/// [`try_take`](Self::try_take) while running the queue yourself.
#[derive(Debug)]
pub struct ScriptFuture {
    receiver: oneshot::Receiver<ScriptOutcome>,
    reply_pump: String,
}

impl ScriptFuture {
    pub(crate) fn new(receiver: oneshot::Receiver<ScriptOutcome>, reply_pump: String) -> Self {
        Self {
            receiver,
            reply_pump,
        }
    }

    /// The pump this script's `get_event_next()` listens on.
    pub fn reply_pump(&self) -> &str {
        &self.reply_pump
    }

    /// Block the calling thread until the script finishes.
    ///
    /// Something else must be running the script's queue. Panics if called
    /// from inside an async runtime.
    pub fn wait(self) -> ScriptOutcome {
        self.receiver
            .blocking_recv()
            .unwrap_or_else(|_| ScriptOutcome::cancelled())
    }

    pub fn try_take(&mut self) -> Option<ScriptOutcome> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(ScriptOutcome::cancelled()),
        }
    }
}

impl Future for ScriptFuture {
    type Output = ScriptOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<ScriptOutcome> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| ScriptOutcome::cancelled()))
    }
}

/// Resolve/reject pair of a pending `get_event_next()` promise.
pub(crate) struct Parked {
    resolve: Persistent<Function<'static>>,
    reject: Persistent<Function<'static>>,
}

impl Parked {
    pub(crate) fn new<'js>(ctx: &Ctx<'js>, resolve: Function<'js>, reject: Function<'js>) -> Self {
        Self {
            resolve: Persistent::save(ctx, resolve),
            reject: Persistent::save(ctx, reject),
        }
    }

    pub(crate) fn restore<'js>(
        self,
        ctx: &Ctx<'js>,
    ) -> rquickjs::Result<(Function<'js>, Function<'js>)> {
        Ok((self.resolve.restore(ctx)?, self.reject.restore(ctx)?))
    }
}

pub(crate) struct CoroutineInner {
    pub state: CoroutineState,
    pub mailbox: VecDeque<(String, DynamicValue)>,
    pub parked: Option<Parked>,
    pub outcome: Option<oneshot::Sender<ScriptOutcome>>,
    pub subscription: Option<Subscription>,
    /// Extra pumps attached through the command pump, by name.
    pub listening: HashMap<String, Subscription>,
}

/// Everything the host tracks for one running script line.
pub(crate) struct Coroutine {
    pub id: u64,
    pub reply_pump: String,
    pub command_pump: String,
    inner: Mutex<CoroutineInner>,
}

impl Coroutine {
    pub(crate) fn new(
        id: u64,
        reply_pump: String,
        command_pump: String,
        outcome: oneshot::Sender<ScriptOutcome>,
    ) -> Self {
        Self {
            id,
            reply_pump,
            command_pump,
            inner: Mutex::new(CoroutineInner {
                state: CoroutineState::Created,
                mailbox: VecDeque::new(),
                parked: None,
                outcome: Some(outcome),
                subscription: None,
                listening: HashMap::new(),
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CoroutineInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> CoroutineState {
        self.lock().state
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("reply_pump", &self.reply_pump)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}

    #[test]
    fn parked_promises_can_cross_threads() {
        assert_send::<Parked>();
        assert_send::<CoroutineInner>();
    }

    #[test]
    fn terminal_states() {
        assert!(!CoroutineState::Created.is_terminal());
        assert!(!CoroutineState::Suspended.is_terminal());
        assert!(CoroutineState::Completed.is_terminal());
        assert!(CoroutineState::Cancelled.is_terminal());
    }

    #[test]
    fn dropped_sender_reads_as_cancelled() {
        let (tx, rx) = oneshot::channel();
        let mut future = ScriptFuture::new(rx, "reply".to_string());
        assert_eq!(future.try_take(), None);
        drop(tx);
        let outcome = future.try_take().unwrap();
        assert_eq!(outcome.state, CoroutineState::Cancelled);
        assert!(outcome.is_error());
    }

    #[test]
    fn wait_returns_sent_outcome() {
        let (tx, rx) = oneshot::channel();
        let future = ScriptFuture::new(rx, "reply".to_string());
        tx.send(ScriptOutcome::returned(1, 17.into())).unwrap();
        assert_eq!(future.wait().into_pair(), (1, DynamicValue::from(17)));
    }
}
