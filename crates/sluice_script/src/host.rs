//! Coroutine host
//!
//! Runs script lines as coroutines on a [`WorkQueue`] and wires them to a
//! [`PumpHub`].
//!
//! Each line is wrapped in an `async` function and started by a task posted
//! to the queue. The script suspends at `await get_event_next()`: the host
//! parks the promise's resolve/reject pair and the coroutine's reply pump
//! listener resumes it when something is posted there.
//!
//! ## Driving the interpreter
//!
//! The interpreter lock is not re-entrant, yet a script's `post_on` can reach
//! a listener that wants to resume another coroutine of the same host. So all
//! interpreter work goes through one *driver* at a time:
//!
//! 1. A wake (start or resume) is pushed onto the host's ready list.
//! 2. If no driver is active the caller becomes the driver and runs wakes and
//!    promise jobs until the ready list is empty.
//! 3. Otherwise the wake stays queued for the active driver, which picks it
//!    up before letting go.
//!
//! Uncontended, a post to a waiting coroutine's reply pump therefore runs the
//! continuation inline, up to the next suspension or completion, before the
//! post returns.
//!
//! ## Command pump
//!
//! The second name from `get_event_pumps()` is the host's command pump. A
//! script attaches its `get_event_next()` to any other pump by posting
//!
//! ```text
//! { op: "listen", source: "P", reply: <its reply pump> }
//! ```
//!
//! after which every post on `P` resumes it once with `["P", data]`.
//! `op: "stoplistening"` with the same fields detaches it again; finishing
//! the script detaches everything.

use crate::bridge::ValueBridge;
use crate::coroutine::{
    Coroutine, CoroutineState, Parked, ScriptFuture, ScriptOutcome, CANCELLED_MESSAGE,
};
use crate::error::ScriptError;
use crate::runtime::ScriptRuntime;
use rquickjs::{Ctx, Exception, Function, Object, Value};
use sluice_core::{DynamicValue, Lifecycle, WorkQueue};
use sluice_events::{PumpHub, Subscription};
use sluice_services::ScriptSettings;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

/// How long `wait_script_line` blocks on the queue between outcome checks.
const WAIT_SLICE: Duration = Duration::from_millis(10);

enum Wake {
    Start(Arc<Coroutine>, String),
    Resume(Arc<Coroutine>),
}

#[derive(Default)]
struct DriverState {
    active: bool,
    ready: VecDeque<Wake>,
}

struct HostInner {
    coroutines: Mutex<HashMap<u64, Arc<Coroutine>>>,
    driver: Mutex<DriverState>,
    hub: PumpHub,
    lifecycle: Lifecycle,
    bridge: ValueBridge,
    command_pump: String,
    command_subscription: Subscription,
    reply_prefix: String,
    next_id: AtomicU64,
    // Last: dropped after every parked persistent above is released.
    script: ScriptRuntime,
}

/// Owns one interpreter and runs script lines on it as coroutines.
#[derive(Clone)]
pub struct CoroutineHost {
    inner: Arc<HostInner>,
}

impl CoroutineHost {
    pub fn new(
        hub: PumpHub,
        lifecycle: Lifecycle,
        settings: &ScriptSettings,
    ) -> Result<Self, ScriptError> {
        let script = ScriptRuntime::new(settings)?;
        let inner = Arc::new_cyclic(|weak: &Weak<HostInner>| {
            let host = weak.clone();
            let command_subscription = hub.subscribe(&settings.command_pump, move |_, request| {
                if let Some(host) = host.upgrade() {
                    host.command(request);
                }
            });
            HostInner {
                coroutines: Mutex::new(HashMap::new()),
                driver: Mutex::new(DriverState::default()),
                hub,
                lifecycle,
                bridge: ValueBridge::new(settings.max_nesting_depth)
                    .with_max_elements(settings.max_container_len),
                command_pump: settings.command_pump.clone(),
                command_subscription,
                reply_prefix: settings.reply_pump_prefix.clone(),
                next_id: AtomicU64::new(1),
                script,
            }
        });
        Ok(Self { inner })
    }

    pub fn hub(&self) -> &PumpHub {
        &self.inner.hub
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    pub fn command_pump(&self) -> &str {
        &self.inner.command_pump
    }

    /// Number of script lines started but not yet finished.
    pub fn active_coroutines(&self) -> usize {
        self.inner.lock_coroutines().len()
    }

    /// Schedule `text` to run as a coroutine on `queue` and return at once.
    ///
    /// The script's reply pump is subscribed before this returns, so posts
    /// made to it early are kept until the script asks for them.
    pub fn start_script_line(&self, queue: &WorkQueue, text: impl Into<String>) -> ScriptFuture {
        let inner = &self.inner;
        let (sender, receiver) = oneshot::channel();
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let reply_pump = inner.hub.unique_name(&inner.reply_prefix);
        let coroutine = Arc::new(Coroutine::new(
            id,
            reply_pump.clone(),
            inner.command_pump.clone(),
            sender,
        ));

        let subscription = inner.hub.subscribe(
            &reply_pump,
            deliver_to(Arc::downgrade(inner), coroutine.clone()),
        );
        coroutine.lock().subscription = Some(subscription);
        inner.lock_coroutines().insert(id, coroutine.clone());

        tracing::debug!(coroutine = id, reply_pump = %reply_pump, queue = queue.key(), "script line scheduled");
        let start = StartTask {
            host: inner.clone(),
            coroutine: Some(coroutine),
            text: text.into(),
        };
        queue.post(move || start.run());

        ScriptFuture::new(receiver, reply_pump)
    }

    /// Start `text` on `queue` and block until the script finishes.
    ///
    /// While no other thread runs `queue`, this thread services it. Once
    /// another runner shows up, or the queue is closed and drained, it only
    /// waits, so tasks keep running on the queue's own runner.
    pub fn wait_script_line(&self, queue: &WorkQueue, text: impl Into<String>) -> ScriptOutcome {
        let mut future = self.start_script_line(queue, text);
        loop {
            if let Some(outcome) = future.try_take() {
                return outcome;
            }
            if queue.is_done() || queue.has_other_runner() {
                return future.wait();
            }
            queue.wait_one(WAIT_SLICE);
        }
    }
}

impl std::fmt::Debug for CoroutineHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoroutineHost")
            .field("command_pump", &self.inner.command_pump)
            .field("active", &self.active_coroutines())
            .finish()
    }
}

/// Queue task that starts one coroutine. If the queue drops it unrun the
/// coroutine finishes as cancelled.
struct StartTask {
    host: Arc<HostInner>,
    coroutine: Option<Arc<Coroutine>>,
    text: String,
}

impl StartTask {
    fn run(mut self) {
        if let Some(coroutine) = self.coroutine.take() {
            let text = std::mem::take(&mut self.text);
            self.host.schedule(Wake::Start(coroutine, text));
        }
    }
}

impl Drop for StartTask {
    fn drop(&mut self) {
        if let Some(coroutine) = self.coroutine.take() {
            tracing::debug!(coroutine = coroutine.id, "script line dropped before it started");
            // Never started, so nothing is parked in the interpreter.
            self.host.finish(&coroutine, ScriptOutcome::cancelled());
        }
    }
}

/// Clears the active flag if a wake panics, so later posts can drive.
struct ActiveDriver<'a>(&'a HostInner);

impl Drop for ActiveDriver<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let mut driver = self.0.lock_driver();
            driver.active = false;
            driver.ready.clear();
        }
    }
}

impl HostInner {
    fn lock_driver(&self) -> MutexGuard<'_, DriverState> {
        self.driver.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_coroutines(&self) -> MutexGuard<'_, HashMap<u64, Arc<Coroutine>>> {
        self.coroutines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule(self: &Arc<Self>, wake: Wake) {
        {
            let mut driver = self.lock_driver();
            driver.ready.push_back(wake);
            if driver.active {
                return;
            }
            driver.active = true;
        }
        self.drive();
    }

    fn drive(self: &Arc<Self>) {
        let _active = ActiveDriver(self);
        loop {
            loop {
                let next = self.lock_driver().ready.pop_front();
                let Some(wake) = next else {
                    break;
                };
                self.script.with(|ctx| match wake {
                    Wake::Start(coroutine, text) => self.start(&ctx, &coroutine, &text),
                    Wake::Resume(coroutine) => self.resume(&ctx, &coroutine),
                });
            }
            self.script.run_pending_jobs();

            let mut driver = self.lock_driver();
            if driver.ready.is_empty() {
                driver.active = false;
                return;
            }
        }
    }

    fn start<'js>(self: &Arc<Self>, ctx: &Ctx<'js>, coroutine: &Arc<Coroutine>, text: &str) {
        {
            let mut state = coroutine.lock();
            if state.state != CoroutineState::Created {
                return;
            }
            state.state = CoroutineState::Running;
        }
        tracing::debug!(coroutine = coroutine.id, "script line started");

        let launched = ctx
            .eval::<Function<'js>, _>(wrap_source(text))
            .and_then(|entry| {
                let bindings = self.bindings(ctx, coroutine)?;
                entry.call::<_, ()>((bindings,))
            });
        if let Err(err) = launched {
            let message = describe_error(ctx, err);
            tracing::debug!(coroutine = coroutine.id, %message, "script line failed to start");
            self.finish(coroutine, ScriptOutcome::errored(message));
        }
    }

    fn resume<'js>(&self, ctx: &Ctx<'js>, coroutine: &Arc<Coroutine>) {
        let (parked, event) = {
            let mut state = coroutine.lock();
            if state.state != CoroutineState::Suspended {
                // The post waits in the mailbox for the next get_event_next().
                return;
            }
            let Some(parked) = state.parked.take() else {
                return;
            };
            if !self.lifecycle.is_running() {
                drop(state);
                self.cancel(ctx, coroutine, Some(parked));
                return;
            }
            let Some(event) = state.mailbox.pop_front() else {
                state.parked = Some(parked);
                return;
            };
            state.state = CoroutineState::Running;
            (parked, event)
        };

        tracing::trace!(coroutine = coroutine.id, pump = %event.0, "resuming script");
        if let Err(err) = self.settle(ctx, parked, &event.0, &event.1) {
            let message = describe_error(ctx, err);
            tracing::warn!(coroutine = coroutine.id, %message, "failed to resume script");
            self.finish(coroutine, ScriptOutcome::errored(message));
        }
    }

    /// Resolve a parked promise with `[pump, data]`, or reject it with a
    /// `TypeError` if `data` cannot cross into the interpreter.
    fn settle<'js>(
        &self,
        ctx: &Ctx<'js>,
        parked: Parked,
        pump: &str,
        data: &DynamicValue,
    ) -> rquickjs::Result<()> {
        let (resolve, reject) = parked.restore(ctx)?;
        match self.bridge.event_to_js(ctx, pump, data) {
            Ok(event) => resolve.call::<_, ()>((event,)),
            Err(err) => reject.call::<_, ()>((type_error(ctx, &err.to_string())?,)),
        }
    }

    /// Finish `coroutine` as cancelled and unwind the script through its
    /// pending `get_event_next()`, if any.
    fn cancel<'js>(&self, ctx: &Ctx<'js>, coroutine: &Coroutine, parked: Option<Parked>) {
        tracing::debug!(coroutine = coroutine.id, status = ?self.lifecycle.status(), "cancelling script");
        self.finish(coroutine, ScriptOutcome::cancelled());
        if let Some(parked) = parked {
            let rejected = parked.restore(ctx).and_then(|(_, reject)| {
                reject.call::<_, ()>((type_error(ctx, CANCELLED_MESSAGE)?,))
            });
            if let Err(err) = rejected {
                tracing::warn!(coroutine = coroutine.id, error = %err, "failed to unwind cancelled script");
            }
        }
    }

    /// Record the terminal outcome. Only the first call has any effect.
    ///
    /// Must run under the interpreter lock unless the coroutine never
    /// started, since a parked promise may be released here.
    fn finish(&self, coroutine: &Coroutine, outcome: ScriptOutcome) {
        let (sender, subscription, parked, listening) = {
            let mut state = coroutine.lock();
            let Some(sender) = state.outcome.take() else {
                return;
            };
            state.state = outcome.state;
            state.mailbox.clear();
            let listening = std::mem::take(&mut state.listening);
            (sender, state.subscription.take(), state.parked.take(), listening)
        };
        drop(parked);

        for subscription in subscription.iter().chain(listening.values()) {
            self.hub.unsubscribe(subscription);
        }
        self.hub.release(&coroutine.reply_pump);
        self.lock_coroutines().remove(&coroutine.id);

        tracing::debug!(
            coroutine = coroutine.id,
            state = ?outcome.state,
            count = outcome.count,
            "script line finished"
        );
        // The caller may have stopped waiting.
        let _ = sender.send(outcome);
    }

    /// Handle one request posted on the command pump.
    fn command(self: &Arc<Self>, request: &DynamicValue) {
        let op = request.get("op").as_str();
        let (Some(source), Some(reply)) =
            (request.get("source").as_str(), request.get("reply").as_str())
        else {
            tracing::warn!(%request, "script command needs 'source' and 'reply'");
            return;
        };
        let coroutine = self
            .lock_coroutines()
            .values()
            .find(|coroutine| coroutine.reply_pump == reply)
            .cloned();
        let Some(coroutine) = coroutine else {
            // Another host on the same hub, or a script that already finished.
            tracing::debug!(reply, "script command for an unknown reply pump");
            return;
        };
        match op {
            Some("listen") => self.listen(&coroutine, source),
            Some("stoplistening") => self.stop_listening(&coroutine, source),
            other => tracing::warn!(op = ?other, "unknown script command"),
        }
    }

    /// Feed posts on `source` into `coroutine`'s `get_event_next()`.
    fn listen(self: &Arc<Self>, coroutine: &Arc<Coroutine>, source: &str) {
        {
            let state = coroutine.lock();
            if state.state.is_terminal()
                || source == coroutine.reply_pump
                || state.listening.contains_key(source)
            {
                return;
            }
        }
        // Subscribing may replay retained posts into the listener, which
        // takes the coroutine lock.
        let subscription = self
            .hub
            .subscribe(source, deliver_to(Arc::downgrade(self), coroutine.clone()));
        let duplicate = {
            let mut state = coroutine.lock();
            if state.state.is_terminal() || state.listening.contains_key(source) {
                Some(subscription)
            } else {
                state.listening.insert(source.to_string(), subscription);
                None
            }
        };
        match duplicate {
            Some(subscription) => {
                self.hub.unsubscribe(&subscription);
            }
            None => tracing::debug!(coroutine = coroutine.id, source, "script listening"),
        }
    }

    fn stop_listening(&self, coroutine: &Coroutine, source: &str) {
        let removed = coroutine.lock().listening.remove(source);
        if let Some(subscription) = removed {
            self.hub.unsubscribe(&subscription);
            tracing::debug!(coroutine = coroutine.id, source, "script stopped listening");
        }
    }

    /// The object handed to the wrapper function as `__host`.
    fn bindings<'js>(
        self: &Arc<Self>,
        ctx: &Ctx<'js>,
        coroutine: &Arc<Coroutine>,
    ) -> rquickjs::Result<Object<'js>> {
        let host = Arc::downgrade(self);
        let object = Object::new(ctx.clone())?;
        object.set(
            "post_on",
            Function::new(ctx.clone(), post_on_fn(host.clone()))?,
        )?;
        object.set(
            "get_event_pumps",
            Function::new(ctx.clone(), event_pumps_fn(coroutine.clone()))?,
        )?;
        object.set(
            "next",
            Function::new(ctx.clone(), next_fn(host.clone(), coroutine.clone()))?,
        )?;
        object.set(
            "done",
            Function::new(ctx.clone(), done_fn(host.clone(), coroutine.clone()))?,
        )?;
        object.set("fail", Function::new(ctx.clone(), fail_fn(host, coroutine.clone()))?)?;
        Ok(object)
    }
}

impl Drop for HostInner {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.command_subscription);
        let abandoned: Vec<Arc<Coroutine>> = self
            .coroutines
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, coroutine)| coroutine)
            .collect();
        if abandoned.is_empty() {
            return;
        }
        tracing::debug!(count = abandoned.len(), "host dropped with scripts still running");

        // Parked promises belong to the interpreter and must go first.
        self.script.with(|_ctx| {
            for coroutine in &abandoned {
                drop(coroutine.lock().parked.take());
            }
        });
        for coroutine in &abandoned {
            self.finish(coroutine, ScriptOutcome::cancelled());
        }
    }
}

fn wrap_source(text: &str) -> String {
    format!(
        "(function (__host) {{\n\
         const post_on = __host.post_on;\n\
         const get_event_pumps = __host.get_event_pumps;\n\
         const get_event_next = () => new Promise((resolve, reject) => __host.next(resolve, reject));\n\
         (async () => {{\n{text}\n}})().then(\n\
           (value) => __host.done(value),\n\
           (error) => __host.fail(String(error)));\n\
         }})"
    )
}

fn type_error<'js>(ctx: &Ctx<'js>, message: &str) -> rquickjs::Result<Value<'js>> {
    let constructor: Function<'js> = ctx.globals().get("TypeError")?;
    constructor.call((message,))
}

/// Message for an error raised while running script code.
fn describe_error(ctx: &Ctx<'_>, err: rquickjs::Error) -> String {
    if !matches!(err, rquickjs::Error::Exception) {
        return err.to_string();
    }
    let thrown = ctx.catch();
    if let Some(exception) = thrown.as_exception() {
        return exception
            .message()
            .unwrap_or_else(|| "script raised an exception".to_string());
    }
    thrown
        .as_string()
        .and_then(|s| s.to_string().ok())
        .unwrap_or_else(|| format!("script threw {:?}", thrown.type_of()))
}

/// Pump listener that queues each post for `target` and wakes it.
fn deliver_to(
    host: Weak<HostInner>,
    target: Arc<Coroutine>,
) -> impl Fn(&str, &DynamicValue) + Send + Sync + 'static {
    move |pump, data| {
        {
            let mut state = target.lock();
            if state.state.is_terminal() {
                return;
            }
            state.mailbox.push_back((pump.to_string(), data.clone()));
        }
        if let Some(host) = host.upgrade() {
            host.schedule(Wake::Resume(target.clone()));
        }
    }
}

/// Still allowed after cancellation so `finally` blocks can report.
fn post_on_fn<'js>(
    host: Weak<HostInner>,
) -> impl Fn(Ctx<'js>, String, Value<'js>) -> rquickjs::Result<()> + 'js {
    move |ctx, pump, data| {
        let Some(host) = host.upgrade() else {
            return Err(Exception::throw_message(&ctx, CANCELLED_MESSAGE));
        };
        let value = host
            .bridge
            .from_js(&ctx, &data)
            .map_err(|err| Exception::throw_type(&ctx, &err.to_string()))?;
        host.hub.post(&pump, value);
        Ok(())
    }
}

fn event_pumps_fn(coroutine: Arc<Coroutine>) -> impl Fn() -> Vec<String> {
    move || vec![coroutine.reply_pump.clone(), coroutine.command_pump.clone()]
}

fn next_fn<'js>(
    host: Weak<HostInner>,
    coroutine: Arc<Coroutine>,
) -> impl Fn(Ctx<'js>, Function<'js>, Function<'js>) -> rquickjs::Result<()> + 'js {
    move |ctx, resolve, reject| {
        let Some(host) = host.upgrade() else {
            return Err(Exception::throw_message(&ctx, CANCELLED_MESSAGE));
        };
        let parked = Parked::new(&ctx, resolve, reject);
        let (pump, data) = {
            let mut state = coroutine.lock();
            if state.state.is_terminal() {
                drop(state);
                let (_, reject) = parked.restore(&ctx)?;
                return reject.call::<_, ()>((type_error(&ctx, CANCELLED_MESSAGE)?,));
            }
            if state.parked.is_some() {
                drop(state);
                drop(parked);
                return Err(Exception::throw_message(
                    &ctx,
                    "get_event_next() is already waiting",
                ));
            }
            if !host.lifecycle.is_running() {
                drop(state);
                host.cancel(&ctx, &coroutine, Some(parked));
                return Ok(());
            }
            match state.mailbox.pop_front() {
                Some(event) => event,
                None => {
                    state.parked = Some(parked);
                    state.state = CoroutineState::Suspended;
                    return Ok(());
                }
            }
        };
        host.settle(&ctx, parked, &pump, &data)
    }
}

fn done_fn<'js>(
    host: Weak<HostInner>,
    coroutine: Arc<Coroutine>,
) -> impl Fn(Ctx<'js>, Value<'js>) -> rquickjs::Result<()> + 'js {
    move |ctx, value| {
        let Some(host) = host.upgrade() else {
            return Ok(());
        };
        let outcome = if value.is_undefined() {
            ScriptOutcome::returned(0, DynamicValue::Undefined)
        } else {
            match host.bridge.from_js(&ctx, &value) {
                Ok(converted) => ScriptOutcome::returned(1, converted),
                Err(err) => ScriptOutcome::errored(err.to_string()),
            }
        };
        host.finish(&coroutine, outcome);
        Ok(())
    }
}

fn fail_fn(
    host: Weak<HostInner>,
    coroutine: Arc<Coroutine>,
) -> impl Fn(String) -> rquickjs::Result<()> {
    move |message| {
        if let Some(host) = host.upgrade() {
            host.finish(&coroutine, ScriptOutcome::errored(message));
        }
        Ok(())
    }
}
