//! Named work queues
//!
//! A [`WorkQueue`] is a FIFO of deferred tasks that any thread may post to and
//! one runner drains. Every queue is registered by weak reference under its
//! name, so other subsystems can find it with [`WorkQueue::instance`] without
//! keeping it alive.
//!
//! ## Ordering
//!
//! Pending tasks are ordered by due time, then by post order. Plain posts are
//! due immediately, which makes them FIFO; timed posts (used by
//! [`WorkQueue::post_every`]) wait in the same structure until due.

use crate::registry::{anonymous_name, Registry, RegistryError};
use once_cell::sync::Lazy;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Prefix carried by every auto-generated queue name.
pub const ANONYMOUS_PREFIX: &str = "WorkQueue";

static QUEUES: Lazy<Registry<WorkQueue>> = Lazy::new(Registry::new);

/// A deferred unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// What a periodic callable wants after each invocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Repeat {
    Continue,
    Stop,
}

impl From<bool> for Repeat {
    fn from(keep_going: bool) -> Self {
        if keep_going {
            Repeat::Continue
        } else {
            Repeat::Stop
        }
    }
}

struct Scheduled {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // BinaryHeap is a max-heap; invert so the earliest (due, seq) pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    closed: bool,
    next_seq: u64,
    pending: BinaryHeap<Scheduled>,
    /// One entry per run call in progress, nested calls included.
    runners: Vec<ThreadId>,
}

/// What the run loop found when it looked at the queue.
enum Poll {
    Ready(Task),
    /// Nothing ready; the earliest pending task (if any) is due at this time.
    Idle(Option<Instant>),
    Done,
}

#[cfg(feature = "metrics")]
struct QueueMetrics {
    counter: sluice_metrics::Counter,
    timer: sluice_metrics::TaskTimer,
}

/// Snapshot returned by [`WorkQueue::stats`].
#[cfg(feature = "metrics")]
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStats {
    /// `tasks_run`, `tasks_dropped` and `tasks_panicked`, by name.
    pub counters: Vec<(&'static str, u64)>,
    /// Rolling task times over the recent window, in milliseconds.
    pub average_ms: f64,
    pub fastest_ms: f64,
    pub slowest_ms: f64,
    pub last_ms: Option<f64>,
}

/// Named, thread-safe task queue.
pub struct WorkQueue {
    name: String,
    state: Mutex<QueueState>,
    wakeup: Condvar,
    #[cfg(feature = "metrics")]
    stats: Mutex<QueueMetrics>,
}

impl WorkQueue {
    /// Create and register a queue under an explicit name.
    ///
    /// Fails if another live queue already owns the name.
    pub fn new(name: impl Into<String>) -> Result<Arc<Self>, QueueError> {
        let queue = Arc::new(Self::construct(name.into()));
        QUEUES.register(&queue.name, &queue)?;
        tracing::debug!(queue = %queue.name, "work queue created");
        Ok(queue)
    }

    /// Create and register a queue with an auto-generated name
    /// (`WorkQueue1`, `WorkQueue2`, ...).
    pub fn unnamed() -> Arc<Self> {
        loop {
            let queue = Arc::new(Self::construct(anonymous_name(ANONYMOUS_PREFIX)));
            // Only collides if someone explicitly claimed a generated name.
            if QUEUES.register(&queue.name, &queue).is_ok() {
                tracing::debug!(queue = %queue.name, "work queue created");
                return queue;
            }
        }
    }

    fn construct(name: String) -> Self {
        Self {
            name,
            state: Mutex::new(QueueState::default()),
            wakeup: Condvar::new(),
            #[cfg(feature = "metrics")]
            stats: Mutex::new(QueueMetrics {
                counter: sluice_metrics::Counter::new(),
                timer: sluice_metrics::TaskTimer::new(128),
            }),
        }
    }

    /// Find a live queue by name.
    pub fn instance(name: &str) -> Option<Arc<Self>> {
        QUEUES.lookup(name)
    }

    /// Names of every live queue.
    pub fn instance_names() -> Vec<String> {
        QUEUES.names()
    }

    pub fn key(&self) -> &str {
        &self.name
    }

    pub fn weak(self: &Arc<Self>) -> Weak<Self> {
        Arc::downgrade(self)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Posting
    // ------------------------------------------------------------------

    /// Enqueue `task`. Silently dropped if the queue is closed.
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(None, Box::new(task));
    }

    /// Enqueue `task` to run no earlier than `due`.
    pub fn post_at<F>(&self, due: Instant, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Some(due), Box::new(task));
    }

    /// Enqueue `task` to run no earlier than `delay` from now.
    pub fn post_after<F>(&self, delay: Duration, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_at(Instant::now() + delay, task);
    }

    fn enqueue(&self, due: Option<Instant>, task: Task) -> bool {
        let mut state = self.lock();
        if state.closed {
            drop(state);
            tracing::debug!(queue = %self.name, "post to closed queue dropped");
            sluice_metrics::metrics! {
                self.record("tasks_dropped");
            }
            // `task` drops here, outside the lock: its captures may post.
            return false;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.push(Scheduled {
            due: due.unwrap_or_else(Instant::now),
            seq,
            task,
        });
        drop(state);
        self.wakeup.notify_all();
        true
    }

    /// Call `callable` now and then every `interval` until it returns
    /// [`Repeat::Stop`] or the queue closes.
    ///
    /// The interval runs from the start of one invocation to the start of
    /// the next, so time spent inside `callable` does not push the schedule
    /// back.
    pub fn post_every<F, R>(self: &Arc<Self>, interval: Duration, callable: F)
    where
        F: FnMut() -> R + Send + 'static,
        R: Into<Repeat>,
    {
        let periodic = Periodic {
            queue: self.weak(),
            interval,
            callable,
        };
        self.post(move || periodic.run());
    }

    /// Run `work` on `dest`, then run `callback(result)` back on this queue.
    ///
    /// The callback is always delivered through a task posted to `self`, so
    /// it executes on this queue's runner and never on `dest`'s. Returns
    /// `false` if `dest` is closed. If this queue is gone or closed by the
    /// time `work` finishes, the result is dropped.
    pub fn post_to<W, R, C>(self: &Arc<Self>, dest: &WorkQueue, work: W, callback: C) -> bool
    where
        W: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
        C: FnOnce(R) + Send + 'static,
    {
        let origin = self.weak();
        let origin_name = self.name.clone();
        dest.enqueue(
            None,
            Box::new(move || {
                let result = work();
                match origin.upgrade() {
                    Some(origin) => {
                        if !origin.enqueue(None, Box::new(move || callback(result))) {
                            tracing::debug!(queue = %origin_name, "origin closed; post_to callback dropped");
                        }
                    }
                    None => {
                        tracing::debug!(queue = %origin_name, "origin gone; post_to callback dropped");
                    }
                }
            }),
        )
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Stop accepting new tasks. Tasks already queued remain runnable.
    pub fn close(&self) {
        let mut state = self.lock();
        if !state.closed {
            state.closed = true;
            tracing::debug!(queue = %self.name, pending = state.pending.len(), "work queue closed");
        }
        drop(state);
        self.wakeup.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Closed and fully drained.
    pub fn is_done(&self) -> bool {
        let state = self.lock();
        state.closed && state.pending.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Whether a thread other than the caller is inside one of the run
    /// methods right now.
    pub fn has_other_runner(&self) -> bool {
        let me = thread::current().id();
        self.lock().runners.iter().any(|runner| *runner != me)
    }

    fn enter_runner(&self) -> RunnerGuard<'_> {
        self.lock().runners.push(thread::current().id());
        RunnerGuard { queue: self }
    }

    // ------------------------------------------------------------------
    // Running
    // ------------------------------------------------------------------

    fn poll(&self, state: &mut QueueState, now: Instant) -> Poll {
        match state.pending.peek() {
            Some(next) if next.due <= now => match state.pending.pop() {
                Some(scheduled) => Poll::Ready(scheduled.task),
                None => Poll::Idle(None),
            },
            Some(next) => Poll::Idle(Some(next.due)),
            None if state.closed => Poll::Done,
            None => Poll::Idle(None),
        }
    }

    /// Run the next ready task, if any. Never blocks.
    pub fn run_one(&self) -> bool {
        let _runner = self.enter_runner();
        let polled = {
            let mut state = self.lock();
            self.poll(&mut state, Instant::now())
        };
        match polled {
            Poll::Ready(task) => {
                self.execute(task);
                true
            }
            Poll::Idle(_) | Poll::Done => false,
        }
    }

    /// Run every ready task, without waiting for more. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }

    /// Block up to `timeout` for one ready task and run it.
    pub fn wait_one(&self, timeout: Duration) -> bool {
        let _runner = self.enter_runner();
        self.run_next(Some(Instant::now() + timeout)) == Some(true)
    }

    /// Run tasks until the queue is closed and drained.
    pub fn run_until_close(&self) {
        let _runner = self.enter_runner();
        while self.run_next(None).is_some() {}
        tracing::debug!(queue = %self.name, "run loop finished");
    }

    /// Run tasks for at most `duration`. Returns `true` if the queue was
    /// closed and drained before the time ran out.
    pub fn run_for(&self, duration: Duration) -> bool {
        self.run_until(Instant::now() + duration)
    }

    /// Run tasks until `deadline`. Returns `true` if the queue was closed and
    /// drained first.
    pub fn run_until(&self, deadline: Instant) -> bool {
        let _runner = self.enter_runner();
        loop {
            match self.run_next(Some(deadline)) {
                Some(true) => continue,
                Some(false) => return true,
                None => return self.is_done(),
            }
        }
    }

    /// Wait for and run one task.
    ///
    /// `Some(true)`: a task ran. `Some(false)`: closed and drained.
    /// `None`: `deadline` passed first.
    fn run_next(&self, deadline: Option<Instant>) -> Option<bool> {
        let mut state = self.lock();
        loop {
            let now = Instant::now();
            let wake_at = match self.poll(&mut state, now) {
                Poll::Ready(task) => {
                    drop(state);
                    self.execute(task);
                    return Some(true);
                }
                Poll::Done => {
                    return if deadline.is_none() { None } else { Some(false) };
                }
                Poll::Idle(next_due) => match (next_due, deadline) {
                    (Some(due), Some(limit)) => Some(due.min(limit)),
                    (due, limit) => due.or(limit),
                },
            };

            if deadline.is_some_and(|limit| now >= limit) {
                return None;
            }

            state = match wake_at {
                Some(at) => {
                    let timeout = at.saturating_duration_since(now);
                    self.wakeup
                        .wait_timeout(state, timeout)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .wakeup
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    fn execute(&self, task: Task) {
        #[cfg(feature = "metrics")]
        let started = std::time::Instant::now();

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "<non-string panic>".to_string());
            tracing::error!(queue = %self.name, %message, "task panicked");
            sluice_metrics::metrics! {
                self.record("tasks_panicked");
            }
        }

        sluice_metrics::metrics! {
            let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
            stats.counter.increment("tasks_run", 1);
            stats.timer.end(started);
        }
    }

    #[cfg(feature = "metrics")]
    fn record(&self, name: &'static str) {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .counter
            .increment(name, 1);
    }

    #[cfg(feature = "metrics")]
    pub fn stats(&self) -> QueueStats {
        let stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        let (fastest_ms, slowest_ms) = stats.timer.range_ms();
        QueueStats {
            counters: stats.counter.snapshot(),
            average_ms: stats.timer.average_ms(),
            fastest_ms,
            slowest_ms,
            last_ms: stats.timer.last_ms(),
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        QUEUES.unregister_if_dead(&self.name);
        tracing::debug!(queue = %self.name, "work queue destroyed");
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("WorkQueue")
            .field("name", &self.name)
            .field("closed", &state.closed)
            .field("pending", &state.pending.len())
            .finish()
    }
}

/// Marks the current thread as running a queue until dropped.
struct RunnerGuard<'a> {
    queue: &'a WorkQueue,
}

impl Drop for RunnerGuard<'_> {
    fn drop(&mut self) {
        let me = thread::current().id();
        let mut state = self.queue.lock();
        if let Some(slot) = state.runners.iter().position(|runner| *runner == me) {
            state.runners.swap_remove(slot);
        }
    }
}

struct Periodic<F> {
    queue: Weak<WorkQueue>,
    interval: Duration,
    callable: F,
}

impl<F, R> Periodic<F>
where
    F: FnMut() -> R + Send + 'static,
    R: Into<Repeat>,
{
    fn run(mut self) {
        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        if queue.is_closed() {
            tracing::debug!(queue = %queue.name, "queue closed; periodic task stopped");
            return;
        }
        let started = Instant::now();
        if (self.callable)().into() == Repeat::Continue {
            queue.post_at(started + self.interval, move || self.run());
        }
    }
}
