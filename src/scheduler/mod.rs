//! Cooperative main loop.
//!
//! All protocol work runs on one loop: timer sources fire the transaction
//! timers, socket sources dispatch transport readiness, and other threads
//! hand work to the loop through [`MainLoop::do_later`]. One `iterate()`
//! pass waits until something is due, drains the deferred-task queue, fires
//! expired timers in registration order, then dispatches socket readiness.
//!
//! The loop never performs I/O; channels mark their own sources ready via
//! [`MainLoop::mark_ready`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Identifier of a registered source. Ids are allocated monotonically, so
/// id order is registration order; expiry ties are broken by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

/// What a source watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Timer,
    Socket,
}

/// Bit-set of events delivered to a source callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSet(u8);

impl EventSet {
    pub const NONE: EventSet = EventSet(0);
    pub const READ: EventSet = EventSet(1);
    pub const WRITE: EventSet = EventSet(1 << 1);
    pub const ERROR: EventSet = EventSet(1 << 2);
    pub const TIMEOUT: EventSet = EventSet(1 << 3);

    pub fn contains(&self, other: EventSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: EventSet) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for EventSet {
    type Output = EventSet;
    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

/// Returned by a timer callback to decide the source's fate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutResult {
    /// Remove the source.
    Stop,
    /// Re-arm relative to the previous expected expiry, so periodic timers
    /// keep their phase even when a pass runs late.
    Continue,
    /// Re-arm relative to now, dropping any accumulated lag.
    ContinueWithoutCatchup,
}

/// Source callback. Receives the events that fired and decides whether the
/// source stays registered.
pub type SourceCallback = Box<dyn FnMut(EventSet) -> TimeoutResult + Send + 'static>;

struct SourceState {
    /// Next expiry; `None` while the timer is disabled.
    expiry: Option<Instant>,
    /// Interval in milliseconds; negative disables re-arming.
    interval_ms: i64,
    /// Readiness injected by `mark_ready`, drained on dispatch.
    pending: EventSet,
    /// Set while this source's timeout callback runs, so `set_timeout`
    /// from inside the callback only updates the interval and lets the
    /// re-arm happen on return.
    expired: bool,
}

/// A registered event source: either a timer or a socket-readiness hook.
pub struct Source {
    id: SourceId,
    kind: SourceKind,
    name: String,
    cancelled: AtomicBool,
    state: Mutex<SourceState>,
    callback: Mutex<Option<SourceCallback>>,
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("cancelled", &self.cancelled.load(Ordering::Relaxed))
            .finish()
    }
}

impl Source {
    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Current interval in milliseconds; negative means disabled.
    pub fn timeout_ms(&self) -> i64 {
        self.lock_state().interval_ms
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SourceState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_timeout(&self, timeout_ms: i64) {
        let mut state = self.lock_state();
        state.interval_ms = timeout_ms;
        if !state.expired {
            state.expiry = if timeout_ms < 0 {
                None
            } else {
                Some(Instant::now() + Duration::from_millis(timeout_ms as u64))
            };
        }
    }
}

struct Task {
    name: String,
    run: Box<dyn FnOnce() + Send + 'static>,
}

struct MainLoopInner {
    sources: Mutex<Vec<Arc<Source>>>,
    tasks: Mutex<VecDeque<Task>>,
    wake: Notify,
    quit: AtomicBool,
    next_id: AtomicU64,
}

/// Handle to the main loop. Cheap to clone; all clones drive the same loop.
#[derive(Clone)]
pub struct MainLoop {
    inner: Arc<MainLoopInner>,
}

impl Default for MainLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl MainLoop {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MainLoopInner {
                sources: Mutex::new(Vec::new()),
                tasks: Mutex::new(VecDeque::new()),
                wake: Notify::new(),
                quit: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn alloc_id(&self) -> SourceId {
        SourceId(self.inner.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn lock_sources(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Source>>> {
        match self.inner.sources.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, VecDeque<Task>> {
        match self.inner.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Builds a one-shot timer source firing after `delay`. The callback's
    /// return value turns it periodic ([`TimeoutResult::Continue`] /
    /// [`TimeoutResult::ContinueWithoutCatchup`]).
    pub fn make_timer_source<F>(&self, delay: Duration, name: &str, callback: F) -> Arc<Source>
    where
        F: FnMut(EventSet) -> TimeoutResult + Send + 'static,
    {
        let interval_ms = delay.as_millis() as i64;
        Arc::new(Source {
            id: self.alloc_id(),
            kind: SourceKind::Timer,
            name: name.to_string(),
            cancelled: AtomicBool::new(false),
            state: Mutex::new(SourceState {
                expiry: Some(Instant::now() + delay),
                interval_ms,
                pending: EventSet::NONE,
                expired: false,
            }),
            callback: Mutex::new(Some(Box::new(callback))),
        })
    }

    /// Builds a socket source. It never fires on its own; the owning
    /// channel calls [`MainLoop::mark_ready`] when the underlying I/O is
    /// ready, and may additionally arm a timeout via
    /// [`MainLoop::set_timeout`].
    pub fn make_socket_source<F>(&self, name: &str, callback: F) -> Arc<Source>
    where
        F: FnMut(EventSet) -> TimeoutResult + Send + 'static,
    {
        Arc::new(Source {
            id: self.alloc_id(),
            kind: SourceKind::Socket,
            name: name.to_string(),
            cancelled: AtomicBool::new(false),
            state: Mutex::new(SourceState {
                expiry: None,
                interval_ms: -1,
                pending: EventSet::NONE,
                expired: false,
            }),
            callback: Mutex::new(Some(Box::new(callback))),
        })
    }

    /// Registers a source built by one of the `make_*_source` constructors.
    /// Registering the same id twice is an error.
    pub fn add_source(&self, source: Arc<Source>) -> Result<()> {
        let mut sources = self.lock_sources();
        if sources.iter().any(|s| s.id == source.id) {
            return Err(Error::SourceExists(source.id));
        }
        trace!(id = %source.id, name = %source.name, "adding source");
        sources.push(source);
        drop(sources);
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Registers a one-shot timer and returns its id.
    pub fn create_timeout<F>(&self, delay: Duration, name: &str, callback: F) -> SourceId
    where
        F: FnMut(EventSet) -> TimeoutResult + Send + 'static,
    {
        let source = self.make_timer_source(delay, name, callback);
        let id = source.id;
        self.lock_sources().push(source);
        self.inner.wake.notify_one();
        id
    }

    /// Registers a socket source and returns its id.
    pub fn add_socket_source<F>(&self, name: &str, callback: F) -> SourceId
    where
        F: FnMut(EventSet) -> TimeoutResult + Send + 'static,
    {
        let source = self.make_socket_source(name, callback);
        let id = source.id;
        self.lock_sources().push(source);
        self.inner.wake.notify_one();
        id
    }

    /// Looks up a live source by id.
    pub fn find_source(&self, id: SourceId) -> Option<Arc<Source>> {
        self.lock_sources()
            .iter()
            .find(|s| s.id == id && !s.is_cancelled())
            .cloned()
    }

    /// Re-arms a source's timeout. A negative value disables the timer
    /// without removing the source. Safe to call from within the source's
    /// own callback: the new interval then takes effect on the re-arm that
    /// follows the callback's return.
    pub fn set_timeout(&self, id: SourceId, timeout_ms: i64) -> Result<()> {
        let source = self.find_source(id).ok_or(Error::SourceNotFound(id))?;
        source.set_timeout(timeout_ms);
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Flags readiness events on a socket source. Thread-safe; wakes the
    /// loop. The events are delivered on the next pass and cleared.
    pub fn mark_ready(&self, id: SourceId, events: EventSet) -> Result<()> {
        let source = self.find_source(id).ok_or(Error::SourceNotFound(id))?;
        source.lock_state().pending.insert(events);
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Marks a source for removal. Idempotent; unknown ids are ignored.
    /// The source is unregistered at the end of the current (or next) pass
    /// and its callback is never invoked again, which makes this safe to
    /// call from any callback including the source's own.
    pub fn cancel_source(&self, id: SourceId) {
        if let Some(source) = self.find_source(id) {
            source.cancelled.store(true, Ordering::SeqCst);
            self.inner.wake.notify_one();
        }
    }

    /// Cancels and immediately unregisters a source. Returns whether it was
    /// registered. A callback currently in flight still completes, but its
    /// return value no longer re-arms anything.
    pub fn remove_source(&self, id: SourceId) -> bool {
        let mut sources = self.lock_sources();
        let before = sources.len();
        for source in sources.iter() {
            if source.id == id {
                source.cancelled.store(true, Ordering::SeqCst);
            }
        }
        sources.retain(|s| s.id != id);
        before != sources.len()
    }

    /// Queues a closure to run on the loop thread before the next timer
    /// dispatch. Thread-safe; this is the hand-off point for work
    /// originating outside the loop.
    pub fn do_later<F>(&self, name: &str, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.lock_tasks().push_back(Task {
            name: name.to_string(),
            run: Box::new(task),
        });
        self.inner.wake.notify_one();
    }

    /// Asks `run()` to return after the current pass. Thread-safe.
    pub fn quit(&self) {
        self.inner.quit.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    /// Runs passes until [`MainLoop::quit`] is called.
    pub async fn run(&self) {
        self.inner.quit.store(false, Ordering::SeqCst);
        while !self.inner.quit.load(Ordering::SeqCst) {
            self.iterate().await;
        }
        debug!("main loop exiting");
    }

    /// Runs the loop for a bounded duration, then returns.
    pub async fn run_for(&self, duration: Duration) {
        let handle = self.clone();
        let id = self.create_timeout(duration, "main loop sleep", move |_| {
            handle.quit();
            TimeoutResult::Stop
        });
        self.run().await;
        self.remove_source(id);
    }

    /// One pass: wait until something is due, drain deferred tasks, fire
    /// expired timers in registration order, dispatch socket readiness,
    /// sweep cancelled sources.
    pub async fn iterate(&self) {
        match self.next_deadline() {
            Deadline::Ready => {}
            Deadline::At(deadline) => {
                tokio::select! {
                    _ = self.inner.wake.notified() => {}
                    _ = sleep_until(deadline) => {}
                }
            }
            Deadline::Never => self.inner.wake.notified().await,
        }

        // Deferred tasks run before any timer dispatch, so cross-thread
        // work observes a consistent pre-fire state. Only the tasks queued
        // up to this point run; tasks they enqueue wait for the next pass.
        let tasks: Vec<Task> = self.lock_tasks().drain(..).collect();
        for task in tasks {
            trace!(name = %task.name, "running deferred task");
            (task.run)();
        }

        // Single sweep over a snapshot: sources added by callbacks join the
        // next pass, and a burst of timer firings cannot starve sockets.
        let snapshot: Vec<Arc<Source>> = self.lock_sources().clone();
        let now = Instant::now();

        for source in snapshot.iter().filter(|s| s.kind == SourceKind::Timer) {
            self.dispatch(source, now);
        }
        for source in snapshot.iter().filter(|s| s.kind == SourceKind::Socket) {
            self.dispatch(source, now);
        }

        self.lock_sources().retain(|s| !s.is_cancelled());
    }

    /// When the next pass has something to do. Pending tasks, pending
    /// readiness and already-expired timers all mean "now".
    fn next_deadline(&self) -> Deadline {
        if !self.lock_tasks().is_empty() || self.inner.quit.load(Ordering::SeqCst) {
            return Deadline::Ready;
        }
        let mut earliest: Option<Instant> = None;
        for source in self.lock_sources().iter() {
            if source.is_cancelled() {
                continue;
            }
            let state = source.lock_state();
            if !state.pending.is_empty() {
                return Deadline::Ready;
            }
            if let Some(expiry) = state.expiry {
                earliest = Some(match earliest {
                    Some(e) => e.min(expiry),
                    None => expiry,
                });
            }
        }
        match earliest {
            Some(deadline) if deadline <= Instant::now() => Deadline::Ready,
            Some(deadline) => Deadline::At(deadline),
            None => Deadline::Never,
        }
    }

    fn dispatch(&self, source: &Arc<Source>, now: Instant) {
        if source.is_cancelled() {
            return;
        }

        let (events, timed_out) = {
            let mut state = source.lock_state();
            let mut events = std::mem::take(&mut state.pending);
            let timed_out = state.expiry.map_or(false, |e| e <= now);
            if timed_out {
                events.insert(EventSet::TIMEOUT);
                state.expired = true;
            }
            (events, timed_out)
        };
        if events.is_empty() {
            return;
        }

        trace!(id = %source.id, name = %source.name, ?events, "firing source");
        let callback = match self.take_callback(source) {
            Some(cb) => cb,
            None => return,
        };
        let mut callback = callback;
        let result = callback(events);
        self.put_callback(source, callback);

        let mut state = source.lock_state();
        state.expired = false;
        if source.is_cancelled() {
            // A callback (this one or another) cancelled the source while
            // it was firing; the cancellation wins over the return value.
            return;
        }
        match result {
            TimeoutResult::Stop => {
                source.cancelled.store(true, Ordering::SeqCst);
            }
            TimeoutResult::Continue => {
                if timed_out {
                    if state.interval_ms < 0 {
                        state.expiry = None;
                    } else if let Some(expiry) = state.expiry {
                        state.expiry =
                            Some(expiry + Duration::from_millis(state.interval_ms as u64));
                    }
                }
            }
            TimeoutResult::ContinueWithoutCatchup => {
                if state.interval_ms < 0 {
                    state.expiry = None;
                } else {
                    state.expiry = Some(now + Duration::from_millis(state.interval_ms as u64));
                }
            }
        }
    }

    fn take_callback(&self, source: &Arc<Source>) -> Option<SourceCallback> {
        match source.callback.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn put_callback(&self, source: &Arc<Source>, callback: SourceCallback) {
        match source.callback.lock() {
            Ok(mut guard) => *guard = Some(callback),
            Err(poisoned) => *poisoned.into_inner() = Some(callback),
        }
    }
}

enum Deadline {
    /// Work is already due; do not wait.
    Ready,
    At(Instant),
    Never,
}
