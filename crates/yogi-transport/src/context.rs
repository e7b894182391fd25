//! The cooperative single-threaded execution engine every branch runs
//! its completion handlers on.
//!
//! Lives in this crate (rather than `yogi-core`) because the TCP
//! acceptor/connector in `yogi-transport-tcp` need it to drive their
//! accept loops and post completions, and `yogi-core` already depends on
//! `yogi-transport` for the error domain, so this is the shared
//! foundation both layer on.
//!
//! [`Context`] is a concrete scheduler: a task queue guarded by a
//! [`parking_lot::Mutex`] + [`parking_lot::Condvar`] pair so that
//! [`Context::post`] is callable from any thread, while every completion
//! handler still only ever runs on a thread that is currently inside
//! [`Context::poll`], [`Context::run`] or [`Context::run_one`].
//!
//! Actual asynchronous I/O (TCP connect/accept/read/write, UDP send/recv,
//! timer sleeps) is driven by a `tokio` runtime owned by the `Context`;
//! when such a future resolves, its continuation is posted back onto the
//! task queue rather than being invoked directly from the tokio worker
//! thread, which is what gives callers of this context a single-threaded
//! completion-handler guarantee: no two completion handlers ever run
//! concurrently with each other.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::YogiErrorCode;

/// A unit of work posted to a [`Context`]. Tasks are boxed `FnOnce`
/// closures (not futures) so that ordinary completion handlers do not
/// need to allocate a `Future` machine just to run once.
pub type BoxTask = Box<dyn FnOnce(&Context) + Send + 'static>;

struct Shared {
    queue: Mutex<VecDeque<BoxTask>>,
    queue_cv: Condvar,
    stop_requested: AtomicBool,
    running: AtomicBool,
    running_cv: Condvar,
    running_lock: Mutex<()>,
    background: Mutex<Option<std::thread::JoinHandle<()>>>,
    tokio_rt: tokio::runtime::Runtime,
}

/// The cooperative scheduler every other component in this workspace is
/// built on top of.
#[derive(Clone)]
pub struct Context {
    shared: Arc<Shared>,
}

impl Context {
    /// Builds a new context with its own background `tokio` runtime for
    /// driving asynchronous I/O.
    pub fn new() -> std::io::Result<Self> {
        let tokio_rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        Ok(Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                queue_cv: Condvar::new(),
                stop_requested: AtomicBool::new(false),
                running: AtomicBool::new(false),
                running_cv: Condvar::new(),
                running_lock: Mutex::new(()),
                background: Mutex::new(None),
                tokio_rt,
            }),
        })
    }

    /// Enqueues a task. Safe to call from any thread, including from
    /// inside another task running on this same context.
    pub fn post(&self, task: impl FnOnce(&Context) + Send + 'static) {
        let mut queue = self.shared.queue.lock();
        queue.push_back(Box::new(task));
        // Posting new work after a stop implicitly resets the stop
        // request once nothing is currently executing.
        if self.shared.stop_requested.load(Ordering::Acquire) && !self.is_running() {
            self.shared.stop_requested.store(false, Ordering::Release);
        }
        self.shared.queue_cv.notify_all();
    }

    /// Spawns `fut` onto the context's internal `tokio` runtime and posts
    /// `on_complete` back onto this context's task queue once it
    /// resolves. This is the seam every async submission in this
    /// workspace (byte transport I/O, timers, discovery sockets) uses to
    /// turn a `tokio` future into a context-owned completion handler.
    pub fn spawn_io<F, T>(&self, fut: F, on_complete: impl FnOnce(&Context, T) + Send + 'static)
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let ctx = self.clone();
        self.shared.tokio_rt.spawn(async move {
            let value = fut.await;
            ctx.post(move |ctx| on_complete(ctx, value));
        });
    }

    /// Handle to the internal `tokio` runtime, for components (byte
    /// transport, discovery sockets) that need to `spawn` long-running
    /// background tasks such as a continuous RX loop.
    pub fn io_handle(&self) -> tokio::runtime::Handle {
        self.shared.tokio_rt.handle().clone()
    }

    /// Executes all currently-ready tasks without blocking. Returns the
    /// number of tasks run.
    pub fn poll(&self) -> usize {
        self.run_impl(Some(Duration::ZERO), false)
    }

    /// Executes at most one currently-ready task without blocking.
    pub fn poll_one(&self) -> usize {
        self.run_impl(Some(Duration::ZERO), true)
    }

    /// Runs tasks, blocking up to `timeout` waiting for at least one to
    /// become ready, then drains every task that is ready at that point.
    /// `Duration::MAX` blocks until [`Context::stop`] or a task runs.
    pub fn run(&self, timeout: Duration) -> usize {
        self.run_impl(Some(timeout), false)
    }

    /// Like [`Context::run`] but executes at most one task.
    pub fn run_one(&self, timeout: Duration) -> usize {
        self.run_impl(Some(timeout), true)
    }

    fn run_impl(&self, timeout: Option<Duration>, one_shot: bool) -> usize {
        if self.shared.stop_requested.load(Ordering::Acquire) {
            return 0;
        }
        self.mark_running(true);
        let mut count = 0usize;
        let deadline = timeout.map(|t| {
            if t >= Duration::from_secs(3650 * 24 * 3600) {
                None
            } else {
                Some(Instant::now() + t)
            }
        });
        loop {
            if self.shared.stop_requested.load(Ordering::Acquire) {
                break;
            }
            let mut queue = self.shared.queue.lock();
            if queue.is_empty() {
                match deadline {
                    Some(None) => {
                        self.shared.queue_cv.wait(&mut queue);
                    }
                    Some(Some(d)) => {
                        let now = Instant::now();
                        if now >= d {
                            break;
                        }
                        let result = self.shared.queue_cv.wait_for(&mut queue, d - now);
                        if result.timed_out() && queue.is_empty() {
                            break;
                        }
                    }
                    None => break,
                }
                if queue.is_empty() {
                    continue;
                }
            }
            let task = queue.pop_front();
            drop(queue);
            if let Some(task) = task {
                task(self);
                count += 1;
                if one_shot {
                    break;
                }
            }
            if one_shot {
                break;
            }
            // After draining what was ready, stop gathering more once the
            // queue empties again -- `run` processes "what's ready now",
            // not an unbounded future stream.
            if self.shared.queue.lock().is_empty() {
                break;
            }
        }
        self.mark_running(false);
        count
    }

    /// Spawns a background worker thread that performs `run(infinite)`
    /// repeatedly until [`Context::stop`] is observed. Exactly one
    /// background worker may be active per context.
    pub fn run_in_background(&self) -> Result<(), YogiErrorCode> {
        let mut background = self.shared.background.lock();
        if background.is_some() {
            return Err(YogiErrorCode::Busy);
        }
        let ctx = self.clone();
        *background = Some(std::thread::spawn(move || {
            loop {
                if ctx.shared.stop_requested.load(Ordering::Acquire) {
                    break;
                }
                ctx.run(Duration::from_secs(3650 * 24 * 3600));
                if ctx.shared.stop_requested.load(Ordering::Acquire) {
                    break;
                }
            }
        }));
        Ok(())
    }

    /// Requests the executor to return at the next scheduling point.
    pub fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::Release);
        self.shared.queue_cv.notify_all();
        self.shared.running_cv.notify_all();
    }

    /// Blocks the calling thread until this context is observably running
    /// (some thread is currently inside `poll`/`run`/`run_one`), or
    /// returns `Err(Timeout)` on expiry.
    pub fn wait_for_running(&self, timeout: Duration) -> Result<(), YogiErrorCode> {
        self.wait_for_state(true, timeout)
    }

    /// Blocks the calling thread until this context is observably not
    /// running, or returns `Err(Timeout)` on expiry.
    pub fn wait_for_stopped(&self, timeout: Duration) -> Result<(), YogiErrorCode> {
        self.wait_for_state(false, timeout)
    }

    fn wait_for_state(&self, want_running: bool, timeout: Duration) -> Result<(), YogiErrorCode> {
        let mut guard = self.shared.running_lock.lock();
        let deadline = Instant::now() + timeout;
        while self.is_running() != want_running {
            let now = Instant::now();
            if now >= deadline {
                return Err(YogiErrorCode::Timeout);
            }
            let result = self.shared.running_cv.wait_for(&mut guard, deadline - now);
            if result.timed_out() && self.is_running() != want_running {
                return Err(YogiErrorCode::Timeout);
            }
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    fn mark_running(&self, running: bool) {
        let _guard = self.shared.running_lock.lock();
        self.shared.running.store(running, Ordering::Release);
        self.shared.running_cv.notify_all();
    }
}

/// A cooperative cancellation flag shared between the issuer of an async
/// operation and its completion handler.
#[derive(Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A per-operation deadline; `Infinite` never expires.
#[derive(Clone, Copy, Debug)]
pub enum Deadline {
    Infinite,
    At(Instant),
}

impl Deadline {
    pub fn from_timeout(timeout: Duration) -> Self {
        Self::At(Instant::now() + timeout)
    }

    pub fn is_expired(&self) -> bool {
        match self {
            Self::Infinite => false,
            Self::At(instant) => Instant::now() >= *instant,
        }
    }

    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Self::Infinite => None,
            Self::At(instant) => Some(instant.saturating_duration_since(Instant::now())),
        }
    }
}

/// The per-operation context threaded through every async submission in
/// this workspace: byte-transport reads/writes, message-transport
/// sends/receives, discovery sockets, and the handshake state machine.
/// Bundles cancellation and deadline together so it can be cloned
/// cheaply per call.
#[derive(Clone)]
pub struct CallContext {
    cancellation: Cancellation,
    deadline: Deadline,
}

impl CallContext {
    pub fn new(deadline: Deadline) -> Self {
        Self {
            cancellation: Cancellation::new(),
            deadline,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(Deadline::from_timeout(timeout))
    }

    pub fn infinite() -> Self {
        Self::new(Deadline::Infinite)
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// A `Context`-bound one-shot timer.
///
/// `start` arms the timer on the owning `Context`'s `tokio` runtime;
/// expiry (or cancellation) posts the handler back onto the `Context`
/// so it runs under `poll`/`run`/`run_one` like every other completion
/// in this workspace. Re-arming a still-armed timer completes the
/// previous handler with `Canceled` synchronously (before the new one
/// arms), matching the "only one armed handler at a time" contract.
type TimerHandler = Box<dyn FnOnce(&Context, Result<(), YogiErrorCode>) + Send>;

struct ArmedTimer {
    generation: u64,
    handler: TimerHandler,
}

pub struct Timer {
    context: Context,
    next_generation: Arc<std::sync::atomic::AtomicU64>,
    armed: Arc<Mutex<Option<ArmedTimer>>>,
}

impl Timer {
    pub fn new(context: Context) -> Self {
        Self {
            context,
            next_generation: Arc::new(std::sync::atomic::AtomicU64::new(1)),
            armed: Arc::new(Mutex::new(None)),
        }
    }

    /// Arms the timer to fire `handler(Ok(()))` after `duration`, or
    /// `handler(Err(Canceled))` if canceled or superseded first. If a
    /// handler is already armed, it completes with `Canceled` before
    /// this call returns.
    pub fn start(
        &self,
        duration: Duration,
        handler: impl FnOnce(&Context, Result<(), YogiErrorCode>) + Send + 'static,
    ) {
        let generation = self.next_generation.fetch_add(1, Ordering::AcqRel);
        let previous = self.armed.lock().replace(ArmedTimer {
            generation,
            handler: Box::new(handler),
        });
        if let Some(previous) = previous {
            (previous.handler)(&self.context, Err(YogiErrorCode::Canceled));
        }

        let armed = Arc::clone(&self.armed);
        self.context.spawn_io(
            async move {
                tokio::time::sleep(duration).await;
            },
            move |ctx, ()| {
                let fired = {
                    let mut guard = armed.lock();
                    match guard.as_ref() {
                        Some(current) if current.generation == generation => guard.take(),
                        _ => None,
                    }
                };
                if let Some(fired) = fired {
                    (fired.handler)(ctx, Ok(()));
                }
            },
        );
    }

    /// Completes the armed handler (if any) with `Canceled`. Returns
    /// `false` if nothing was armed.
    pub fn cancel(&self) -> bool {
        match self.armed.lock().take() {
            Some(armed) => {
                self.context
                    .post(move |ctx| (armed.handler)(ctx, Err(YogiErrorCode::Canceled)));
                true
            }
            None => false,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        // Destroying a timer while armed must still invoke the handler,
        // with `canceled`.
        if let Some(armed) = self.armed.lock().take() {
            self.context
                .post(move |ctx| (armed.handler)(ctx, Err(YogiErrorCode::Canceled)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn post_from_other_thread_runs_under_poll() {
        let ctx = Context::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let posting_ctx = ctx.clone();
        let handle = std::thread::spawn(move || {
            posting_ctx.post(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });
        });
        handle.join().unwrap();
        // spin briefly until the task lands in the queue
        for _ in 0..1000 {
            if ctx.poll() > 0 {
                break;
            }
            std::thread::yield_now();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_in_background_executes_posted_tasks_then_stops() {
        let ctx = Context::new().unwrap();
        ctx.run_in_background().unwrap();
        ctx.wait_for_running(Duration::from_secs(1)).unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        ctx.post(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        ctx.stop();
        ctx.wait_for_stopped(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn run_in_background_twice_is_busy() {
        let ctx = Context::new().unwrap();
        ctx.run_in_background().unwrap();
        ctx.wait_for_running(Duration::from_secs(1)).unwrap();
        let err = ctx.run_in_background().unwrap_err();
        assert_eq!(err, YogiErrorCode::Busy);
        ctx.stop();
    }

    #[test]
    fn poll_without_tasks_returns_zero_immediately() {
        let ctx = Context::new().unwrap();
        assert_eq!(ctx.poll(), 0);
    }

    #[test]
    fn timer_fires_ok_after_duration() {
        let ctx = Context::new().unwrap();
        let timer = Timer::new(ctx.clone());
        let result = Arc::new(Mutex::new(None));
        let r = Arc::clone(&result);
        timer.start(Duration::from_millis(1), move |_, outcome| {
            *r.lock() = Some(outcome);
        });
        ctx.run(Duration::from_secs(1));
        assert_eq!(*result.lock(), Some(Ok(())));
    }

    #[test]
    fn timer_cancel_completes_with_canceled() {
        let ctx = Context::new().unwrap();
        let timer = Timer::new(ctx.clone());
        let result = Arc::new(Mutex::new(None));
        let r = Arc::clone(&result);
        timer.start(Duration::from_secs(3650 * 24 * 3600), move |_, outcome| {
            *r.lock() = Some(outcome);
        });
        assert!(timer.cancel());
        ctx.run(Duration::from_secs(1));
        assert_eq!(*result.lock(), Some(Err(YogiErrorCode::Canceled)));
        assert!(!timer.cancel());
    }

    #[test]
    fn starting_while_armed_cancels_previous_handler() {
        let ctx = Context::new().unwrap();
        let timer = Timer::new(ctx.clone());
        let first_outcome = Arc::new(Mutex::new(None));
        let f = Arc::clone(&first_outcome);
        timer.start(Duration::from_secs(3650 * 24 * 3600), move |_, outcome| {
            *f.lock() = Some(outcome);
        });
        assert_eq!(*first_outcome.lock(), Some(Err(YogiErrorCode::Canceled)));

        let second_outcome = Arc::new(Mutex::new(None));
        let s = Arc::clone(&second_outcome);
        timer.start(Duration::from_millis(1), move |_, outcome| {
            *s.lock() = Some(outcome);
        });
        ctx.run(Duration::from_secs(1));
        assert_eq!(*second_outcome.lock(), Some(Ok(())));
    }

    #[test]
    fn dropping_armed_timer_cancels_handler() {
        let ctx = Context::new().unwrap();
        let result = Arc::new(Mutex::new(None));
        {
            let timer = Timer::new(ctx.clone());
            let r = Arc::clone(&result);
            timer.start(Duration::from_secs(3650 * 24 * 3600), move |_, outcome| {
                *r.lock() = Some(outcome);
            });
        }
        ctx.run(Duration::from_secs(1));
        assert_eq!(*result.lock(), Some(Err(YogiErrorCode::Canceled)));
    }
}
