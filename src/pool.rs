// Copyright (c) The testgraph Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A bounded worker pool with awaitable submission and cooperative
//! cancellation.
//!
//! The pool owns `N` named OS threads pulling from one unbounded FIFO queue.
//! Tasks may be pinned to a specific pool thread (thread-affinity support);
//! unpinned tasks go to whichever thread frees up first. Cancellation is
//! cooperative: a timeout or `shutdown_now` raises a flag that queued tasks
//! observe before starting and running tasks observe at their next
//! cancellation point. There is no forcible kill.

use crate::errors::{ConfigError, LifecycleError};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// The marker every pool thread name carries.
///
/// External code can ask [`is_framework_thread`] to detect whether it is
/// being called from inside the framework.
pub const FRAMEWORK_THREAD_MARKER: &str = "testgraph";

/// Returns true if the current thread was created by a [`WorkerPool`].
pub fn is_framework_thread() -> bool {
    thread::current()
        .name()
        .is_some_and(|name| name.contains(FRAMEWORK_THREAD_MARKER))
}

/// The identity of one pool thread, starting at 1.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct PoolThreadId(u64);

impl PoolThreadId {
    /// The numeric id.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    // 0 is the "not yet observed" sentinel in affinity slots.
    pub(crate) fn from_raw(raw: u64) -> Option<PoolThreadId> {
        (raw != 0).then_some(PoolThreadId(raw))
    }
}

impl fmt::Display for PoolThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A shared cooperative-cancellation flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag. Running work observes it at its next cancellation
    /// point; queued work never starts.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// True once the flag has been raised.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// What a task sees while executing: the thread it landed on and its
/// cancellation token.
#[derive(Clone, Debug)]
pub struct TaskContext {
    thread_id: PoolThreadId,
    cancel: CancelToken,
}

impl TaskContext {
    /// The pool thread executing the task.
    pub fn thread_id(&self) -> PoolThreadId {
        self.thread_id
    }

    /// The task's cancellation token.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

/// The outcome of a bounded wait.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitOutcome {
    /// Everything waited on completed.
    Completed,

    /// The deadline elapsed first; outstanding work was cancelled
    /// cooperatively.
    TimedOut {
        /// How many tasks were still outstanding at the deadline.
        pending: usize,
    },
}

impl WaitOutcome {
    /// True if the wait saw everything complete.
    pub fn is_completed(self) -> bool {
        matches!(self, WaitOutcome::Completed)
    }
}

#[derive(Debug)]
struct TaskState {
    done: AtomicBool,
    cancel: CancelToken,
}

/// A handle to one submitted task.
#[derive(Clone, Debug)]
pub struct TaskHandle {
    state: Arc<TaskState>,
}

impl TaskHandle {
    /// True once the task has finished (or was cancelled before starting).
    pub fn is_finished(&self) -> bool {
        self.state.done.load(Ordering::Acquire)
    }

    /// True if the task's cancellation flag has been raised.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancel.is_cancelled()
    }

    /// Raises the task's cancellation flag.
    pub fn cancel(&self) {
        self.state.cancel.cancel();
    }
}

type Task = Box<dyn FnOnce(&TaskContext) + Send + 'static>;

struct QueuedTask {
    task: Task,
    pin: Option<PoolThreadId>,
    state: Arc<TaskState>,
    seq: u64,
}

struct PoolState {
    queue: VecDeque<QueuedTask>,
    running: HashMap<u64, CancelToken>,
    outstanding: usize,
    next_seq: u64,
    shutdown: bool,
}

struct PoolInner {
    name: String,
    state: Mutex<PoolState>,
    work: Condvar,
    idle: Condvar,
}

/// A fixed-size pool of named worker threads with a FIFO queue.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    threads: usize,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.name)
            .field("threads", &self.threads)
            .finish()
    }
}

impl WorkerPool {
    /// Creates a pool with `threads` workers named
    /// `testgraph-{name}-{idx}`.
    pub fn new(threads: usize, name: impl Into<String>) -> Result<Self, ConfigError> {
        let name = name.into();
        if threads < 1 {
            return Err(ConfigError::InvalidThreadCount {
                pool: name,
                requested: threads,
            });
        }

        let inner = Arc::new(PoolInner {
            name: name.clone(),
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                running: HashMap::new(),
                outstanding: 0,
                next_seq: 0,
                shutdown: false,
            }),
            work: Condvar::new(),
            idle: Condvar::new(),
        });

        for idx in 0..threads {
            let thread_id = PoolThreadId(idx as u64 + 1);
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name(format!("{FRAMEWORK_THREAD_MARKER}-{name}-{}", idx + 1))
                .spawn(move || worker_loop(inner, thread_id))
                .map_err(|error| ConfigError::ThreadSpawn {
                    pool: name.clone(),
                    message: error.to_string(),
                })?;
        }

        Ok(Self { inner, threads })
    }

    /// The pool name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The number of worker threads.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Enqueues a task on any thread.
    pub fn submit(
        &self,
        task: impl FnOnce(&TaskContext) + Send + 'static,
    ) -> Result<TaskHandle, LifecycleError> {
        self.submit_pinned(task, None)
    }

    /// Enqueues a task, optionally pinned to one pool thread.
    ///
    /// A pin outside the pool's thread range is ignored with a warning: the
    /// task runs on any thread rather than never running.
    pub fn submit_pinned(
        &self,
        task: impl FnOnce(&TaskContext) + Send + 'static,
        pin: Option<PoolThreadId>,
    ) -> Result<TaskHandle, LifecycleError> {
        let pin = match pin {
            Some(id) if id.as_u64() == 0 || id.as_u64() > self.threads as u64 => {
                warn!(
                    "pool `{}`: pin to thread {id} out of range, running unpinned",
                    self.inner.name
                );
                None
            }
            other => other,
        };

        let mut state = self.inner.state.lock();
        if state.shutdown {
            return Err(LifecycleError::SubmitAfterShutdown {
                pool: self.inner.name.clone(),
            });
        }
        let task_state = Arc::new(TaskState {
            done: AtomicBool::new(false),
            cancel: CancelToken::new(),
        });
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push_back(QueuedTask {
            task: Box::new(task),
            pin,
            state: Arc::clone(&task_state),
            seq,
        });
        state.outstanding += 1;
        // Pinned tasks need their specific thread awake, so wake everyone.
        self.inner.work.notify_all();
        Ok(TaskHandle { state: task_state })
    }

    /// Blocks until every handle finishes or the timeout elapses.
    ///
    /// On timeout the outstanding tasks are cancelled cooperatively and
    /// [`WaitOutcome::TimedOut`] is returned; already-running tasks keep
    /// running until their next cancellation point.
    pub fn await_all(&self, handles: &[TaskHandle], timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.inner.state.lock();
        loop {
            let pending = handles.iter().filter(|h| !h.is_finished()).count();
            if pending == 0 {
                return WaitOutcome::Completed;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!(
                            "pool `{}`: wait timed out with {pending} tasks outstanding",
                            self.inner.name
                        );
                        for handle in handles {
                            if !handle.is_finished() {
                                handle.cancel();
                            }
                        }
                        // Wake the workers so cancelled queued tasks drain.
                        self.inner.work.notify_all();
                        return WaitOutcome::TimedOut { pending };
                    }
                    self.inner.idle.wait_for(&mut state, deadline - now);
                }
                None => self.inner.idle.wait(&mut state),
            }
        }
    }

    /// Blocks until the pool has been shut down and drained.
    pub fn await_termination(&self, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.inner.state.lock();
        loop {
            if state.shutdown && state.outstanding == 0 {
                return WaitOutcome::Completed;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::TimedOut {
                            pending: state.outstanding,
                        };
                    }
                    self.inner.idle.wait_for(&mut state, deadline - now);
                }
                None => self.inner.idle.wait(&mut state),
            }
        }
    }

    /// Stops accepting work and lets the queue drain.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        self.inner.work.notify_all();
        self.inner.idle.notify_all();
    }

    /// Stops accepting work, discards queued tasks and signals cancellation
    /// to running ones.
    pub fn shutdown_now(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        while let Some(queued) = state.queue.pop_front() {
            queued.state.cancel.cancel();
            queued.state.done.store(true, Ordering::Release);
            state.outstanding -= 1;
        }
        for token in state.running.values() {
            token.cancel();
        }
        self.inner.work.notify_all();
        self.inner.idle.notify_all();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Threads hold their own reference to the inner state; release them.
        self.shutdown();
    }
}

fn worker_loop(inner: Arc<PoolInner>, thread_id: PoolThreadId) {
    loop {
        let queued = {
            let mut state = inner.state.lock();
            loop {
                let eligible = state
                    .queue
                    .iter()
                    .position(|task| task.pin.map_or(true, |pin| pin == thread_id));
                if let Some(pos) = eligible {
                    let queued = state.queue.remove(pos).expect("position comes from scan");
                    state.running.insert(queued.seq, queued.state.cancel.clone());
                    break queued;
                }
                if state.shutdown && state.queue.is_empty() {
                    return;
                }
                inner.work.wait(&mut state);
            }
        };

        if queued.state.cancel.is_cancelled() {
            debug!(
                "pool `{}`: task cancelled before start, discarding",
                inner.name
            );
        } else {
            let cx = TaskContext {
                thread_id,
                cancel: queued.state.cancel.clone(),
            };
            if catch_unwind(AssertUnwindSafe(|| (queued.task)(&cx))).is_err() {
                warn!("pool `{}`: task panicked on thread {thread_id}", inner.name);
            }
        }

        let mut state = inner.state.lock();
        state.running.remove(&queued.seq);
        state.outstanding -= 1;
        queued.state.done.store(true, Ordering::Release);
        inner.idle.notify_all();
        if state.shutdown && state.queue.is_empty() {
            // Wake sibling workers so they can observe the drain and exit.
            inner.work.notify_all();
        }
    }
}

/// Lazily shares one worker pool across a suite, per the pool reuse policy.
///
/// Created once per suite; the first fan-out that asks for a shared pool
/// fixes its size. [`shutdown`](Self::shutdown) runs at the end of the
/// suite.
#[derive(Debug, Default)]
pub struct SharedPools {
    pool: Mutex<Option<Arc<WorkerPool>>>,
}

impl SharedPools {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared pool, creating it through `factory` on first use.
    pub fn get_or_create(
        &self,
        threads: usize,
        name: &str,
        factory: &dyn crate::invoker::PoolFactory,
    ) -> Result<Arc<WorkerPool>, ConfigError> {
        let mut guard = self.pool.lock();
        if let Some(pool) = guard.as_ref() {
            return Ok(Arc::clone(pool));
        }
        let pool = factory.create(threads, name)?;
        *guard = Some(Arc::clone(&pool));
        Ok(pool)
    }

    /// Shuts down the shared pool, if one was created.
    pub fn shutdown(&self) {
        if let Some(pool) = self.pool.lock().take() {
            pool.shutdown();
        }
    }
}
