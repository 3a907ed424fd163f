// Copyright (c) The testgraph Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The orchestrator that drains a [`DynamicGraph`] over a [`WorkerPool`].
//!
//! The loop is event-driven: an initial scheduling round submits every free
//! node, and each finishing worker re-enters the round from its completion
//! callback. All graph mutation happens under one lock, which is never held
//! across a blocking call; the only places the orchestrator blocks are its
//! completion latch and, transitively, the pool's own waits.
//!
//! Thread affinity is opt-in. When enforced, the orchestrator remembers
//! which pool thread produced each node's work, and a newly free node whose
//! upstream is known gets a phoney placeholder slot carrying that thread id.
//! The placeholder is never submitted; it is consulted when the real worker
//! is created, which is then pinned to the recorded thread.

use crate::{
    config::RuntimeSettings,
    graph::{DynamicGraph, NodeStatus},
    pool::{PoolThreadId, TaskContext, WaitOutcome, WorkerPool},
};
use parking_lot::{Condvar, Mutex};
use std::{
    cmp::Ordering,
    collections::HashMap,
    fmt,
    hash::Hash,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering as AtomicOrdering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// An executable unit covering one or more graph nodes.
///
/// Workers are created by a [`WorkerFactory`] for a batch of free nodes and
/// run at most once on a pool thread.
pub trait Worker<T>: Send {
    /// Executes the worker's nodes. Cooperative cancellation is available
    /// through the task context.
    fn run(&mut self, cx: &TaskContext);

    /// The nodes this worker covers.
    fn nodes(&self) -> &[T];

    /// The thread this worker must run on, if any.
    fn pinned_thread(&self) -> Option<PoolThreadId>;

    /// Pins this worker to the given pool thread.
    fn pin_to_thread(&mut self, thread: PoolThreadId);

    /// False if the worker voluntarily yielded before finishing its nodes.
    ///
    /// Only consulted under thread-affinity enforcement; a yielding worker's
    /// nodes go back to `ready` instead of `finished`.
    fn completed(&self) -> bool {
        true
    }
}

/// Creates workers for batches of free nodes.
pub trait WorkerFactory<T>: Send + Sync {
    /// Produces the workers covering `free_nodes`. Every free node must be
    /// covered by exactly one returned worker.
    fn create_workers(&self, free_nodes: &[T]) -> Vec<Box<dyn Worker<T>>>;
}

/// Orders free nodes before each scheduling round.
pub type NodeComparator<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// What the orchestrator remembers about a node's worker.
///
/// `Live` slots share an atomic the task wrapper stamps with its executing
/// thread; `Phoney` slots are the data-only affinity placeholders.
#[derive(Clone, Debug)]
enum WorkerSlot {
    Live { current_thread: Arc<AtomicU64> },
    Phoney { target_thread: PoolThreadId },
}

impl WorkerSlot {
    /// The thread the slot's worker was observed running on.
    fn observed_thread(&self) -> Option<PoolThreadId> {
        match self {
            WorkerSlot::Live { current_thread } => {
                PoolThreadId::from_raw(current_thread.load(AtomicOrdering::Acquire))
            }
            WorkerSlot::Phoney { target_thread } => Some(*target_thread),
        }
    }

    /// The thread a new worker for this node must be pinned to.
    fn target_thread(&self) -> Option<PoolThreadId> {
        match self {
            WorkerSlot::Live { .. } => None,
            WorkerSlot::Phoney { target_thread } => Some(*target_thread),
        }
    }
}

struct OrchestratorState<T> {
    graph: DynamicGraph<T>,
    mapping: HashMap<T, WorkerSlot>,
    upstream: HashMap<T, T>,
}

/// Drains a dependency graph by scheduling free nodes onto a worker pool
/// until every node is finished.
pub struct GraphOrchestrator<T> {
    pool: Arc<WorkerPool>,
    factory: Box<dyn WorkerFactory<T>>,
    comparator: Option<NodeComparator<T>>,
    settings: RuntimeSettings,
    owns_pool: bool,
    state: Mutex<OrchestratorState<T>>,
    completion: Mutex<bool>,
    completed_cond: Condvar,
}

impl<T> GraphOrchestrator<T>
where
    T: Clone + Eq + Hash + fmt::Display + Send + 'static,
{
    /// Creates an orchestrator over the given graph and pool.
    ///
    /// `owns_pool` controls shutdown behaviour: an owned pool is shut down
    /// when the graph drains (and interrupted on timeout), a shared pool is
    /// left running for its other users.
    pub fn new(
        pool: Arc<WorkerPool>,
        factory: Box<dyn WorkerFactory<T>>,
        graph: DynamicGraph<T>,
        comparator: Option<NodeComparator<T>>,
        settings: RuntimeSettings,
        owns_pool: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            factory,
            comparator,
            settings,
            owns_pool,
            state: Mutex::new(OrchestratorState {
                graph,
                mapping: HashMap::new(),
                upstream: HashMap::new(),
            }),
            completion: Mutex::new(false),
            completed_cond: Condvar::new(),
        })
    }

    /// Runs the graph to completion or until the timeout elapses.
    ///
    /// On timeout the graph is left in its partial state (nodes still
    /// `running` stay `running`), an owned pool is interrupted, and the
    /// caller observes whatever results accumulated so far.
    pub fn run(self: Arc<Self>, timeout: Option<Duration>) -> WaitOutcome {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.graph.node_count() == 0 {
                drop(guard);
                self.finish();
                return WaitOutcome::Completed;
            }
            let free = self.sorted_free(state);
            debug!("starting graph orchestrator with {} free nodes", free.len());
            Self::run_nodes(&self, state, free);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut done = self.completion.lock();
        loop {
            if *done {
                return WaitOutcome::Completed;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        drop(done);
                        if self.owns_pool {
                            self.pool.shutdown_now();
                        }
                        let state = self.state.lock();
                        let pending = state.graph.node_count()
                            - state.graph.node_count_with_status(NodeStatus::Finished);
                        debug!("graph orchestrator timed out with {pending} nodes unfinished");
                        return WaitOutcome::TimedOut { pending };
                    }
                    self.completed_cond.wait_for(&mut done, deadline - now);
                }
                None => self.completed_cond.wait(&mut done),
            }
        }
    }

    fn sorted_free(&self, state: &OrchestratorState<T>) -> Vec<T> {
        let mut free = state.graph.free_nodes();
        if let Some(comparator) = &self.comparator {
            free.sort_by(|a, b| comparator(a, b));
        }
        free
    }

    // One scheduling round: wrap each free node in a worker and submit it.
    // Caller holds the state lock.
    fn run_nodes(this: &Arc<Self>, state: &mut OrchestratorState<T>, free: Vec<T>) {
        if free.is_empty() {
            return;
        }
        if this.settings.enforce_thread_affinity {
            this.map_upstream(state, &free);
        }
        let workers = this.factory.create_workers(&free);
        for mut worker in workers {
            let nodes = worker.nodes().to_vec();

            if this.settings.enforce_thread_affinity {
                for node in &nodes {
                    if let Some(target) = state
                        .mapping
                        .get(node)
                        .and_then(WorkerSlot::target_thread)
                    {
                        worker.pin_to_thread(target);
                    }
                }
            }

            let current_thread = Arc::new(AtomicU64::new(0));
            if this.settings.enforce_thread_affinity {
                for node in &nodes {
                    state.mapping.insert(
                        node.clone(),
                        WorkerSlot::Live {
                            current_thread: Arc::clone(&current_thread),
                        },
                    );
                }
            }

            for node in &nodes {
                if let Err(error) = state.graph.set_status(node, NodeStatus::Running) {
                    warn!("scheduling `{node}`: {error}");
                }
            }

            let pin = worker.pinned_thread();
            let task_this = Arc::clone(this);
            let submitted = this.pool.submit_pinned(
                move |cx| {
                    current_thread.store(cx.thread_id().as_u64(), AtomicOrdering::Release);
                    let panicked =
                        catch_unwind(AssertUnwindSafe(|| worker.run(cx))).is_err();
                    Self::after_execute(&task_this, worker, panicked);
                },
                pin,
            );
            if let Err(error) = submitted {
                warn!("graph worker submission failed: {error}");
            }
        }
    }

    // Completion callback, invoked on the pool thread that ran the worker.
    fn after_execute(this: &Arc<Self>, worker: Box<dyn Worker<T>>, panicked: bool) {
        let mut guard = this.state.lock();
        let state = &mut *guard;

        if panicked {
            warn!("graph worker panicked; its nodes are treated as finished");
        }
        let status = if this.settings.enforce_thread_affinity && !worker.completed() {
            NodeStatus::Ready
        } else {
            NodeStatus::Finished
        };
        for node in worker.nodes() {
            if let Err(error) = state.graph.set_status(node, status) {
                warn!("completing `{node}`: {error}");
            }
        }

        if state.graph.is_drained() {
            debug!("graph drained, shutting down");
            drop(guard);
            if this.owns_pool {
                this.pool.shutdown();
            }
            this.finish();
            return;
        }

        let free = this.sorted_free(state);
        if this.settings.enforce_thread_affinity {
            this.handle_thread_affinity(state, &free);
        }
        Self::run_nodes(this, state, free);
    }

    // Remember each scheduled node as the upstream of its successors, so a
    // child freed later can find the thread its parent ran on.
    fn map_upstream(&self, state: &mut OrchestratorState<T>, free: &[T]) {
        for node in free {
            for successor in state.graph.successors_of(node) {
                state.upstream.insert(successor, node.clone());
            }
        }
    }

    // Insert phoney placeholder slots for newly free nodes whose upstream
    // worker has a recorded thread.
    fn handle_thread_affinity(&self, state: &mut OrchestratorState<T>, free: &[T]) {
        let mut pins = Vec::new();
        for node in free {
            let thread = state
                .upstream
                .get(node)
                .and_then(|parent| state.mapping.get(parent))
                .and_then(WorkerSlot::observed_thread);
            if let Some(thread) = thread {
                pins.push((node.clone(), thread));
            }
        }
        for (node, thread) in pins {
            state.mapping.insert(
                node,
                WorkerSlot::Phoney {
                    target_thread: thread,
                },
            );
        }
    }

    fn finish(&self) {
        let mut done = self.completion.lock();
        *done = true;
        self.completed_cond.notify_all();
    }
}
