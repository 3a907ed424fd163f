// Copyright (c) The testgraph Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runs one test declaration: a DAG of test methods over a worker pool.
//!
//! The runner turns a [`TestDescription`] into a dependency graph (declared
//! method and group dependencies become edges, cycles are rejected at
//! construction), drives the graph orchestrator with a worker per free
//! method, and aggregates every result into the eight category sets.
//!
//! Before-test and after-test configuration methods deliberately run outside
//! the graph, on the calling thread: before-test ahead of the orchestrator,
//! after-test once it returns, timed out or not.

use crate::{
    attributes::AttributeBag,
    config::{Configuration, ParallelMode},
    errors::ConfigError,
    graph::DynamicGraph,
    invoker::ConfigMethodArguments,
    list::{MethodId, MethodKind, ParameterMap, SuiteDescription, TestDescription, TestMethod},
    listeners::{
        notify_each, ConfigurationListener, DataProviderListener, ExecutionVisualiser,
        InvokedMethodListener, ListenerRegistry, TestListener,
    },
    orchestrator::{GraphOrchestrator, NodeComparator, Worker, WorkerFactory},
    pool::{PoolThreadId, SharedPools, TaskContext, WaitOutcome},
    results::{InvokedMethod, ResultCategory, TestResult, TestRunnerResults},
    runner::{MethodRunner, SuiteRunState},
};
use parking_lot::Mutex;
use std::{any::TypeId, collections::HashMap, sync::Arc};
use tracing::{debug, warn};

/// Everything user code can see about the test currently running.
///
/// One context is created per `run()` and shared with the invoker, the
/// parameter resolver, data providers and listeners.
pub struct TestContext {
    suite: Arc<SuiteDescription>,
    test: Arc<TestDescription>,
    configuration: Arc<Configuration>,
    shared_pools: Arc<SharedPools>,
    attributes: AttributeBag,
    effective_parameters: ParameterMap,
    invoked_method_listeners: Vec<Arc<dyn InvokedMethodListener>>,
    data_provider_listeners: Vec<Arc<dyn DataProviderListener>>,
}

impl TestContext {
    /// The suite being run.
    pub fn suite(&self) -> &Arc<SuiteDescription> {
        &self.suite
    }

    /// The test declaration being run.
    pub fn test(&self) -> &Arc<TestDescription> {
        &self.test
    }

    /// The run's configuration bundle.
    pub fn configuration(&self) -> &Arc<Configuration> {
        &self.configuration
    }

    /// The suite's shared-pool cache.
    pub fn shared_pools(&self) -> &Arc<SharedPools> {
        &self.shared_pools
    }

    /// Scratch state shared across this test's invocations.
    pub fn attributes(&self) -> &AttributeBag {
        &self.attributes
    }

    /// The suite parameters with this test's parameters merged over them.
    pub fn effective_parameters(&self) -> &ParameterMap {
        &self.effective_parameters
    }

    /// The invoked-method listeners in scope, for the external invoker to
    /// notify around each invocation.
    pub fn invoked_method_listeners(&self) -> &[Arc<dyn InvokedMethodListener>] {
        &self.invoked_method_listeners
    }

    /// The data-provider listeners in scope.
    pub fn data_provider_listeners(&self) -> &[Arc<dyn DataProviderListener>] {
        &self.data_provider_listeners
    }
}

/// The inputs a [`TestRunnerFactory`] builds a runner from.
pub struct NewTestRunnerArgs<'a> {
    /// The suite the test belongs to.
    pub suite: &'a Arc<SuiteDescription>,
    /// The test to run.
    pub test: &'a Arc<TestDescription>,
    /// The run's configuration bundle.
    pub configuration: &'a Arc<Configuration>,
    /// The suite's shared-pool cache.
    pub shared_pools: &'a Arc<SharedPools>,
    /// The suite's failure latch.
    pub suite_state: &'a Arc<SuiteRunState>,
    /// The suite-wide cascade-skip flag (before per-test overrides).
    pub skip_failed_invocation_counts: bool,
}

/// Builds test runners; lets hosting frameworks substitute their own.
pub trait TestRunnerFactory: Send + Sync {
    /// Creates a runner for one test declaration.
    fn new_test_runner(&self, args: NewTestRunnerArgs<'_>) -> Result<Arc<TestRunner>, ConfigError>;
}

/// The stock factory: builds a plain [`TestRunner`].
#[derive(Debug, Default)]
pub struct DefaultTestRunnerFactory;

impl TestRunnerFactory for DefaultTestRunnerFactory {
    fn new_test_runner(&self, args: NewTestRunnerArgs<'_>) -> Result<Arc<TestRunner>, ConfigError> {
        TestRunner::new(args).map(Arc::new)
    }
}

/// Wraps a user-supplied factory and re-attaches the suite's test listeners
/// to every runner it produces.
pub struct ProxyTestRunnerFactory {
    target: Arc<dyn TestRunnerFactory>,
    attach: Box<dyn Fn(&Arc<TestRunner>) + Send + Sync>,
}

impl ProxyTestRunnerFactory {
    /// Creates a proxy around `target`; `attach` runs on every new runner.
    pub fn new(
        target: Arc<dyn TestRunnerFactory>,
        attach: Box<dyn Fn(&Arc<TestRunner>) + Send + Sync>,
    ) -> Self {
        Self { target, attach }
    }
}

impl TestRunnerFactory for ProxyTestRunnerFactory {
    fn new_test_runner(&self, args: NewTestRunnerArgs<'_>) -> Result<Arc<TestRunner>, ConfigError> {
        let runner = self.target.new_test_runner(args)?;
        (self.attach)(&runner);
        Ok(runner)
    }
}

/// Runs one test declaration and collects its results.
pub struct TestRunner {
    description: Arc<TestDescription>,
    suite: Arc<SuiteDescription>,
    configuration: Arc<Configuration>,
    shared_pools: Arc<SharedPools>,
    suite_state: Arc<SuiteRunState>,
    skip_failed_invocation_counts: bool,
    test_listeners: Mutex<ListenerRegistry<dyn TestListener>>,
    configuration_listeners: Mutex<ListenerRegistry<dyn ConfigurationListener>>,
    invoked_method_listeners: Mutex<ListenerRegistry<dyn InvokedMethodListener>>,
    data_provider_listeners: Mutex<ListenerRegistry<dyn DataProviderListener>>,
    visualisers: Mutex<ListenerRegistry<dyn ExecutionVisualiser>>,
    results: Mutex<TestRunnerResults>,
    invoked_methods: Mutex<Vec<InvokedMethod>>,
}

impl TestRunner {
    /// Creates a runner, validating the method dependency graph.
    ///
    /// Cycles and unknown method or group dependencies are configuration
    /// errors and fail construction.
    pub fn new(args: NewTestRunnerArgs<'_>) -> Result<Self, ConfigError> {
        let skip_failed_invocation_counts = args
            .test
            .skip_failed_invocation_counts()
            .unwrap_or(args.skip_failed_invocation_counts);

        let runner = Self {
            description: Arc::clone(args.test),
            suite: Arc::clone(args.suite),
            configuration: Arc::clone(args.configuration),
            shared_pools: Arc::clone(args.shared_pools),
            suite_state: Arc::clone(args.suite_state),
            skip_failed_invocation_counts,
            test_listeners: Mutex::default(),
            configuration_listeners: Mutex::default(),
            invoked_method_listeners: Mutex::default(),
            data_provider_listeners: Mutex::default(),
            visualisers: Mutex::default(),
            results: Mutex::default(),
            invoked_methods: Mutex::default(),
        };
        // Surface bad dependency declarations now rather than mid-run.
        runner.build_method_graph()?;
        Ok(runner)
    }

    /// The test name; keys the suite result map.
    pub fn name(&self) -> &str {
        self.description.name()
    }

    /// The test declaration.
    pub fn description(&self) -> &Arc<TestDescription> {
        &self.description
    }

    /// The test methods (configuration methods excluded), in declared
    /// order.
    pub fn test_methods(&self) -> Vec<Arc<TestMethod>> {
        self.description.methods_of_kind(MethodKind::Test)
    }

    /// The before-suite methods declared in this test.
    pub fn before_suite_methods(&self) -> Vec<Arc<TestMethod>> {
        self.description.methods_of_kind(MethodKind::BeforeSuite)
    }

    /// The after-suite methods declared in this test.
    pub fn after_suite_methods(&self) -> Vec<Arc<TestMethod>> {
        self.description.methods_of_kind(MethodKind::AfterSuite)
    }

    /// A snapshot of the category sets.
    pub fn results(&self) -> TestRunnerResults {
        self.results.lock().clone()
    }

    /// A snapshot of the invocation log, in invocation order.
    pub fn invoked_methods(&self) -> Vec<InvokedMethod> {
        self.invoked_methods.lock().clone()
    }

    /// Registers a test listener; idempotent per concrete type.
    pub fn add_test_listener<L: TestListener>(&self, listener: Arc<L>) {
        self.test_listeners
            .lock()
            .insert(TypeId::of::<L>(), std::any::type_name::<L>(), listener);
    }

    /// Registers a configuration listener; idempotent per concrete type.
    pub fn add_configuration_listener<L: ConfigurationListener>(&self, listener: Arc<L>) {
        self.configuration_listeners
            .lock()
            .insert(TypeId::of::<L>(), std::any::type_name::<L>(), listener);
    }

    /// Registers an invoked-method listener; idempotent per concrete type.
    pub fn add_invoked_method_listener<L: InvokedMethodListener>(&self, listener: Arc<L>) {
        self.invoked_method_listeners
            .lock()
            .insert(TypeId::of::<L>(), std::any::type_name::<L>(), listener);
    }

    /// Registers a data-provider listener; idempotent per concrete type.
    pub fn add_data_provider_listener<L: DataProviderListener>(&self, listener: Arc<L>) {
        self.data_provider_listeners
            .lock()
            .insert(TypeId::of::<L>(), std::any::type_name::<L>(), listener);
    }

    /// Registers an execution visualiser; idempotent per concrete type.
    pub fn add_visualiser<L: ExecutionVisualiser>(&self, listener: Arc<L>) {
        self.visualisers
            .lock()
            .insert(TypeId::of::<L>(), std::any::type_name::<L>(), listener);
    }

    // Propagation path for visualisers registered at the suite level.
    pub(crate) fn insert_visualiser(
        &self,
        type_id: TypeId,
        type_name: &'static str,
        listener: Arc<dyn ExecutionVisualiser>,
    ) {
        self.visualisers.lock().insert(type_id, type_name, listener);
    }

    /// Runs the test: before-test hooks, the method graph, after-test
    /// hooks.
    pub fn run(self: Arc<Self>) {
        let stopwatch = crate::time::stopwatch();
        let ctx = self.new_context();
        let test_listeners = self.test_listeners.lock().snapshot();
        notify_each(&test_listeners, |listener| listener.on_start(&ctx));

        self.run_configurations(MethodKind::BeforeTest, &ctx);

        match self.build_method_graph() {
            Ok(graph) => {
                let visualisers = self.visualisers.lock().snapshot();
                if !visualisers.is_empty() {
                    let dot = graph.to_dot();
                    notify_each(&visualisers, |visualiser| visualiser.consume_dot(&dot));
                }
                if graph.node_count() > 0 {
                    Self::run_method_graph(&self, graph, &ctx);
                }
            }
            // Construction already validated the graph; this is repeatable
            // only if the description mutated underneath us.
            Err(error) => warn!("test `{}`: {error}", self.name()),
        }

        // After-test hooks run on the calling thread no matter what
        // happened inside the graph.
        self.run_configurations(MethodKind::AfterTest, &ctx);
        notify_each(&test_listeners, |listener| listener.on_finish(&ctx));
        debug!(
            "test `{}` finished in {:?}",
            self.name(),
            stopwatch.snapshot().duration
        );
    }

    fn new_context(&self) -> Arc<TestContext> {
        let mut effective_parameters = self.suite.parameters().clone();
        for (key, value) in self.description.parameters() {
            effective_parameters.insert(key.clone(), value.clone());
        }
        Arc::new(TestContext {
            suite: Arc::clone(&self.suite),
            test: Arc::clone(&self.description),
            configuration: Arc::clone(&self.configuration),
            shared_pools: Arc::clone(&self.shared_pools),
            attributes: AttributeBag::new(),
            effective_parameters,
            invoked_method_listeners: self.invoked_method_listeners.lock().snapshot(),
            data_provider_listeners: self.data_provider_listeners.lock().snapshot(),
        })
    }

    // Runs the configuration methods of one kind on the calling thread and
    // records their results.
    fn run_configurations(&self, kind: MethodKind, ctx: &Arc<TestContext>) {
        let methods = self.description.methods_of_kind(kind);
        if methods.is_empty() {
            return;
        }
        debug!("test `{}`: running {} {kind} methods", self.name(), methods.len());
        let arguments = ConfigMethodArguments::builder(Arc::clone(&self.suite))
            .using_config_methods(methods)
            .using_parameters(ctx.effective_parameters().clone())
            .build();
        let results = self
            .configuration
            .config_invoker()
            .invoke_configurations(&arguments);
        self.record_results(results);
    }

    // Builds the dependency graph over this test's test methods.
    fn build_method_graph(&self) -> Result<DynamicGraph<Arc<TestMethod>>, ConfigError> {
        let methods = self.test_methods();
        let mut graph = DynamicGraph::new();
        let mut by_id: HashMap<MethodId, Arc<TestMethod>> = HashMap::new();
        let mut by_group: HashMap<String, Vec<Arc<TestMethod>>> = HashMap::new();

        for method in &methods {
            if graph.add_node(Arc::clone(method)).is_err() {
                warn!(
                    "test `{}`: method `{method}` declared twice, ignoring the duplicate",
                    self.name()
                );
                continue;
            }
            by_id.insert(method.id().clone(), Arc::clone(method));
            for group in method.groups() {
                by_group
                    .entry(group.clone())
                    .or_default()
                    .push(Arc::clone(method));
            }
        }

        for method in &methods {
            for dep_id in method.depends_on_methods() {
                let dependency =
                    by_id
                        .get(dep_id)
                        .ok_or_else(|| ConfigError::UnknownMethodDependency {
                            method: method.to_string(),
                            missing: dep_id.to_string(),
                        })?;
                graph.add_edge(method, dependency).map_err(|_| {
                    ConfigError::CyclicDependency {
                        from: method.to_string(),
                        to: dependency.to_string(),
                    }
                })?;
            }
            for group in method.depends_on_groups() {
                let members =
                    by_group
                        .get(group)
                        .ok_or_else(|| ConfigError::UnknownGroupDependency {
                            method: method.to_string(),
                            group: group.clone(),
                        })?;
                for member in members {
                    if member == method {
                        continue;
                    }
                    graph.add_edge(method, member).map_err(|_| {
                        ConfigError::CyclicDependency {
                            from: method.to_string(),
                            to: member.to_string(),
                        }
                    })?;
                }
            }
        }

        Ok(graph)
    }

    fn run_method_graph(
        this: &Arc<Self>,
        graph: DynamicGraph<Arc<TestMethod>>,
        ctx: &Arc<TestContext>,
    ) {
        let mode = this
            .description
            .parallel()
            .unwrap_or_else(|| this.suite.parallel());
        let method_parallel = matches!(
            mode,
            ParallelMode::Methods | ParallelMode::Classes | ParallelMode::Instances
        );

        // A non-parallel test still goes through the orchestrator, on a
        // single thread so the comparator order is observable.
        let use_global = method_parallel && this.suite.use_global_thread_pool();
        let threads = if method_parallel {
            this.suite.thread_count().compute()
        } else {
            1
        };
        let pool = if use_global {
            this.shared_pools.get_or_create(
                threads,
                "graphworker",
                this.configuration.pool_factory().as_ref(),
            )
        } else {
            this.configuration
                .pool_factory()
                .create(threads, &format!("test-{}", this.name()))
        };
        let pool = match pool {
            Ok(pool) => pool,
            Err(error) => {
                warn!("test `{}`: cannot build worker pool: {error}", this.name());
                return;
            }
        };

        let factory = Box::new(MethodWorkerFactory {
            runner: Arc::clone(this),
            ctx: Arc::clone(ctx),
        });
        let comparator: NodeComparator<Arc<TestMethod>> =
            Arc::clone(this.configuration.method_comparator());
        let orchestrator = GraphOrchestrator::new(
            pool,
            factory,
            graph,
            Some(comparator),
            this.configuration.settings(),
            !use_global,
        );

        let timeout = this
            .description
            .time_out()
            .unwrap_or_else(|| this.suite.time_out())
            .as_duration();
        if let WaitOutcome::TimedOut { pending } = orchestrator.run(timeout) {
            warn!(
                "test `{}` timed out with {pending} methods unfinished",
                this.name()
            );
        }
    }

    // Appends results to their category sets and fans out the listener
    // notifications.
    pub(crate) fn record_results(&self, results: Vec<TestResult>) {
        if results.is_empty() {
            return;
        }
        let mut recorded = Vec::with_capacity(results.len());
        {
            let mut sets = self.results.lock();
            let mut invoked = self.invoked_methods.lock();
            for result in results {
                let category = sets.record(result.clone());
                // Skipped results were never invoked.
                if result.status() != crate::results::TestStatus::Skipped {
                    invoked.push(InvokedMethod::new(
                        Arc::clone(result.method()),
                        result.start_time(),
                    ));
                }
                recorded.push((result, category));
            }
        }

        let test_listeners = self.test_listeners.lock().snapshot();
        let configuration_listeners = self.configuration_listeners.lock().snapshot();
        for (result, category) in recorded {
            match category {
                ResultCategory::PassedTest => {
                    notify_each(&test_listeners, |l| l.on_test_success(&result));
                }
                ResultCategory::FailedTest => {
                    self.suite_state.mark_failed();
                    notify_each(&test_listeners, |l| l.on_test_failure(&result));
                }
                ResultCategory::FailedWithinPercentageTest => {
                    notify_each(&test_listeners, |l| {
                        l.on_test_failed_within_success_percentage(&result)
                    });
                }
                ResultCategory::SkippedTest => {
                    notify_each(&test_listeners, |l| l.on_test_skipped(&result));
                }
                ResultCategory::PassedConfiguration => {
                    notify_each(&configuration_listeners, |l| {
                        l.on_configuration_success(&result)
                    });
                }
                ResultCategory::FailedConfiguration => {
                    self.suite_state.mark_failed();
                    notify_each(&configuration_listeners, |l| {
                        l.on_configuration_failure(&result)
                    });
                }
                ResultCategory::FailedWithinPercentageConfiguration => {
                    notify_each(&configuration_listeners, |l| {
                        l.on_configuration_success(&result)
                    });
                }
                ResultCategory::SkippedConfiguration => {
                    notify_each(&configuration_listeners, |l| {
                        l.on_configuration_skip(&result)
                    });
                }
            }
        }
    }
}

// One worker per free node; `run` expands the node's method through the
// method runner and records the outcome.
struct MethodWorker {
    nodes: Vec<Arc<TestMethod>>,
    runner: Arc<TestRunner>,
    ctx: Arc<TestContext>,
    pin: Option<PoolThreadId>,
}

impl Worker<Arc<TestMethod>> for MethodWorker {
    fn run(&mut self, cx: &TaskContext) {
        for method in &self.nodes {
            let results = MethodRunner::run(
                method,
                &self.ctx,
                self.runner.skip_failed_invocation_counts,
                cx.cancel_token(),
            );
            self.runner.record_results(results);
        }
    }

    fn nodes(&self) -> &[Arc<TestMethod>] {
        &self.nodes
    }

    fn pinned_thread(&self) -> Option<PoolThreadId> {
        self.pin
    }

    fn pin_to_thread(&mut self, thread: PoolThreadId) {
        self.pin = Some(thread);
    }
}

struct MethodWorkerFactory {
    runner: Arc<TestRunner>,
    ctx: Arc<TestContext>,
}

impl WorkerFactory<Arc<TestMethod>> for MethodWorkerFactory {
    fn create_workers(&self, free_nodes: &[Arc<TestMethod>]) -> Vec<Box<dyn Worker<Arc<TestMethod>>>> {
        free_nodes
            .iter()
            .map(|node| {
                Box::new(MethodWorker {
                    nodes: vec![Arc::clone(node)],
                    runner: Arc::clone(&self.runner),
                    ctx: Arc::clone(&self.ctx),
                    pin: None,
                }) as Box<dyn Worker<Arc<TestMethod>>>
            })
            .collect()
    }
}
