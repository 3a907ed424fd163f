// Copyright (c) The testgraph Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runs a whole suite: lifecycle hooks around the contained tests,
//! sequential or parallel dispatch, and the ordered result map.

use crate::{
    attributes::AttributeBag,
    config::{Configuration, ParallelMode},
    errors::{ConfigError, LifecycleError},
    invoker::ConfigMethodArguments,
    list::{MethodId, SuiteDescription, TestMethod},
    listeners::{
        notify_each, ClassListener, ConfigurationListener, DataProviderListener,
        ExecutionVisualiser, InvokedMethodListener, ListenerRegistry, Reporter, SuiteListener,
        TestListener,
    },
    pool::SharedPools,
    results::{InvokedMethod, SuiteResult},
    runner::{DefaultTestRunnerFactory, NewTestRunnerArgs, TestRunner, TestRunnerFactory},
};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::{
    any::TypeId,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, error, warn};

/// The shared failure latch for one suite run.
///
/// Runners raise it when any test or configuration method fails; user code
/// can observe it through [`SuiteRunner::state`].
#[derive(Debug, Default)]
pub struct SuiteRunState {
    failed: AtomicBool,
}

impl SuiteRunState {
    /// True once anything in the suite has failed.
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }
}

/// Runs all the tests included in one suite. The run is triggered by
/// [`run`](Self::run) and may happen exactly once per runner.
pub struct SuiteRunner {
    description: Arc<SuiteDescription>,
    configuration: Arc<Configuration>,
    shared_pools: Arc<SharedPools>,
    state: Arc<SuiteRunState>,
    test_runners: Vec<Arc<TestRunner>>,
    suite_listeners: Mutex<ListenerRegistry<dyn SuiteListener>>,
    class_listeners: Mutex<ListenerRegistry<dyn ClassListener>>,
    reporters: Mutex<ListenerRegistry<dyn Reporter>>,
    visualisers: Mutex<ListenerRegistry<dyn ExecutionVisualiser>>,
    suite_results: Arc<Mutex<IndexMap<String, SuiteResult>>>,
    attributes: AttributeBag,
    ran: AtomicBool,
}

impl SuiteRunner {
    /// Starts building a runner for the given suite.
    pub fn builder(
        description: Arc<SuiteDescription>,
        configuration: Configuration,
    ) -> SuiteRunnerBuilder {
        SuiteRunnerBuilder {
            description,
            configuration: Arc::new(configuration),
            runner_factory: None,
        }
    }

    /// The suite name.
    pub fn name(&self) -> &str {
        self.description.name()
    }

    /// The suite description being run.
    pub fn description(&self) -> &Arc<SuiteDescription> {
        &self.description
    }

    /// The contained test runners, in declared order.
    pub fn test_runners(&self) -> &[Arc<TestRunner>] {
        &self.test_runners
    }

    /// The suite's failure latch.
    pub fn state(&self) -> &Arc<SuiteRunState> {
        &self.state
    }

    /// The suite's attribute bag.
    pub fn attributes(&self) -> &AttributeBag {
        &self.attributes
    }

    /// A snapshot of the result map: test name to aggregated results, one
    /// entry per test description once `run()` has returned.
    pub fn results(&self) -> IndexMap<String, SuiteResult> {
        self.suite_results.lock().clone()
    }

    /// Every test method across the contained tests, in declared order.
    pub fn all_methods(&self) -> Vec<Arc<TestMethod>> {
        self.test_runners
            .iter()
            .flat_map(|runner| runner.test_methods())
            .collect()
    }

    /// Every recorded invocation across the contained tests.
    pub fn all_invoked_methods(&self) -> Vec<InvokedMethod> {
        self.test_runners
            .iter()
            .flat_map(|runner| runner.invoked_methods())
            .collect()
    }

    /// Test methods grouped by the groups they belong to.
    pub fn methods_by_groups(&self) -> IndexMap<String, Vec<Arc<TestMethod>>> {
        let mut by_group: IndexMap<String, Vec<Arc<TestMethod>>> = IndexMap::new();
        for method in self.all_methods() {
            for group in method.groups() {
                by_group
                    .entry(group.clone())
                    .or_default()
                    .push(Arc::clone(&method));
            }
        }
        by_group
    }

    /// The registered reporters, for the external rendering layer.
    pub fn reporters(&self) -> Vec<Arc<dyn Reporter>> {
        self.reporters.lock().snapshot()
    }

    /// The registered class listeners, for the external invoker to drive.
    pub fn class_listeners(&self) -> Vec<Arc<dyn ClassListener>> {
        self.class_listeners.lock().snapshot()
    }

    /// Registers a suite listener; idempotent per concrete type.
    pub fn add_suite_listener<L: SuiteListener>(&self, listener: Arc<L>) {
        self.suite_listeners
            .lock()
            .insert(TypeId::of::<L>(), std::any::type_name::<L>(), listener);
    }

    /// Registers a test listener on every contained runner.
    pub fn add_test_listener<L: TestListener>(&self, listener: Arc<L>) {
        for runner in &self.test_runners {
            runner.add_test_listener(Arc::clone(&listener));
        }
    }

    /// Registers a configuration listener on every contained runner.
    pub fn add_configuration_listener<L: ConfigurationListener>(&self, listener: Arc<L>) {
        for runner in &self.test_runners {
            runner.add_configuration_listener(Arc::clone(&listener));
        }
    }

    /// Registers an invoked-method listener on every contained runner.
    pub fn add_invoked_method_listener<L: InvokedMethodListener>(&self, listener: Arc<L>) {
        for runner in &self.test_runners {
            runner.add_invoked_method_listener(Arc::clone(&listener));
        }
    }

    /// Registers a data-provider listener on every contained runner.
    pub fn add_data_provider_listener<L: DataProviderListener>(&self, listener: Arc<L>) {
        for runner in &self.test_runners {
            runner.add_data_provider_listener(Arc::clone(&listener));
        }
    }

    /// Registers a class listener; idempotent per concrete type.
    pub fn add_class_listener<L: ClassListener>(&self, listener: Arc<L>) {
        self.class_listeners
            .lock()
            .insert(TypeId::of::<L>(), std::any::type_name::<L>(), listener);
    }

    /// Registers a reporter; idempotent per concrete type.
    pub fn add_reporter<L: Reporter>(&self, listener: Arc<L>) {
        self.reporters
            .lock()
            .insert(TypeId::of::<L>(), std::any::type_name::<L>(), listener);
    }

    /// Registers an execution visualiser; attached to each test runner as
    /// it starts.
    pub fn add_visualiser<L: ExecutionVisualiser>(&self, listener: Arc<L>) {
        self.visualisers
            .lock()
            .insert(TypeId::of::<L>(), std::any::type_name::<L>(), listener);
    }

    /// Runs the suite.
    ///
    /// Suite listeners are notified `on_start` in comparator order before
    /// anything else and `on_finish` in exact reverse order after
    /// everything, even if the run itself panics. A runner can only run
    /// once.
    pub fn run(&self) -> Result<(), LifecycleError> {
        if self.ran.swap(true, Ordering::SeqCst) {
            return Err(LifecycleError::AlreadyRan {
                suite: self.name().to_string(),
            });
        }

        let stopwatch = crate::time::stopwatch();
        let comparator = self.configuration.listener_comparator();
        let starters = self.suite_listeners.lock().ordered(comparator);
        notify_each(&starters, |listener| listener.on_start(self));

        if catch_unwind(AssertUnwindSafe(|| self.private_run())).is_err() {
            error!("suite `{}`: run aborted by panic", self.name());
        }

        let finishers = self.suite_listeners.lock().reversed(comparator);
        notify_each(&finishers, |listener| listener.on_finish(self));
        let snapshot = stopwatch.snapshot();
        debug!(
            "suite `{}` started {} and finished in {:?}",
            self.name(),
            snapshot.start_time.to_rfc3339(),
            snapshot.duration
        );
        Ok(())
    }

    fn private_run(&self) {
        // A suite without tests bypasses the suite-level hooks entirely.
        if self.test_runners.is_empty() {
            debug!("suite `{}` contains no tests", self.name());
            return;
        }

        // Distinct before/after-suite methods across all runners, keyed by
        // method identity, insertion order preserved.
        let mut before_suite: IndexMap<MethodId, Arc<TestMethod>> = IndexMap::new();
        let mut after_suite: IndexMap<MethodId, Arc<TestMethod>> = IndexMap::new();
        for runner in &self.test_runners {
            for method in runner.before_suite_methods() {
                before_suite.entry(method.id().clone()).or_insert(method);
            }
            for method in runner.after_suite_methods() {
                after_suite.entry(method.id().clone()).or_insert(method);
            }
        }

        if !before_suite.is_empty() {
            let arguments = ConfigMethodArguments::builder(Arc::clone(&self.description))
                .using_config_methods(before_suite.into_values().collect())
                .using_parameters(self.description.parameters().clone())
                .build();
            let results = self
                .configuration
                .config_invoker()
                .invoke_configurations(&arguments);
            self.test_runners[0].record_results(results);
        }

        debug!(
            "suite `{}`: dispatching {} test runners",
            self.name(),
            self.test_runners.len()
        );
        let tests_in_parallel = if self.configuration.settings().strict_parallelism {
            self.description.parallel().is_parallel()
        } else {
            self.description.parallel() == ParallelMode::Tests
        };
        if tests_in_parallel {
            self.run_in_parallel_test_mode();
        } else {
            self.run_sequentially();
        }

        // Tests that never got to report (a timed-out parallel dispatch)
        // still get their entry, so the map always covers every test.
        {
            let mut results = self.suite_results.lock();
            for runner in &self.test_runners {
                if !results.contains_key(runner.name()) {
                    results.insert(
                        runner.name().to_string(),
                        SuiteResult::new(runner.name(), runner.results()),
                    );
                }
            }
        }

        // After-suite methods see the merged suite plus per-test
        // parameters.
        if !after_suite.is_empty() {
            let arguments = ConfigMethodArguments::builder(Arc::clone(&self.description))
                .using_config_methods(after_suite.into_values().collect())
                .using_parameters(self.description.all_parameters())
                .build();
            let results = self
                .configuration
                .config_invoker()
                .invoke_configurations(&arguments);
            self.test_runners[0].record_results(results);
        }

        self.shared_pools.shutdown();
    }

    fn run_sequentially(&self) {
        for runner in &self.test_runners {
            self.run_test(runner);
        }
    }

    /// Implements `parallel="tests"`. This level of parallelism happens at
    /// the suite, so it gets its own code path: every other axis lives
    /// inside the test runners.
    fn run_in_parallel_test_mode(&self) {
        let threads = self.description.thread_count().compute();
        let pool = match self.configuration.pool_factory().create(threads, "tests") {
            Ok(pool) => pool,
            Err(error) => {
                warn!(
                    "suite `{}`: cannot build test pool ({error}), falling back to sequential",
                    self.name()
                );
                return self.run_sequentially();
            }
        };

        let visualisers = self.visualisers.lock().entries();
        let mut handles = Vec::new();
        for runner in &self.test_runners {
            let runner = Arc::clone(runner);
            let results = Arc::clone(&self.suite_results);
            let visualisers = visualisers.clone();
            let submitted = pool.submit(move |cx| {
                if cx.cancel_token().is_cancelled() {
                    return;
                }
                run_test_inner(&runner, &visualisers, &results);
            });
            match submitted {
                Ok(handle) => handles.push(handle),
                Err(error) => warn!("suite `{}`: {error}", self.name()),
            }
        }

        let timeout = self.description.time_out().as_duration();
        let outcome = pool.await_all(&handles, timeout);
        if let crate::pool::WaitOutcome::TimedOut { pending } = outcome {
            warn!(
                "suite `{}`: timed out waiting for {pending} tests; partial results kept",
                self.name()
            );
        }
        pool.shutdown();
    }

    fn run_test(&self, runner: &Arc<TestRunner>) {
        run_test_inner(
            runner,
            &self.visualisers.lock().entries(),
            &self.suite_results,
        );
    }
}

type VisualiserEntries = [(
    TypeId,
    crate::listeners::ListenerMeta,
    Arc<dyn ExecutionVisualiser>,
)];

fn run_test_inner(
    runner: &Arc<TestRunner>,
    visualisers: &VisualiserEntries,
    suite_results: &Mutex<IndexMap<String, SuiteResult>>,
) {
    for (type_id, meta, visualiser) in visualisers {
        runner.insert_visualiser(*type_id, meta.type_name, Arc::clone(visualiser));
    }
    Arc::clone(runner).run();

    let entry = SuiteResult::new(runner.name(), runner.results());
    suite_results.lock().insert(runner.name().to_string(), entry);
}

/// Builder for [`SuiteRunner`].
pub struct SuiteRunnerBuilder {
    description: Arc<SuiteDescription>,
    configuration: Arc<Configuration>,
    runner_factory: Option<Arc<dyn TestRunnerFactory>>,
}

impl SuiteRunnerBuilder {
    /// Substitutes a custom test-runner factory, typically wrapped in a
    /// [`ProxyTestRunnerFactory`](crate::runner::ProxyTestRunnerFactory).
    pub fn runner_factory(mut self, factory: Arc<dyn TestRunnerFactory>) -> Self {
        self.runner_factory = Some(factory);
        self
    }

    /// Builds the suite runner, constructing one test runner per contained
    /// test in declared order.
    pub fn build(self) -> Result<SuiteRunner, ConfigError> {
        let shared_pools = Arc::new(SharedPools::new());
        let state = Arc::new(SuiteRunState::default());
        let factory = self
            .runner_factory
            .unwrap_or_else(|| Arc::new(DefaultTestRunnerFactory));

        let mut test_runners = Vec::with_capacity(self.description.tests().len());
        for test in self.description.tests() {
            let runner = factory.new_test_runner(NewTestRunnerArgs {
                suite: &self.description,
                test,
                configuration: &self.configuration,
                shared_pools: &shared_pools,
                suite_state: &state,
                skip_failed_invocation_counts: self.description.skip_failed_invocation_counts(),
            })?;
            test_runners.push(runner);
        }

        Ok(SuiteRunner {
            description: self.description,
            configuration: self.configuration,
            shared_pools,
            state,
            test_runners,
            suite_listeners: Mutex::default(),
            class_listeners: Mutex::default(),
            reporters: Mutex::default(),
            visualisers: Mutex::default(),
            suite_results: Arc::new(Mutex::new(IndexMap::new())),
            attributes: AttributeBag::new(),
            ran: AtomicBool::new(false),
        })
    }
}
