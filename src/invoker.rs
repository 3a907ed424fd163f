// Copyright (c) The testgraph Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces the core consumes and external code implements.
//!
//! The execution core never reflects over user code: instantiating test
//! classes, calling test and configuration methods and producing parameter
//! rows are all delegated through the traits in this module. The core's job
//! is scheduling; the invoker's job is everything that actually touches user
//! code, including capturing its errors into results.

use crate::{
    errors::{ConfigError, InvocationError},
    list::{ParamValue, ParameterMap, ParameterRow, SuiteDescription, TestMethod},
    pool::WorkerPool,
    results::{InvokedMethod, TestFailure, TestResult},
    runner::TestContext,
};
use chrono::{DateTime, Local};
use std::sync::Arc;

/// Tracks failures across the invocations of one method.
///
/// The method runner consults the count to decide between keeping fresh
/// results verbatim, routing through the retry hook, and cascade-skipping
/// the remaining invocation budget.
#[derive(Clone, Copy, Debug, Default)]
pub struct FailureContext {
    /// How many invocations of the method have failed so far.
    pub count: u32,
}

/// Invokes test methods and reports their outcomes.
///
/// Errors thrown by user code must be captured into the returned
/// [`TestResult`]; an `Err` from these hooks means the invocation machinery
/// itself broke, and the method runner logs and swallows it.
pub trait TestInvoker: Send + Sync {
    /// Runs one invocation of a test method with the given arguments,
    /// updating the failure context.
    fn invoke_test_method(
        &self,
        arguments: &TestMethodArguments,
        suite: &SuiteDescription,
        failure: &mut FailureContext,
    ) -> Result<TestResult, InvocationError>;

    /// Applies the method's retry analyzer to a failed invocation.
    ///
    /// Appends the results to keep (the original failure and any retry
    /// outcomes) to `results` and returns the updated failure context.
    fn retry_failed(
        &self,
        arguments: &TestMethodArguments,
        results: &mut Vec<TestResult>,
        failure_count: u32,
        ctx: &TestContext,
    ) -> FailureContext;

    /// Produces a skipped result without invoking the method.
    fn register_skipped_test_result(
        &self,
        method: &Arc<TestMethod>,
        timestamp: DateTime<Local>,
        failure: Option<TestFailure>,
    ) -> TestResult;

    /// Notifies the listeners interested in skipped invocations.
    fn invoke_listeners_for_skipped(&self, result: &TestResult, invoked: &InvokedMethod);
}

/// Invokes a batch of configuration methods.
pub trait ConfigInvoker: Send + Sync {
    /// Runs the configuration methods in order and returns one result per
    /// method. User-code errors become failure results, never panics.
    fn invoke_configurations(&self, arguments: &ConfigMethodArguments) -> Vec<TestResult>;
}

/// Resolves the final positional arguments for an invocation.
pub trait ParameterResolver: Send + Sync {
    /// Combines the raw provider row with contextual arguments.
    fn inject_parameters(
        &self,
        row: &ParameterRow,
        method: &TestMethod,
        ctx: &TestContext,
    ) -> ParameterRow;
}

/// The identity resolver: provider rows are passed through unchanged.
#[derive(Debug, Default)]
pub struct DefaultParameterResolver;

impl ParameterResolver for DefaultParameterResolver {
    fn inject_parameters(
        &self,
        row: &ParameterRow,
        _method: &TestMethod,
        _ctx: &TestContext,
    ) -> ParameterRow {
        row.clone()
    }
}

/// Decides whether a failed invocation should be retried.
pub trait RetryAnalyzer: Send + Sync {
    /// Returns true to re-invoke the method after the given failure.
    fn retry(&self, result: &TestResult) -> bool;
}

/// Produces the parameter rows for a data-driven method.
pub trait DataProvider: Send + Sync {
    /// The rows to invoke the method with. `None` entries are skip markers
    /// and contribute no result.
    fn rows(&self, method: &TestMethod, ctx: &TestContext) -> Vec<Option<ParameterRow>>;

    /// Whether the rows may be fanned out over a pool instead of run in
    /// order.
    fn is_parallel(&self) -> bool {
        false
    }
}

/// Instantiates test classes.
pub trait ObjectFactory: Send + Sync {
    /// Creates an instance of `class` with the given constructor arguments.
    fn new_instance(
        &self,
        class: &str,
        parameters: &[ParamValue],
    ) -> Result<ParamValue, InvocationError>;
}

/// The fallback object factory: returns an inert instance record.
#[derive(Debug, Default)]
pub struct DefaultObjectFactory;

impl ObjectFactory for DefaultObjectFactory {
    fn new_instance(
        &self,
        class: &str,
        _parameters: &[ParamValue],
    ) -> Result<ParamValue, InvocationError> {
        Ok(serde_json::json!({ "class": class }))
    }
}

/// The suite-first, default-second object factory chain.
///
/// A concrete struct rather than a trait hierarchy: the suite-supplied
/// factory (if any) is tried first, and any error falls through to the
/// default factory.
#[derive(Clone, Debug)]
pub struct FallbackObjectFactory {
    suite_factory: debug_ignore::DebugIgnore<Option<Arc<dyn ObjectFactory>>>,
    default_factory: debug_ignore::DebugIgnore<Arc<dyn ObjectFactory>>,
}

impl FallbackObjectFactory {
    /// Creates the chain from an optional suite factory and the default.
    pub fn new(
        suite_factory: Option<Arc<dyn ObjectFactory>>,
        default_factory: Arc<dyn ObjectFactory>,
    ) -> Self {
        Self {
            suite_factory: debug_ignore::DebugIgnore(suite_factory),
            default_factory: debug_ignore::DebugIgnore(default_factory),
        }
    }

    /// Instantiates `class`, preferring the suite factory and falling back
    /// to the default on error.
    pub fn instantiate(
        &self,
        class: &str,
        parameters: &[ParamValue],
    ) -> Result<ParamValue, InvocationError> {
        if let Some(suite_factory) = self.suite_factory.as_ref() {
            match suite_factory.new_instance(class, parameters) {
                Ok(instance) => return Ok(instance),
                Err(error) => {
                    tracing::debug!(
                        "suite object factory failed for `{class}` ({error}), \
                         falling back to the default factory"
                    );
                }
            }
        }
        self.default_factory.new_instance(class, parameters)
    }
}

/// Creates worker pools on demand.
///
/// Lets hosting frameworks substitute instrumented pools; the default builds
/// a plain [`WorkerPool`].
pub trait PoolFactory: Send + Sync {
    /// Creates a pool with the given concurrency and name.
    fn create(&self, threads: usize, name: &str) -> Result<Arc<WorkerPool>, ConfigError>;
}

/// The default pool factory.
#[derive(Debug, Default)]
pub struct DefaultPoolFactory;

impl PoolFactory for DefaultPoolFactory {
    fn create(&self, threads: usize, name: &str) -> Result<Arc<WorkerPool>, ConfigError> {
        Ok(Arc::new(WorkerPool::new(threads, name)?))
    }
}

/// The arguments for one invocation of a test method.
#[derive(Clone, Debug)]
pub struct TestMethodArguments {
    method: Arc<TestMethod>,
    parameters: ParameterMap,
    parameter_values: ParameterRow,
    parameters_index: usize,
}

impl TestMethodArguments {
    /// Starts building arguments for the given method.
    pub fn builder(method: Arc<TestMethod>) -> TestMethodArgumentsBuilder {
        TestMethodArgumentsBuilder {
            arguments: TestMethodArguments {
                method,
                parameters: ParameterMap::new(),
                parameter_values: ParameterRow::new(),
                parameters_index: 0,
            },
        }
    }

    /// Rebuilds these arguments with a different row.
    pub fn to_builder(&self) -> TestMethodArgumentsBuilder {
        TestMethodArgumentsBuilder {
            arguments: self.clone(),
        }
    }

    /// The method being invoked.
    pub fn method(&self) -> &Arc<TestMethod> {
        &self.method
    }

    /// The named parameters in scope for this invocation.
    pub fn parameters(&self) -> &ParameterMap {
        &self.parameters
    }

    /// The positional arguments for this invocation.
    pub fn parameter_values(&self) -> &ParameterRow {
        &self.parameter_values
    }

    /// The index of the parameter row this invocation uses.
    pub fn parameters_index(&self) -> usize {
        self.parameters_index
    }
}

/// Builder for [`TestMethodArguments`].
pub struct TestMethodArgumentsBuilder {
    arguments: TestMethodArguments,
}

impl TestMethodArgumentsBuilder {
    /// Sets the named parameters in scope.
    pub fn with_parameters(mut self, parameters: ParameterMap) -> Self {
        self.arguments.parameters = parameters;
        self
    }

    /// Sets the positional arguments.
    pub fn with_parameter_values(mut self, values: ParameterRow) -> Self {
        self.arguments.parameter_values = values;
        self
    }

    /// Sets the parameter-row index.
    pub fn with_parameters_index(mut self, index: usize) -> Self {
        self.arguments.parameters_index = index;
        self
    }

    /// Builds the arguments.
    pub fn build(self) -> TestMethodArguments {
        self.arguments
    }
}

/// The arguments for a batch of configuration methods.
#[derive(Clone, Debug)]
pub struct ConfigMethodArguments {
    methods: Vec<Arc<TestMethod>>,
    suite: Arc<SuiteDescription>,
    parameters: ParameterMap,
}

impl ConfigMethodArguments {
    /// Starts building configuration arguments for the given suite.
    pub fn builder(suite: Arc<SuiteDescription>) -> ConfigMethodArgumentsBuilder {
        ConfigMethodArgumentsBuilder {
            arguments: ConfigMethodArguments {
                methods: Vec::new(),
                suite,
                parameters: ParameterMap::new(),
            },
        }
    }

    /// The configuration methods to run, in order.
    pub fn methods(&self) -> &[Arc<TestMethod>] {
        &self.methods
    }

    /// The suite the methods belong to.
    pub fn suite(&self) -> &Arc<SuiteDescription> {
        &self.suite
    }

    /// The named parameters in scope.
    pub fn parameters(&self) -> &ParameterMap {
        &self.parameters
    }
}

/// Builder for [`ConfigMethodArguments`].
pub struct ConfigMethodArgumentsBuilder {
    arguments: ConfigMethodArguments,
}

impl ConfigMethodArgumentsBuilder {
    /// Sets the configuration methods to run.
    pub fn using_config_methods(mut self, methods: Vec<Arc<TestMethod>>) -> Self {
        self.arguments.methods = methods;
        self
    }

    /// Sets the named parameters in scope.
    pub fn using_parameters(mut self, parameters: ParameterMap) -> Self {
        self.arguments.parameters = parameters;
        self
    }

    /// Builds the arguments.
    pub fn build(self) -> ConfigMethodArguments {
        self.arguments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingFactory;

    impl ObjectFactory for FailingFactory {
        fn new_instance(
            &self,
            _class: &str,
            _parameters: &[ParamValue],
        ) -> Result<ParamValue, InvocationError> {
            Err(InvocationError::new("constructor blew up"))
        }
    }

    #[test]
    fn fallback_factory_prefers_suite_then_default() {
        let chain = FallbackObjectFactory::new(
            Some(Arc::new(FailingFactory)),
            Arc::new(DefaultObjectFactory),
        );
        let instance = chain.instantiate("com.example.Widget", &[]).unwrap();
        assert_eq!(instance["class"], "com.example.Widget");

        let no_suite = FallbackObjectFactory::new(None, Arc::new(DefaultObjectFactory));
        assert!(no_suite.instantiate("W", &[]).is_ok());
    }
}
