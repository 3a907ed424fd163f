// Copyright (c) The testgraph Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Suite, test and method descriptions.
//!
//! These are the fully-materialised inputs to the execution core. Discovery,
//! parsing and annotation scanning happen elsewhere; by the time a
//! [`SuiteDescription`] reaches [`SuiteRunner`](crate::runner::SuiteRunner)
//! it is immutable for the duration of the run.

use crate::invoker::{DataProvider, RetryAnalyzer};
use debug_ignore::DebugIgnore;
use indexmap::IndexMap;
use serde::Deserialize;
use std::{fmt, hash::Hash, hash::Hasher, sync::Arc};

use crate::config::{ParallelMode, ThreadCount, TimeLimit};

/// An opaque parameter value produced by a data provider.
pub type ParamValue = serde_json::Value;

/// One tuple of positional arguments for a single invocation.
pub type ParameterRow = Vec<ParamValue>;

/// A named parameter map attached to a suite or test.
pub type ParameterMap = IndexMap<String, String>;

/// The identity of a test method: declaring class, method name and
/// signature.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct MethodId {
    class: String,
    name: String,
    signature: String,
}

impl MethodId {
    /// Creates a method identity with an empty signature.
    pub fn new(class: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            name: name.into(),
            signature: String::new(),
        }
    }

    /// Creates a method identity with an explicit signature.
    pub fn with_signature(
        class: impl Into<String>,
        name: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        Self {
            class: class.into(),
            name: name.into(),
            signature: signature.into(),
        }
    }

    /// The declaring class.
    pub fn class(&self) -> &str {
        &self.class
    }

    /// The method name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The method signature (may be empty).
    pub fn signature(&self) -> &str {
        &self.signature
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class, self.name)
    }
}

/// The lifecycle role of a method.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum MethodKind {
    /// Runs once before any test in the suite.
    BeforeSuite,
    /// Runs once after every test in the suite.
    AfterSuite,
    /// Runs before a test declaration's methods.
    BeforeTest,
    /// Runs after a test declaration's methods.
    AfterTest,
    /// Runs before the first method of a class.
    BeforeClass,
    /// Runs after the last method of a class.
    AfterClass,
    /// Runs before each test method.
    BeforeMethod,
    /// Runs after each test method.
    AfterMethod,
    /// A plain test method.
    Test,
}

impl MethodKind {
    /// Returns true for every kind except [`MethodKind::Test`].
    pub fn is_configuration(self) -> bool {
        !matches!(self, MethodKind::Test)
    }
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MethodKind::BeforeSuite => "before-suite",
            MethodKind::AfterSuite => "after-suite",
            MethodKind::BeforeTest => "before-test",
            MethodKind::AfterTest => "after-test",
            MethodKind::BeforeClass => "before-class",
            MethodKind::AfterClass => "after-class",
            MethodKind::BeforeMethod => "before-method",
            MethodKind::AfterMethod => "after-method",
            MethodKind::Test => "test",
        };
        write!(f, "{s}")
    }
}

/// One user-defined test or configuration method with its metadata.
///
/// Equality and hashing are by [`MethodId`], so the same declaration reached
/// through different description instances compares equal.
#[derive(Clone, Debug)]
pub struct TestMethod {
    id: MethodId,
    kind: MethodKind,
    groups: Vec<String>,
    depends_on_methods: Vec<MethodId>,
    depends_on_groups: Vec<String>,
    invocation_count: u32,
    thread_pool_size: usize,
    priority: i32,
    skip_failed_invocations: bool,
    retry_analyzer: DebugIgnore<Option<Arc<dyn RetryAnalyzer>>>,
    data_provider: DebugIgnore<Option<Arc<dyn DataProvider>>>,
}

impl TestMethod {
    /// Starts building a method of the given kind.
    pub fn builder(id: MethodId, kind: MethodKind) -> TestMethodBuilder {
        TestMethodBuilder {
            method: TestMethod {
                id,
                kind,
                groups: Vec::new(),
                depends_on_methods: Vec::new(),
                depends_on_groups: Vec::new(),
                invocation_count: 1,
                thread_pool_size: 1,
                priority: 0,
                skip_failed_invocations: false,
                retry_analyzer: DebugIgnore(None),
                data_provider: DebugIgnore(None),
            },
        }
    }

    /// The method identity.
    pub fn id(&self) -> &MethodId {
        &self.id
    }

    /// The lifecycle role.
    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    /// The groups this method belongs to.
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// The methods this method depends on.
    pub fn depends_on_methods(&self) -> &[MethodId] {
        &self.depends_on_methods
    }

    /// The groups this method depends on.
    pub fn depends_on_groups(&self) -> &[String] {
        &self.depends_on_groups
    }

    /// How many invocations this method is budgeted for (at least 1).
    pub fn invocation_count(&self) -> u32 {
        self.invocation_count
    }

    /// The thread pool size for multi-invocation fan-out; 1 means
    /// sequential.
    pub fn thread_pool_size(&self) -> usize {
        self.thread_pool_size
    }

    /// The scheduling priority (lower runs earlier).
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Whether this method requests cascade-skip after a failed invocation.
    pub fn skip_failed_invocations(&self) -> bool {
        self.skip_failed_invocations
    }

    /// The per-method retry analyzer, if any.
    pub fn retry_analyzer(&self) -> Option<&Arc<dyn RetryAnalyzer>> {
        self.retry_analyzer.as_ref()
    }

    /// The data provider feeding parameter rows, if any.
    pub fn data_provider(&self) -> Option<&Arc<dyn DataProvider>> {
        self.data_provider.as_ref()
    }
}

impl PartialEq for TestMethod {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TestMethod {}

impl Hash for TestMethod {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for TestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Builder for [`TestMethod`].
pub struct TestMethodBuilder {
    method: TestMethod,
}

impl TestMethodBuilder {
    /// Adds a group this method belongs to.
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.method.groups.push(group.into());
        self
    }

    /// Adds a method dependency.
    pub fn depends_on_method(mut self, id: MethodId) -> Self {
        self.method.depends_on_methods.push(id);
        self
    }

    /// Adds a group dependency.
    pub fn depends_on_group(mut self, group: impl Into<String>) -> Self {
        self.method.depends_on_groups.push(group.into());
        self
    }

    /// Sets the invocation budget; values below 1 are clamped to 1.
    pub fn invocation_count(mut self, count: u32) -> Self {
        self.method.invocation_count = count.max(1);
        self
    }

    /// Sets the thread pool size for multi-invocation fan-out.
    pub fn thread_pool_size(mut self, size: usize) -> Self {
        self.method.thread_pool_size = size.max(1);
        self
    }

    /// Sets the scheduling priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.method.priority = priority;
        self
    }

    /// Requests cascade-skip after the first failed invocation.
    pub fn skip_failed_invocations(mut self, skip: bool) -> Self {
        self.method.skip_failed_invocations = skip;
        self
    }

    /// Attaches a retry analyzer.
    pub fn retry_analyzer(mut self, analyzer: Arc<dyn RetryAnalyzer>) -> Self {
        self.method.retry_analyzer = DebugIgnore(Some(analyzer));
        self
    }

    /// Attaches a data provider.
    pub fn data_provider(mut self, provider: Arc<dyn DataProvider>) -> Self {
        self.method.data_provider = DebugIgnore(Some(provider));
        self
    }

    /// Builds the method.
    pub fn build(self) -> Arc<TestMethod> {
        Arc::new(self.method)
    }
}

/// One `<test>`-level declaration: a named group of methods with local
/// overrides.
#[derive(Clone, Debug)]
pub struct TestDescription {
    name: String,
    index: usize,
    methods: Vec<Arc<TestMethod>>,
    parameters: ParameterMap,
    skip_failed_invocation_counts: Option<bool>,
    time_out: Option<TimeLimit>,
    parallel: Option<ParallelMode>,
}

impl TestDescription {
    /// Starts building a test description.
    pub fn builder(name: impl Into<String>, index: usize) -> TestDescriptionBuilder {
        TestDescriptionBuilder {
            test: TestDescription {
                name: name.into(),
                index,
                methods: Vec::new(),
                parameters: ParameterMap::new(),
                skip_failed_invocation_counts: None,
                time_out: None,
                parallel: None,
            },
        }
    }

    /// The test name; keys the suite result map.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared position within the suite.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Every method in this test, configuration methods included.
    pub fn methods(&self) -> &[Arc<TestMethod>] {
        &self.methods
    }

    /// The methods of the given kind, in declared order.
    pub fn methods_of_kind(&self, kind: MethodKind) -> Vec<Arc<TestMethod>> {
        self.methods
            .iter()
            .filter(|m| m.kind() == kind)
            .cloned()
            .collect()
    }

    /// The test-level named parameters.
    pub fn parameters(&self) -> &ParameterMap {
        &self.parameters
    }

    /// The local cascade-skip override, if declared.
    pub fn skip_failed_invocation_counts(&self) -> Option<bool> {
        self.skip_failed_invocation_counts
    }

    /// The local time limit override, if declared.
    pub fn time_out(&self) -> Option<TimeLimit> {
        self.time_out
    }

    /// The local parallel-mode override, if declared.
    pub fn parallel(&self) -> Option<ParallelMode> {
        self.parallel
    }
}

/// Builder for [`TestDescription`].
pub struct TestDescriptionBuilder {
    test: TestDescription,
}

impl TestDescriptionBuilder {
    /// Adds a method to the test.
    pub fn add_method(mut self, method: Arc<TestMethod>) -> Self {
        self.test.methods.push(method);
        self
    }

    /// Adds a named parameter.
    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.test.parameters.insert(key.into(), value.into());
        self
    }

    /// Overrides the suite's cascade-skip flag for this test.
    pub fn skip_failed_invocation_counts(mut self, skip: bool) -> Self {
        self.test.skip_failed_invocation_counts = Some(skip);
        self
    }

    /// Overrides the suite's time limit for this test.
    pub fn time_out(mut self, limit: TimeLimit) -> Self {
        self.test.time_out = Some(limit);
        self
    }

    /// Overrides the suite's parallel mode for this test.
    pub fn parallel(mut self, mode: ParallelMode) -> Self {
        self.test.parallel = Some(mode);
        self
    }

    /// Builds the test description.
    pub fn build(self) -> Arc<TestDescription> {
        Arc::new(self.test)
    }
}

/// A named collection of test descriptions with shared configuration.
#[derive(Clone, Debug)]
pub struct SuiteDescription {
    name: String,
    tests: Vec<Arc<TestDescription>>,
    parallel: ParallelMode,
    thread_count: ThreadCount,
    data_provider_thread_count: usize,
    share_thread_pool_for_data_providers: bool,
    use_global_thread_pool: bool,
    skip_failed_invocation_counts: bool,
    time_out: TimeLimit,
    parameters: ParameterMap,
}

impl SuiteDescription {
    /// Starts building a suite description.
    pub fn builder(name: impl Into<String>) -> SuiteDescriptionBuilder {
        SuiteDescriptionBuilder {
            suite: SuiteDescription {
                name: name.into(),
                tests: Vec::new(),
                parallel: ParallelMode::None,
                thread_count: ThreadCount::default(),
                data_provider_thread_count: 10,
                share_thread_pool_for_data_providers: false,
                use_global_thread_pool: false,
                skip_failed_invocation_counts: false,
                time_out: TimeLimit::unlimited(),
                parameters: ParameterMap::new(),
            },
        }
    }

    /// The suite name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The contained tests, sorted by declared index.
    pub fn tests(&self) -> &[Arc<TestDescription>] {
        &self.tests
    }

    /// The parallelism axis for this suite.
    pub fn parallel(&self) -> ParallelMode {
        self.parallel
    }

    /// The worker-pool size for the parallel modes.
    pub fn thread_count(&self) -> ThreadCount {
        self.thread_count
    }

    /// The pool size for parameter-row fan-out.
    pub fn data_provider_thread_count(&self) -> usize {
        self.data_provider_thread_count
    }

    /// Whether one pool is reused across data-provider fan-outs.
    pub fn share_thread_pool_for_data_providers(&self) -> bool {
        self.share_thread_pool_for_data_providers
    }

    /// Whether the test pool doubles as the data-provider pool.
    pub fn use_global_thread_pool(&self) -> bool {
        self.use_global_thread_pool
    }

    /// Whether a failed invocation skips the rest of a method's budget.
    pub fn skip_failed_invocation_counts(&self) -> bool {
        self.skip_failed_invocation_counts
    }

    /// The suite-level time limit.
    pub fn time_out(&self) -> TimeLimit {
        self.time_out
    }

    /// The suite-level named parameters.
    pub fn parameters(&self) -> &ParameterMap {
        &self.parameters
    }

    /// The suite parameters merged with every test's parameters, in declared
    /// order. Later declarations override earlier ones.
    pub fn all_parameters(&self) -> ParameterMap {
        let mut merged = self.parameters.clone();
        for test in &self.tests {
            for (key, value) in test.parameters() {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }
}

/// Builder for [`SuiteDescription`].
pub struct SuiteDescriptionBuilder {
    suite: SuiteDescription,
}

impl SuiteDescriptionBuilder {
    /// Adds a test description.
    pub fn add_test(mut self, test: Arc<TestDescription>) -> Self {
        self.suite.tests.push(test);
        self
    }

    /// Sets the parallelism axis.
    pub fn parallel(mut self, mode: ParallelMode) -> Self {
        self.suite.parallel = mode;
        self
    }

    /// Sets the worker-pool size.
    pub fn thread_count(mut self, count: ThreadCount) -> Self {
        self.suite.thread_count = count;
        self
    }

    /// Sets the data-provider pool size.
    pub fn data_provider_thread_count(mut self, count: usize) -> Self {
        self.suite.data_provider_thread_count = count.max(1);
        self
    }

    /// Shares one pool across data-provider fan-outs.
    pub fn share_thread_pool_for_data_providers(mut self, share: bool) -> Self {
        self.suite.share_thread_pool_for_data_providers = share;
        self
    }

    /// Reuses the test pool for data providers.
    pub fn use_global_thread_pool(mut self, reuse: bool) -> Self {
        self.suite.use_global_thread_pool = reuse;
        self
    }

    /// Sets the suite-wide cascade-skip flag.
    pub fn skip_failed_invocation_counts(mut self, skip: bool) -> Self {
        self.suite.skip_failed_invocation_counts = skip;
        self
    }

    /// Sets the suite-level time limit.
    pub fn time_out(mut self, limit: TimeLimit) -> Self {
        self.suite.time_out = limit;
        self
    }

    /// Adds a named parameter.
    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.suite.parameters.insert(key.into(), value.into());
        self
    }

    /// Builds the suite description. Tests are ordered by their declared
    /// index.
    pub fn build(mut self) -> Arc<SuiteDescription> {
        self.suite.tests.sort_by_key(|test| test.index());
        Arc::new(self.suite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(class: &str, name: &str) -> Arc<TestMethod> {
        TestMethod::builder(MethodId::new(class, name), MethodKind::Test).build()
    }

    #[test]
    fn tests_sorted_by_declared_index() {
        let suite = SuiteDescription::builder("ordering")
            .add_test(
                TestDescription::builder("second", 1)
                    .add_method(method("C", "m2"))
                    .build(),
            )
            .add_test(
                TestDescription::builder("first", 0)
                    .add_method(method("C", "m1"))
                    .build(),
            )
            .build();

        let names: Vec<_> = suite.tests().iter().map(|t| t.name()).collect();
        assert_eq!(names, ["first", "second"]);
    }

    #[test]
    fn all_parameters_merges_suite_and_tests() {
        let suite = SuiteDescription::builder("params")
            .parameter("env", "suite")
            .parameter("region", "eu")
            .add_test(
                TestDescription::builder("t", 0)
                    .parameter("env", "test")
                    .parameter("extra", "1")
                    .build(),
            )
            .build();

        let merged = suite.all_parameters();
        assert_eq!(merged.get("env").map(String::as_str), Some("test"));
        assert_eq!(merged.get("region").map(String::as_str), Some("eu"));
        assert_eq!(merged.get("extra").map(String::as_str), Some("1"));
    }

    #[test]
    fn method_equality_is_by_identity() {
        let a = method("C", "m");
        let b = TestMethod::builder(MethodId::new("C", "m"), MethodKind::Test)
            .priority(7)
            .build();
        assert_eq!(a, b);

        let c = method("C", "other");
        assert_ne!(a, c);
    }

    #[test]
    fn invocation_count_clamped() {
        let m = TestMethod::builder(MethodId::new("C", "m"), MethodKind::Test)
            .invocation_count(0)
            .build();
        assert_eq!(m.invocation_count(), 1);
    }
}
