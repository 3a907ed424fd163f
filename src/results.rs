// Copyright (c) The testgraph Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test results and their aggregation.
//!
//! Every submitted invocation produces exactly one [`TestResult`], appended
//! to exactly one category of a [`TestRunnerResults`]. Suite-level views are
//! [`SuiteResult`] snapshots keyed by test name.

use crate::list::TestMethod;
use chrono::{DateTime, Local};
use std::{fmt, sync::Arc, time::Duration};

/// The outcome of a single invocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TestStatus {
    /// The invocation passed.
    Success,

    /// The invocation failed.
    Failure,

    /// The invocation failed, but the method stayed within its declared
    /// success percentage.
    SuccessWithinPercentage,

    /// The invocation was skipped.
    Skipped,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestStatus::Success => "success",
            TestStatus::Failure => "failure",
            TestStatus::SuccessWithinPercentage => "success-within-percentage",
            TestStatus::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// An error thrown by user test code, captured into a result.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestFailure {
    message: String,
}

impl TestFailure {
    /// Creates a failure with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The failure message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for TestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// The result of one invocation of one method.
#[derive(Clone, Debug)]
pub struct TestResult {
    method: Arc<TestMethod>,
    status: TestStatus,
    start_time: DateTime<Local>,
    end_time: DateTime<Local>,
    failure: Option<TestFailure>,
    parameters_index: Option<usize>,
}

impl TestResult {
    /// Creates a result for the given method and status.
    pub fn new(
        method: Arc<TestMethod>,
        status: TestStatus,
        start_time: DateTime<Local>,
        end_time: DateTime<Local>,
    ) -> Self {
        Self {
            method,
            status,
            start_time,
            end_time,
            failure: None,
            parameters_index: None,
        }
    }

    /// Attaches the captured error.
    pub fn with_failure(mut self, failure: TestFailure) -> Self {
        self.failure = Some(failure);
        self
    }

    /// Attaches the parameter-row index this result came from.
    pub fn with_parameters_index(mut self, index: usize) -> Self {
        self.parameters_index = Some(index);
        self
    }

    /// The method this result belongs to.
    pub fn method(&self) -> &Arc<TestMethod> {
        &self.method
    }

    /// The invocation outcome.
    pub fn status(&self) -> TestStatus {
        self.status
    }

    /// When the invocation started.
    pub fn start_time(&self) -> DateTime<Local> {
        self.start_time
    }

    /// When the invocation ended.
    pub fn end_time(&self) -> DateTime<Local> {
        self.end_time
    }

    /// How long the invocation took.
    pub fn duration(&self) -> Duration {
        (self.end_time - self.start_time).to_std().unwrap_or_default()
    }

    /// The captured error, if any.
    pub fn failure(&self) -> Option<&TestFailure> {
        self.failure.as_ref()
    }

    /// The parameter-row index, if this was a data-driven invocation.
    pub fn parameters_index(&self) -> Option<usize> {
        self.parameters_index
    }
}

/// A record of one method invocation, in the order it happened.
#[derive(Clone, Debug)]
pub struct InvokedMethod {
    method: Arc<TestMethod>,
    invoked_at: DateTime<Local>,
}

impl InvokedMethod {
    /// Creates an invocation record.
    pub fn new(method: Arc<TestMethod>, invoked_at: DateTime<Local>) -> Self {
        Self { method, invoked_at }
    }

    /// The invoked method.
    pub fn method(&self) -> &Arc<TestMethod> {
        &self.method
    }

    /// When the invocation happened.
    pub fn invoked_at(&self) -> DateTime<Local> {
        self.invoked_at
    }
}

/// Which category set a result was appended to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ResultCategory {
    PassedTest,
    FailedTest,
    FailedWithinPercentageTest,
    SkippedTest,
    PassedConfiguration,
    FailedConfiguration,
    FailedWithinPercentageConfiguration,
    SkippedConfiguration,
}

/// The per-test-runner result sets: passed/failed/failed-within-percentage/
/// skipped, for tests and configuration methods separately.
///
/// Each set preserves insertion order.
#[derive(Clone, Debug, Default)]
pub struct TestRunnerResults {
    passed_tests: Vec<TestResult>,
    failed_tests: Vec<TestResult>,
    failed_within_percentage_tests: Vec<TestResult>,
    skipped_tests: Vec<TestResult>,
    passed_configurations: Vec<TestResult>,
    failed_configurations: Vec<TestResult>,
    failed_within_percentage_configurations: Vec<TestResult>,
    skipped_configurations: Vec<TestResult>,
}

impl TestRunnerResults {
    /// Appends a result to the category determined by its method kind and
    /// status, and reports which category that was.
    pub(crate) fn record(&mut self, result: TestResult) -> ResultCategory {
        let configuration = result.method().kind().is_configuration();
        let (set, category) = match (configuration, result.status()) {
            (false, TestStatus::Success) => (&mut self.passed_tests, ResultCategory::PassedTest),
            (false, TestStatus::Failure) => (&mut self.failed_tests, ResultCategory::FailedTest),
            (false, TestStatus::SuccessWithinPercentage) => (
                &mut self.failed_within_percentage_tests,
                ResultCategory::FailedWithinPercentageTest,
            ),
            (false, TestStatus::Skipped) => (&mut self.skipped_tests, ResultCategory::SkippedTest),
            (true, TestStatus::Success) => (
                &mut self.passed_configurations,
                ResultCategory::PassedConfiguration,
            ),
            (true, TestStatus::Failure) => (
                &mut self.failed_configurations,
                ResultCategory::FailedConfiguration,
            ),
            (true, TestStatus::SuccessWithinPercentage) => (
                &mut self.failed_within_percentage_configurations,
                ResultCategory::FailedWithinPercentageConfiguration,
            ),
            (true, TestStatus::Skipped) => (
                &mut self.skipped_configurations,
                ResultCategory::SkippedConfiguration,
            ),
        };
        set.push(result);
        category
    }

    /// Tests that passed.
    pub fn passed_tests(&self) -> &[TestResult] {
        &self.passed_tests
    }

    /// Tests that failed.
    pub fn failed_tests(&self) -> &[TestResult] {
        &self.failed_tests
    }

    /// Tests that failed but stayed within their success percentage.
    pub fn failed_within_percentage_tests(&self) -> &[TestResult] {
        &self.failed_within_percentage_tests
    }

    /// Tests that were skipped.
    pub fn skipped_tests(&self) -> &[TestResult] {
        &self.skipped_tests
    }

    /// Configuration methods that passed.
    pub fn passed_configurations(&self) -> &[TestResult] {
        &self.passed_configurations
    }

    /// Configuration methods that failed.
    pub fn failed_configurations(&self) -> &[TestResult] {
        &self.failed_configurations
    }

    /// Configuration methods that failed within their success percentage.
    pub fn failed_within_percentage_configurations(&self) -> &[TestResult] {
        &self.failed_within_percentage_configurations
    }

    /// Configuration methods that were skipped.
    pub fn skipped_configurations(&self) -> &[TestResult] {
        &self.skipped_configurations
    }

    /// Every recorded result across all eight categories.
    pub fn all_results(&self) -> Vec<&TestResult> {
        self.passed_tests
            .iter()
            .chain(&self.failed_tests)
            .chain(&self.failed_within_percentage_tests)
            .chain(&self.skipped_tests)
            .chain(&self.passed_configurations)
            .chain(&self.failed_configurations)
            .chain(&self.failed_within_percentage_configurations)
            .chain(&self.skipped_configurations)
            .collect()
    }

    /// The total number of test-method results (configurations excluded).
    pub fn test_count(&self) -> usize {
        self.passed_tests.len()
            + self.failed_tests.len()
            + self.failed_within_percentage_tests.len()
            + self.skipped_tests.len()
    }

    /// True if any test or configuration failed outright.
    pub fn has_failures(&self) -> bool {
        !self.failed_tests.is_empty() || !self.failed_configurations.is_empty()
    }
}

/// The aggregated outcome of one test description within a suite.
#[derive(Clone, Debug)]
pub struct SuiteResult {
    test_name: String,
    results: TestRunnerResults,
}

impl SuiteResult {
    /// Creates a suite result entry from a runner's current results.
    pub fn new(test_name: impl Into<String>, results: TestRunnerResults) -> Self {
        Self {
            test_name: test_name.into(),
            results,
        }
    }

    /// The test description name this entry belongs to.
    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    /// The category sets for this test.
    pub fn results(&self) -> &TestRunnerResults {
        &self.results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::{MethodId, MethodKind};

    fn result(kind: MethodKind, status: TestStatus) -> TestResult {
        let method = TestMethod::builder(MethodId::new("C", "m"), kind).build();
        let now = Local::now();
        TestResult::new(method, status, now, now)
    }

    #[test]
    fn record_routes_to_the_right_category() {
        let mut results = TestRunnerResults::default();

        results.record(result(MethodKind::Test, TestStatus::Success));
        results.record(result(MethodKind::Test, TestStatus::Failure));
        results.record(result(MethodKind::Test, TestStatus::Skipped));
        results.record(result(MethodKind::Test, TestStatus::SuccessWithinPercentage));
        results.record(result(MethodKind::BeforeSuite, TestStatus::Success));
        results.record(result(MethodKind::AfterMethod, TestStatus::Failure));

        assert_eq!(results.passed_tests().len(), 1);
        assert_eq!(results.failed_tests().len(), 1);
        assert_eq!(results.skipped_tests().len(), 1);
        assert_eq!(results.failed_within_percentage_tests().len(), 1);
        assert_eq!(results.passed_configurations().len(), 1);
        assert_eq!(results.failed_configurations().len(), 1);
        assert_eq!(results.test_count(), 4);
        assert_eq!(results.all_results().len(), 6);
        assert!(results.has_failures());
    }
}
