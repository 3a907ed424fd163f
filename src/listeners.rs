// Copyright (c) The testgraph Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Listener interfaces and their registries.
//!
//! Observers are notified laterally at each stage of a run: suite listeners
//! around the whole suite, test listeners around each test, invoked-method
//! and data-provider listeners around individual invocations. Registration
//! is idempotent per concrete listener type, and registries preserve
//! insertion order so an external comparator can reorder dispatch stably.
//!
//! A listener that panics is logged and swallowed; the remaining listeners
//! still run.

use crate::{
    list::TestMethod,
    results::{InvokedMethod, TestResult},
    runner::{SuiteRunner, TestContext},
};
use indexmap::IndexMap;
use std::{
    any::{Any, TypeId},
    cmp::Ordering,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};
use tracing::warn;

/// Observes the suite lifecycle.
pub trait SuiteListener: Any + Send + Sync {
    /// Called before any test in the suite runs.
    fn on_start(&self, _suite: &SuiteRunner) {}

    /// Called after every test in the suite has run.
    fn on_finish(&self, _suite: &SuiteRunner) {}
}

/// Observes one test declaration's lifecycle and its per-method outcomes.
pub trait TestListener: Any + Send + Sync {
    /// Called before the test's methods run.
    fn on_start(&self, _ctx: &TestContext) {}

    /// Called after the test's methods have run.
    fn on_finish(&self, _ctx: &TestContext) {}

    /// Called for every passed test-method result.
    fn on_test_success(&self, _result: &TestResult) {}

    /// Called for every failed test-method result.
    fn on_test_failure(&self, _result: &TestResult) {}

    /// Called for every skipped test-method result.
    fn on_test_skipped(&self, _result: &TestResult) {}

    /// Called for every failure kept within the method's success
    /// percentage.
    fn on_test_failed_within_success_percentage(&self, _result: &TestResult) {}
}

/// Observes per-class lifecycle boundaries. Driven by the external invoker.
pub trait ClassListener: Any + Send + Sync {
    /// Called before the first method of a class.
    fn on_before_class(&self, _class: &str) {}

    /// Called after the last method of a class.
    fn on_after_class(&self, _class: &str) {}
}

/// Observes each individual invocation.
pub trait InvokedMethodListener: Any + Send + Sync {
    /// Called before an invocation starts.
    fn before_invocation(&self, _invoked: &InvokedMethod, _result: &TestResult) {}

    /// Called after an invocation finishes.
    fn after_invocation(&self, _invoked: &InvokedMethod, _result: &TestResult) {}
}

/// Observes configuration-method outcomes.
pub trait ConfigurationListener: Any + Send + Sync {
    /// Called for every passed configuration result.
    fn on_configuration_success(&self, _result: &TestResult) {}

    /// Called for every failed configuration result.
    fn on_configuration_failure(&self, _result: &TestResult) {}

    /// Called for every skipped configuration result.
    fn on_configuration_skip(&self, _result: &TestResult) {}
}

/// Observes data-provider execution around row materialisation.
pub trait DataProviderListener: Any + Send + Sync {
    /// Called before a method's rows are produced.
    fn before_data_provider_execution(&self, _method: &TestMethod, _ctx: &TestContext) {}

    /// Called after a method's rows have been produced.
    fn after_data_provider_execution(&self, _method: &TestMethod, _ctx: &TestContext) {}
}

/// Receives a DOT rendering of each test's method graph.
pub trait ExecutionVisualiser: Any + Send + Sync {
    /// Consumes the graph in DOT syntax.
    fn consume_dot(&self, _dot: &str) {}
}

/// Renders the finished suite. Invoked by the hosting framework, not by the
/// core.
pub trait Reporter: Any + Send + Sync {
    /// Produces a report from the suite's results.
    fn generate_report(&self, _suite: &SuiteRunner) {}
}

/// The stable identity of a registered listener: its concrete type name and
/// registration index.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ListenerMeta {
    /// The concrete type name of the listener.
    pub type_name: &'static str,

    /// The zero-based registration order.
    pub index: usize,
}

/// Orders listener dispatch; compares registration identities, never the
/// listeners themselves. Must be a stable ordering.
pub type ListenerComparator = Arc<dyn Fn(&ListenerMeta, &ListenerMeta) -> Ordering + Send + Sync>;

pub(crate) struct ListenerEntry<L: ?Sized> {
    pub(crate) meta: ListenerMeta,
    pub(crate) listener: Arc<L>,
}

/// An insertion-ordered registry, idempotent per concrete listener type.
pub(crate) struct ListenerRegistry<L: ?Sized> {
    entries: IndexMap<TypeId, ListenerEntry<L>>,
}

impl<L: ?Sized> Default for ListenerRegistry<L> {
    fn default() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }
}

impl<L: ?Sized> ListenerRegistry<L> {
    /// Registers a listener under its concrete type. Returns false if that
    /// type was already registered.
    pub(crate) fn insert(
        &mut self,
        type_id: TypeId,
        type_name: &'static str,
        listener: Arc<L>,
    ) -> bool {
        if self.entries.contains_key(&type_id) {
            return false;
        }
        let meta = ListenerMeta {
            type_name,
            index: self.entries.len(),
        };
        self.entries.insert(type_id, ListenerEntry { meta, listener });
        true
    }

    /// A snapshot of the raw entries, for propagating registrations to
    /// another registry without losing type identity.
    pub(crate) fn entries(&self) -> Vec<(TypeId, ListenerMeta, Arc<L>)> {
        self.entries
            .iter()
            .map(|(type_id, entry)| (*type_id, entry.meta, entry.listener.clone()))
            .collect()
    }

    /// A snapshot in registration order.
    pub(crate) fn snapshot(&self) -> Vec<Arc<L>> {
        self.entries
            .values()
            .map(|entry| entry.listener.clone())
            .collect()
    }

    /// A snapshot in comparator order (registration order if none).
    pub(crate) fn ordered(&self, comparator: Option<&ListenerComparator>) -> Vec<Arc<L>> {
        let mut entries: Vec<_> = self
            .entries
            .values()
            .map(|entry| (entry.meta, entry.listener.clone()))
            .collect();
        if let Some(comparator) = comparator {
            entries.sort_by(|a, b| comparator(&a.0, &b.0));
        }
        entries.into_iter().map(|(_, listener)| listener).collect()
    }

    /// The exact reverse of [`ordered`](Self::ordered).
    pub(crate) fn reversed(&self, comparator: Option<&ListenerComparator>) -> Vec<Arc<L>> {
        let mut ordered = self.ordered(comparator);
        ordered.reverse();
        ordered
    }
}

/// Calls `f` for each listener, logging and swallowing panics so every
/// listener sees the event.
pub(crate) fn notify_each<L: ?Sized>(listeners: &[Arc<L>], mut f: impl FnMut(&L)) {
    for listener in listeners {
        if catch_unwind(AssertUnwindSafe(|| f(listener))).is_err() {
            warn!("listener panicked; continuing with the remaining listeners");
        }
    }
}
