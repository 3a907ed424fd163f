// Copyright (c) The testgraph Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for test execution.
//!
//! The enumerated options a suite description recognises are modelled as
//! small value types with string and serde representations, so hosting tools
//! can embed them in their own configuration files. The [`Configuration`]
//! bundle threads the externally-supplied collaborators (invokers,
//! factories, comparators) and the [`RuntimeSettings`] flags from the top of
//! the run down to every component; there is no process-global state.

use crate::{
    errors::ParallelModeParseError,
    invoker::{
        ConfigInvoker, DefaultObjectFactory, DefaultParameterResolver, DefaultPoolFactory,
        FallbackObjectFactory, ParameterResolver, PoolFactory, TestInvoker,
    },
    list::TestMethod,
    listeners::ListenerComparator,
};
use debug_ignore::DebugIgnore;
use serde::Deserialize;
use std::{cmp::Ordering, fmt, str::FromStr, sync::Arc, time::Duration};

/// The axis along which a suite parallelises its work.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ParallelMode {
    /// Everything runs sequentially on the calling thread.
    #[default]
    None,

    /// Contained tests run in parallel; each test is internally sequential.
    Tests,

    /// Test methods run in parallel within each test.
    Methods,

    /// Test classes run in parallel within each test.
    Classes,

    /// Test class instances run in parallel within each test.
    Instances,
}

impl ParallelMode {
    /// Returns the string forms accepted by [`FromStr`].
    pub fn variants() -> [&'static str; 5] {
        ["none", "tests", "methods", "classes", "instances"]
    }

    /// Returns true if this mode parallelises anything at all.
    pub fn is_parallel(self) -> bool {
        !matches!(self, ParallelMode::None)
    }
}

impl FromStr for ParallelMode {
    type Err = ParallelModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ParallelMode::None),
            "tests" => Ok(ParallelMode::Tests),
            "methods" => Ok(ParallelMode::Methods),
            "classes" => Ok(ParallelMode::Classes),
            "instances" => Ok(ParallelMode::Instances),
            other => Err(ParallelModeParseError::new(other)),
        }
    }
}

impl fmt::Display for ParallelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParallelMode::None => "none",
            ParallelMode::Tests => "tests",
            ParallelMode::Methods => "methods",
            ParallelMode::Classes => "classes",
            ParallelMode::Instances => "instances",
        };
        write!(f, "{s}")
    }
}

/// The number of worker threads used by the parallel modes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThreadCount {
    /// Run with a specified number of threads.
    Count(usize),

    /// Run with a number of threads equal to the logical CPU count.
    NumCpus,
}

impl ThreadCount {
    /// Gets the actual number of threads computed at runtime.
    pub fn compute(self) -> usize {
        match self {
            Self::Count(threads) => threads,
            Self::NumCpus => num_cpus::get(),
        }
    }
}

impl Default for ThreadCount {
    fn default() -> Self {
        // Matches the historical default of five worker threads.
        ThreadCount::Count(5)
    }
}

impl fmt::Display for ThreadCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(threads) => write!(f, "{threads}"),
            Self::NumCpus => write!(f, "num-cpus"),
        }
    }
}

impl<'de> Deserialize<'de> for ThreadCount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = ThreadCount;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a positive integer or the string \"num-cpus\"")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v == "num-cpus" {
                    Ok(ThreadCount::NumCpus)
                } else {
                    Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Str(v),
                        &self,
                    ))
                }
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v > 0 {
                    Ok(ThreadCount::Count(v as usize))
                } else {
                    Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Signed(v),
                        &self,
                    ))
                }
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v > 0 {
                    Ok(ThreadCount::Count(v as usize))
                } else {
                    Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Unsigned(v),
                        &self,
                    ))
                }
            }
        }

        deserializer.deserialize_any(V)
    }
}

/// A deadline in milliseconds, where zero means unlimited.
///
/// Bounds the suite pool wait in parallel-tests mode and each test's
/// orchestrator wait otherwise.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TimeLimit(Option<Duration>);

impl TimeLimit {
    /// An unlimited time limit.
    pub fn unlimited() -> Self {
        TimeLimit(None)
    }

    /// A time limit of the given number of milliseconds; zero means
    /// unlimited.
    pub fn from_millis(millis: u64) -> Self {
        if millis == 0 {
            TimeLimit(None)
        } else {
            TimeLimit(Some(Duration::from_millis(millis)))
        }
    }

    /// The limit as a [`Duration`], or `None` if unlimited.
    pub fn as_duration(self) -> Option<Duration> {
        self.0
    }
}

impl fmt::Display for TimeLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(limit) => write!(f, "{}ms", limit.as_millis()),
            None => write!(f, "unlimited"),
        }
    }
}

impl<'de> Deserialize<'de> for TimeLimit {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = TimeLimit;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a number of milliseconds (0 means unlimited)")
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v >= 0 {
                    Ok(TimeLimit::from_millis(v as u64))
                } else {
                    Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Signed(v),
                        &self,
                    ))
                }
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(TimeLimit::from_millis(v))
            }
        }

        deserializer.deserialize_any(V)
    }
}

/// Run-wide behavioural flags.
///
/// These are carried inside [`Configuration`] rather than read from global
/// state, so two suites in one process can run with different settings.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct RuntimeSettings {
    /// Treat any parallel mode other than `none` as a request for
    /// suite-level parallelism.
    pub strict_parallelism: bool,

    /// Pin dependent graph nodes to the pool thread their predecessor ran
    /// on.
    pub enforce_thread_affinity: bool,
}

/// Orders test methods before scheduling; free graph nodes are sorted with
/// this before submission.
pub type MethodComparator =
    Arc<dyn Fn(&Arc<TestMethod>, &Arc<TestMethod>) -> Ordering + Send + Sync>;

/// The default method comparator: ascending priority.
///
/// Ties are left alone; the scheduler sorts stably, so equal-priority
/// methods keep their declared order.
pub fn default_method_comparator() -> MethodComparator {
    Arc::new(|a, b| a.priority().cmp(&b.priority()))
}

/// The externally-supplied collaborators and flags for a run.
///
/// Immutable once built; shared by every runner in the suite.
#[derive(Debug)]
pub struct Configuration {
    test_invoker: DebugIgnore<Arc<dyn TestInvoker>>,
    config_invoker: DebugIgnore<Arc<dyn ConfigInvoker>>,
    parameter_resolver: DebugIgnore<Arc<dyn ParameterResolver>>,
    object_factory: FallbackObjectFactory,
    pool_factory: DebugIgnore<Arc<dyn PoolFactory>>,
    listener_comparator: DebugIgnore<Option<ListenerComparator>>,
    method_comparator: DebugIgnore<MethodComparator>,
    settings: RuntimeSettings,
}

impl Configuration {
    /// Starts building a configuration around the two mandatory invokers.
    pub fn builder(
        test_invoker: Arc<dyn TestInvoker>,
        config_invoker: Arc<dyn ConfigInvoker>,
    ) -> ConfigurationBuilder {
        ConfigurationBuilder {
            test_invoker,
            config_invoker,
            parameter_resolver: Arc::new(DefaultParameterResolver),
            suite_object_factory: None,
            pool_factory: Arc::new(DefaultPoolFactory),
            listener_comparator: None,
            method_comparator: default_method_comparator(),
            settings: RuntimeSettings::default(),
        }
    }

    /// The invoker for test methods.
    pub fn test_invoker(&self) -> &Arc<dyn TestInvoker> {
        &self.test_invoker
    }

    /// The invoker for configuration methods.
    pub fn config_invoker(&self) -> &Arc<dyn ConfigInvoker> {
        &self.config_invoker
    }

    /// The parameter resolver applied to each row before invocation.
    pub fn parameter_resolver(&self) -> &Arc<dyn ParameterResolver> {
        &self.parameter_resolver
    }

    /// The object factory chain used to instantiate test classes.
    pub fn object_factory(&self) -> &FallbackObjectFactory {
        &self.object_factory
    }

    /// The factory for worker pools.
    pub fn pool_factory(&self) -> &Arc<dyn PoolFactory> {
        &self.pool_factory
    }

    /// The external listener ordering, if any.
    pub fn listener_comparator(&self) -> Option<&ListenerComparator> {
        self.listener_comparator.as_ref()
    }

    /// The method scheduling order.
    pub fn method_comparator(&self) -> &MethodComparator {
        &self.method_comparator
    }

    /// The run-wide behavioural flags.
    pub fn settings(&self) -> RuntimeSettings {
        self.settings
    }
}

/// Builder for [`Configuration`].
pub struct ConfigurationBuilder {
    test_invoker: Arc<dyn TestInvoker>,
    config_invoker: Arc<dyn ConfigInvoker>,
    parameter_resolver: Arc<dyn ParameterResolver>,
    suite_object_factory: Option<Arc<dyn crate::invoker::ObjectFactory>>,
    pool_factory: Arc<dyn PoolFactory>,
    listener_comparator: Option<ListenerComparator>,
    method_comparator: MethodComparator,
    settings: RuntimeSettings,
}

impl ConfigurationBuilder {
    /// Sets the parameter resolver.
    pub fn set_parameter_resolver(&mut self, resolver: Arc<dyn ParameterResolver>) -> &mut Self {
        self.parameter_resolver = resolver;
        self
    }

    /// Sets the suite-supplied object factory, tried before the default one.
    pub fn set_suite_object_factory(
        &mut self,
        factory: Arc<dyn crate::invoker::ObjectFactory>,
    ) -> &mut Self {
        self.suite_object_factory = Some(factory);
        self
    }

    /// Sets the worker-pool factory.
    pub fn set_pool_factory(&mut self, factory: Arc<dyn PoolFactory>) -> &mut Self {
        self.pool_factory = factory;
        self
    }

    /// Sets the external listener ordering.
    pub fn set_listener_comparator(&mut self, comparator: ListenerComparator) -> &mut Self {
        self.listener_comparator = Some(comparator);
        self
    }

    /// Sets the method scheduling order.
    pub fn set_method_comparator(&mut self, comparator: MethodComparator) -> &mut Self {
        self.method_comparator = comparator;
        self
    }

    /// Sets the run-wide behavioural flags.
    pub fn set_settings(&mut self, settings: RuntimeSettings) -> &mut Self {
        self.settings = settings;
        self
    }

    /// Builds the configuration.
    pub fn build(&self) -> Configuration {
        Configuration {
            test_invoker: DebugIgnore(self.test_invoker.clone()),
            config_invoker: DebugIgnore(self.config_invoker.clone()),
            parameter_resolver: DebugIgnore(self.parameter_resolver.clone()),
            object_factory: FallbackObjectFactory::new(
                self.suite_object_factory.clone(),
                Arc::new(DefaultObjectFactory),
            ),
            pool_factory: DebugIgnore(self.pool_factory.clone()),
            listener_comparator: DebugIgnore(self.listener_comparator.clone()),
            method_comparator: DebugIgnore(self.method_comparator.clone()),
            settings: self.settings,
        }
    }
}
