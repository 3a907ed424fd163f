// Copyright (c) The testgraph Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by testgraph.
//!
//! The crate follows a three-way policy: errors raised by user test code are
//! captured into results by the invoker and never surface here; errors inside
//! the framework are logged and swallowed; configuration and lifecycle errors
//! are returned to the caller.

use std::{error, fmt};
use thiserror::Error;

/// An error in the suite or test configuration, reported at construction
/// time.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A worker pool was requested with no threads.
    #[error("worker pool `{pool}` requested with {requested} threads (must be at least 1)")]
    InvalidThreadCount {
        /// The name of the pool being constructed.
        pool: String,
        /// The requested thread count.
        requested: usize,
    },

    /// The operating system refused to spawn a pool thread.
    #[error("worker pool `{pool}` failed to spawn a thread: {message}")]
    ThreadSpawn {
        /// The name of the pool being constructed.
        pool: String,
        /// The underlying OS error.
        message: String,
    },

    /// The declared method dependencies form a cycle.
    #[error("method dependencies form a cycle involving `{from}` -> `{to}`")]
    CyclicDependency {
        /// The method whose dependency closed the cycle.
        from: String,
        /// The dependency that closed the cycle.
        to: String,
    },

    /// A method depends on a method that is not part of the test.
    #[error("method `{method}` depends on unknown method `{missing}`")]
    UnknownMethodDependency {
        /// The dependent method.
        method: String,
        /// The missing dependency.
        missing: String,
    },

    /// A method depends on a group no method belongs to.
    #[error("method `{method}` depends on unknown group `{group}`")]
    UnknownGroupDependency {
        /// The dependent method.
        method: String,
        /// The missing group.
        group: String,
    },
}

/// An error caused by using a component outside its lifecycle.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum LifecycleError {
    /// A task was submitted to a pool that has been shut down.
    #[error("task submitted to worker pool `{pool}` after shutdown")]
    SubmitAfterShutdown {
        /// The name of the pool.
        pool: String,
    },

    /// `run()` was called on a suite runner that already ran.
    #[error("suite `{suite}` has already been run")]
    AlreadyRan {
        /// The suite name.
        suite: String,
    },
}

/// An error raised by [`DynamicGraph`](crate::graph::DynamicGraph)
/// operations.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum GraphError {
    /// The node is not part of the graph.
    #[error("node `{node}` is not in the graph")]
    UnknownNode {
        /// A rendering of the node.
        node: String,
    },

    /// The node was added twice.
    #[error("node `{node}` is already in the graph")]
    DuplicateNode {
        /// A rendering of the node.
        node: String,
    },

    /// Adding the edge would make the graph cyclic.
    #[error("edge `{from}` -> `{to}` would create a cycle")]
    EdgeWouldCycle {
        /// The dependent node.
        from: String,
        /// The dependency.
        to: String,
    },

    /// The requested status change violates the monotonic
    /// `ready -> running -> finished` rule.
    #[error("node `{node}`: invalid status transition {from} -> {to}")]
    InvalidTransition {
        /// A rendering of the node.
        node: String,
        /// The current status.
        from: &'static str,
        /// The rejected status.
        to: &'static str,
    },
}

/// An error raised by an external invoker or factory while running user
/// code.
///
/// Invocation errors never escape the method runner: they are logged and the
/// affected row simply produces no result.
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct InvocationError {
    message: String,
}

impl InvocationError {
    /// Creates a new invocation error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Error returned while parsing a [`ParallelMode`](crate::config::ParallelMode)
/// value from a string.
#[derive(Clone, Debug)]
pub struct ParallelModeParseError {
    input: String,
}

impl ParallelModeParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

impl fmt::Display for ParallelModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "unrecognized parallel mode: {}\n(known values: {})",
            self.input,
            crate::config::ParallelMode::variants().join(", ")
        )
    }
}

impl error::Error for ParallelModeParseError {}
