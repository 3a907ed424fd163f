// Copyright (c) The testgraph Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The three runners: suite, test and method.
//!
//! Control flows one way downward (suite -> test -> method), results bubble
//! one way upward, and listeners are notified laterally at each stage.

mod method;
mod suite;
mod test;

pub use method::*;
pub use suite::*;
pub use test::*;
