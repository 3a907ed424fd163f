// Copyright (c) The testgraph Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Timekeeping for test results.

mod stopwatch;

pub(crate) use stopwatch::*;
