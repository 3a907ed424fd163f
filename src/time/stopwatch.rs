// Copyright (c) The testgraph Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stopwatch for tracking how long invocations take.
//!
//! Results need both a wall-clock start time and an accurate duration. For
//! that we pair a `DateTime<Local>` (realtime clock) with an `Instant`
//! (monotonic clock) and report elapsed time off the monotonic clock.

use chrono::{DateTime, Local};
use std::time::{Duration, Instant};

pub(crate) fn stopwatch() -> StopwatchStart {
    StopwatchStart::new()
}

/// The start state of a stopwatch.
#[derive(Clone, Debug)]
pub(crate) struct StopwatchStart {
    start_time: DateTime<Local>,
    instant: Instant,
}

impl StopwatchStart {
    fn new() -> Self {
        Self {
            // These two syscalls happen imperceptibly close to each other,
            // which is good enough for our purposes.
            start_time: Local::now(),
            instant: Instant::now(),
        }
    }

    pub(crate) fn snapshot(&self) -> StopwatchSnapshot {
        StopwatchSnapshot {
            start_time: self.start_time,
            duration: self.instant.elapsed(),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct StopwatchSnapshot {
    pub(crate) start_time: DateTime<Local>,
    pub(crate) duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopwatch_monotonic() {
        let start = stopwatch();
        std::thread::sleep(Duration::from_millis(50));
        let snapshot = start.snapshot();

        assert!(
            snapshot.duration >= Duration::from_millis(50),
            "elapsed duration ({:?}) is at least 50ms",
            snapshot.duration
        );
        assert!(snapshot.start_time <= Local::now());
    }
}
