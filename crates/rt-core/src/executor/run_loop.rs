// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Stands in for a platform run loop: a dedup signal flag a run-loop source
//! would check once per iteration, rather than a queue of pending wakeups.

use super::{Executor, ParkingMechanism};
use crate::scheduler::LocalScheduler;
use std::sync::{Condvar, Mutex};

/// A single dedup boolean instead of a counting semaphore: redundant
/// [`signal`](ParkingMechanism::signal) calls between two `park`s collapse
/// into one flag, matching how a run-loop source coalesces repeated wakeups
/// into "run me again," not "run me N more times."
pub struct RunLoopPark {
    signalled: Mutex<bool>,
    cv: Condvar,
}

impl RunLoopPark {
    #[must_use]
    pub fn new() -> Self {
        Self {
            signalled: Mutex::new(false),
            cv: Condvar::new(),
        }
    }
}

impl Default for RunLoopPark {
    fn default() -> Self {
        Self::new()
    }
}

impl ParkingMechanism for RunLoopPark {
    fn signal(&self) {
        let mut signalled = self.signalled.lock().unwrap_or_else(|e| e.into_inner());
        *signalled = true;
        self.cv.notify_all();
    }

    fn park(&self) {
        let mut signalled = self.signalled.lock().unwrap_or_else(|e| e.into_inner());
        while !*signalled {
            signalled = self.cv.wait(signalled).unwrap_or_else(|e| e.into_inner());
        }
        *signalled = false;
    }

    fn wait(&self) {
        self.park();
    }

    fn cancel(&self) {
        self.signal();
    }
}

/// A [`LocalScheduler`] driven from a single dedup signal flag, the way a
/// platform run loop source would be re-armed on each wakeup.
pub type RunLoopExecutor = Executor<&'static LocalScheduler, RunLoopPark>;

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    fn leaked() -> &'static LocalScheduler {
        alloc::boxed::Box::leak(alloc::boxed::Box::new(LocalScheduler::new()))
    }

    #[test]
    fn runs_submitted_future_to_completion() {
        let executor: &'static RunLoopExecutor =
            alloc::boxed::Box::leak(alloc::boxed::Box::new(Executor::new(leaked(), RunLoopPark::new())));
        let count = alloc::sync::Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let _join = executor
            .try_submit(async move {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        executor.run();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn redundant_signals_dedup_to_a_single_wakeup() {
        let mechanism = RunLoopPark::new();
        mechanism.signal();
        mechanism.signal();
        mechanism.signal();
        mechanism.park();
        assert!(!*mechanism.signalled.lock().unwrap());
    }
}
