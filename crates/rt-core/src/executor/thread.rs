// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Parks the literal calling OS thread.

use super::{Executor, ParkingMechanism};
use crate::park::{Parker, StdPark};
use crate::scheduler::LocalScheduler;

/// Parks the OS thread that constructed it by blocking on [`std::thread::park`].
///
/// Must be constructed on the thread that will call [`Executor::run`]:
/// unparking always targets the thread captured at construction time, so a
/// [`signal`](ParkingMechanism::signal) from some other thread only wakes
/// that original thread, not whichever thread most recently called
/// [`park`](ParkingMechanism::park).
pub struct ThreadPark {
    parker: Parker<StdPark>,
}

impl ThreadPark {
    #[must_use]
    pub fn new() -> Self {
        Self {
            parker: Parker::new(StdPark::for_current()),
        }
    }
}

impl Default for ThreadPark {
    fn default() -> Self {
        Self::new()
    }
}

impl ParkingMechanism for ThreadPark {
    fn signal(&self) {
        // Idempotent: unparking a thread that isn't currently parked still
        // marks the parker notified, so the next `park` returns immediately.
        let _ = self.parker.try_unpark();
    }

    fn park(&self) {
        self.parker.park();
    }

    fn wait(&self) {
        self.parker.park();
    }

    fn cancel(&self) {}
}

/// A [`LocalScheduler`] driven by blocking the calling OS thread between
/// ready-queue drains.
pub type ThreadExecutor = Executor<&'static LocalScheduler, ThreadPark>;

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    fn leaked() -> &'static LocalScheduler {
        alloc::boxed::Box::leak(alloc::boxed::Box::new(LocalScheduler::new()))
    }

    #[test]
    fn runs_submitted_future_to_completion() {
        let executor: &'static ThreadExecutor =
            alloc::boxed::Box::leak(alloc::boxed::Box::new(Executor::new(leaked(), ThreadPark::new())));
        let count = alloc::sync::Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let _join = executor
            .try_submit(async move {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        executor.run();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(executor.count(), 0);
    }

    #[test]
    fn capacity_is_enforced() {
        let scheduler = leaked();
        let executor: &'static Executor<&'static LocalScheduler, ThreadPark> =
            alloc::boxed::Box::leak(alloc::boxed::Box::new(Executor::with_capacity(
                scheduler,
                ThreadPark::new(),
                1,
            )));
        let _first = executor.try_submit(async {}).unwrap();
        let second = executor.try_submit(async {});
        assert_eq!(second.unwrap_err(), super::super::ExecutorError::AtCapacity);
    }
}
