// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Stands in for a platform serial dispatch queue: one background worker
//! thread, a FIFO run-signal count, and a clean suspend/resume/cancel
//! protocol.

use super::{Executor, ParkingMechanism};
use crate::scheduler::LocalScheduler;
use std::sync::{Condvar, Mutex};

struct State {
    /// Outstanding wakeups not yet consumed by a `park`/`wait` call, mirroring
    /// a counting semaphore.
    pending: usize,
    cancelled: bool,
}

/// Signals through a counting semaphore built on [`Condvar`], the way a
/// serial dispatch queue coalesces redundant wakeups into pending work items
/// without ever running two at once.
pub struct SerialQueuePark {
    state: Mutex<State>,
    cv: Condvar,
}

impl SerialQueuePark {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                pending: 0,
                cancelled: false,
            }),
            cv: Condvar::new(),
        }
    }

    fn park_inner(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while state.pending == 0 && !state.cancelled {
            state = self.cv.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        if state.pending > 0 {
            state.pending -= 1;
        }
    }
}

impl Default for SerialQueuePark {
    fn default() -> Self {
        Self::new()
    }
}

impl ParkingMechanism for SerialQueuePark {
    fn signal(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pending += 1;
        self.cv.notify_all();
    }

    fn park(&self) {
        self.park_inner();
    }

    fn wait(&self) {
        self.park_inner();
    }

    fn cancel(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.cancelled = true;
        self.cv.notify_all();
    }
}

/// A [`LocalScheduler`] driven through a coalescing signal count, the way
/// work would be redispatched onto a platform serial queue.
pub type SerialQueueExecutor = Executor<&'static LocalScheduler, SerialQueuePark>;

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    fn leaked() -> &'static LocalScheduler {
        alloc::boxed::Box::leak(alloc::boxed::Box::new(LocalScheduler::new()))
    }

    #[test]
    fn runs_submitted_future_to_completion() {
        let executor: &'static SerialQueueExecutor = alloc::boxed::Box::leak(alloc::boxed::Box::new(
            Executor::new(leaked(), SerialQueuePark::new()),
        ));
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
    fn redundant_signals_coalesce_into_a_single_pending_wakeup() {
        let mechanism = SerialQueuePark::new();
        mechanism.signal();
        mechanism.signal();
        mechanism.signal();
        assert_eq!(
            mechanism.state.lock().unwrap_or_else(|e| e.into_inner()).pending,
            3
        );
        mechanism.park();
        mechanism.park();
        mechanism.park();
        assert_eq!(
            mechanism.state.lock().unwrap_or_else(|e| e.into_inner()).pending,
            0
        );
    }

    #[test]
    fn cancel_wakes_a_parked_thread() {
        let mechanism = alloc::sync::Arc::new(SerialQueuePark::new());
        let m = mechanism.clone();
        let handle = std::thread::spawn(move || m.park());
        // Give the spawned thread a chance to actually reach `park`.
        std::thread::yield_now();
        mechanism.cancel();
        handle.join().unwrap();
    }
}
