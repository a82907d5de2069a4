// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::{Schedule, Tick};
use crate::task::{self, Header, JoinHandle, PollResult, TaskRef, TaskStub};
use alloc::vec::Vec;
use core::fmt;
use core::future::Future;
use core::ptr;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use mpsc_queue::{MpscQueue, TryDequeueError};
use rt_spin::Mutex;

/// A task was submitted after the scheduler it targets was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitError(());

impl SubmitError {
    pub(crate) const fn closed() -> Self {
        Self(())
    }
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheduler is shut down")
    }
}

impl core::error::Error for SubmitError {}

/// A single-threaded scheduler: `submit` and `run` must only ever be called
/// from the thread that owns it, but wakeups (and therefore `wake`) may
/// arrive from any thread.
///
/// Closing is the only place this scheduler needs synchronisation beyond the
/// lock-free ready queue: a wakeup racing a concurrent [`destroy`](Self::destroy)
/// must not enqueue a task into a queue that is about to be torn down, and
/// `destroy` must not tear down the queue while a wakeup is mid-enqueue. Both
/// sides coordinate through a single atomic counter: the low bit records
/// "closed", the remaining bits count wakeups currently inside their
/// enqueue critical section.
pub struct LocalScheduler {
    run_queue: MpscQueue<Header>,
    queued: AtomicUsize,
    current_task: AtomicPtr<Header>,
    close: AtomicUsize,
    bound: Mutex<Vec<TaskRef>>,
}

const CLOSED: usize = 1;
const CRITICAL_SECTION: usize = 2;

impl fmt::Debug for LocalScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalScheduler")
            .field("queued", &self.queued.load(Ordering::Relaxed))
            .field("closed", &(self.close.load(Ordering::Relaxed) & CLOSED != 0))
            .finish_non_exhaustive()
    }
}

impl Default for LocalScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalScheduler {
    #[must_use]
    pub fn new() -> Self {
        let stub = alloc::boxed::Box::new(TaskStub::new());
        let stub = NonNull::from(alloc::boxed::Box::leak(stub));
        Self {
            // Safety: `stub` is leaked for the lifetime of `run_queue` and
            // never reused.
            run_queue: unsafe { MpscQueue::new_with_static_stub(&stub.as_ref().header) },
            queued: AtomicUsize::new(0),
            current_task: AtomicPtr::new(ptr::null_mut()),
            close: AtomicUsize::new(0),
            bound: Mutex::new(Vec::new()),
        }
    }

    /// Spawns `future`, returning a [`JoinHandle`] for its output.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError`] if this scheduler has already been
    /// [`destroy`](Self::destroy)ed.
    pub fn submit<F>(&'static self, future: F) -> Result<JoinHandle<F::Output>, SubmitError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.submit_with(self, future)
    }

    /// Like [`submit`](Self::submit), but spawns the task with `scheduler` as
    /// its `Schedule` handle instead of `&'static Self` directly. Used by the
    /// executor façade to wrap tasks in a scheduler that also signals a
    /// parking mechanism on every wake.
    pub(crate) fn submit_with<F, S>(&'static self, scheduler: S, future: F) -> Result<JoinHandle<F::Output>, SubmitError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
        S: Schedule,
    {
        let (task, join) = task::spawn(scheduler, future);
        self.bind(task.clone());
        if self.try_enqueue(task.clone()) {
            Ok(join)
        } else {
            self.unbind(&task);
            Err(SubmitError::closed())
        }
    }

    /// Runs ready tasks once each in FIFO order until the ready queue is
    /// empty. Returns `true` once no tasks remain anywhere (ready queue and
    /// bound list both empty).
    ///
    /// Not re-entrant: do not call `run` from within a task polled by this
    /// scheduler.
    pub fn run(&'static self) -> bool {
        loop {
            let tick = self.tick_n(usize::MAX);
            if tick.has_remaining {
                continue;
            }
            break;
        }
        self.bound.lock().is_empty()
    }

    /// The number of tasks currently bound to this scheduler (spawned but
    /// not yet completed).
    #[must_use]
    pub fn count(&self) -> usize {
        self.bound.lock().len()
    }

    /// Closes the scheduler so no further submits succeed, then cancels and
    /// drops every task still bound to it.
    pub fn destroy(&'static self) {
        loop {
            let cur = self.close.load(Ordering::Acquire);
            if cur & CLOSED != 0 {
                return;
            }
            if cur / CRITICAL_SECTION != 0 {
                core::hint::spin_loop();
                continue;
            }
            if self
                .close
                .compare_exchange_weak(cur, cur | CLOSED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        while self.run_queue.try_dequeue().is_ok() {}

        let bound = core::mem::take(&mut *self.bound.lock());
        for task in bound {
            task.cancel();
        }
    }

    fn bind(&self, task: TaskRef) {
        self.bound.lock().push(task);
    }

    fn unbind(&self, task: &TaskRef) {
        self.bound.lock().retain(|t| t != task);
    }

    /// Attempts to enqueue `task`, backing out if the scheduler has been
    /// closed concurrently. Returns `false` if the scheduler was closed.
    fn try_enqueue(&self, task: TaskRef) -> bool {
        let mut cur = self.close.load(Ordering::Acquire);
        loop {
            match self.close.compare_exchange_weak(
                cur,
                cur + CRITICAL_SECTION,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }

        let ok = if cur & CLOSED != 0 {
            drop(task);
            false
        } else {
            self.schedule(task);
            true
        };

        self.close.fetch_sub(CRITICAL_SECTION, Ordering::AcqRel);
        ok
    }

    fn schedule(&self, task: TaskRef) {
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.run_queue.enqueue(task);
    }
}

impl Schedule for &'static LocalScheduler {
    fn tick_n(&self, n: usize) -> Tick {
        let mut tick = Tick {
            has_remaining: false,
            polled: 0,
            completed: 0,
        };

        while tick.polled < n {
            let task = match self.run_queue.try_dequeue() {
                Ok(task) => task,
                Err(TryDequeueError::Inconsistent) => {
                    core::hint::spin_loop();
                    continue;
                }
                Err(TryDequeueError::Busy | TryDequeueError::Empty) => break,
            };

            self.queued.fetch_sub(1, Ordering::SeqCst);
            self.current_task
                .store(task.header_ptr().as_ptr(), Ordering::Release);

            let result = task.poll();

            self.current_task.store(ptr::null_mut(), Ordering::Release);
            tick.polled += 1;

            match result {
                PollResult::Ready => {
                    tick.completed += 1;
                    self.unbind(&task);
                }
                PollResult::PendingSchedule => self.schedule(task),
                PollResult::Pending => {}
            }
        }

        if self.queued.load(Ordering::SeqCst) > 0 {
            tick.has_remaining = true;
        }

        tick
    }

    fn current_task(&self) -> Option<TaskRef> {
        let ptr = self.current_task.load(Ordering::Acquire);
        Some(TaskRef::clone_from_raw(NonNull::new(ptr)?))
    }

    fn spawn(&self, task: TaskRef) {
        self.schedule(task);
    }

    fn wake(&self, task: TaskRef) {
        self.try_enqueue(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::AtomicU32;

    fn leaked() -> &'static LocalScheduler {
        alloc::boxed::Box::leak(alloc::boxed::Box::new(LocalScheduler::new()))
    }

    #[test]
    fn runs_spawned_task_to_completion() {
        let sched = leaked();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let _join = sched
            .submit(async move {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(sched.run());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn submit_after_destroy_is_rejected() {
        let sched = leaked();
        sched.destroy();
        let result = sched.submit(async {});
        assert!(result.is_err());
    }

    #[test]
    fn count_reflects_bound_tasks() {
        let sched = leaked();
        assert_eq!(sched.count(), 0);
        let _join = sched.submit(async {}).unwrap();
        assert_eq!(sched.count(), 1);
        assert!(sched.run());
        assert_eq!(sched.count(), 0);
    }
}

/// Allocates a [`LocalScheduler`] in a `'static` slot, matching the lifetime
/// `Schedule for &'static LocalScheduler` requires.
#[cfg(feature = "std")]
#[macro_export]
macro_rules! local_scheduler {
    () => {{
        static SCHEDULER: ::std::sync::OnceLock<$crate::scheduler::LocalScheduler> =
            ::std::sync::OnceLock::new();
        SCHEDULER.get_or_init($crate::scheduler::LocalScheduler::new)
    }};
}
