// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::local::SubmitError;
use super::{Schedule, Tick};
use crate::task::{self, Header, JoinHandle, PollResult, TaskRef, TaskStub};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::future::Future;
use core::ptr;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use mpsc_queue::{MpscQueue, TryDequeueError};
use rt_spin::Mutex;

struct Bound {
    tasks: Vec<TaskRef>,
    closed: bool,
}

/// A scheduler that may be submitted to from any thread, though `run` (and
/// therefore polling) must still happen on a single, consistent thread.
///
/// Unlike [`LocalScheduler`](super::LocalScheduler), wakeups never touch a
/// lock: the ready queue is lock-free regardless of which variant is used.
/// What differs is `submit`/`destroy`, which take a single unfair
/// [`rt_spin::Mutex`] guarding the bound-task list and the closed flag,
/// since those are not on the hot path.
pub struct SharedScheduler {
    run_queue: MpscQueue<Header>,
    queued: AtomicUsize,
    current_task: AtomicPtr<Header>,
    bound: Mutex<Bound>,
}

impl fmt::Debug for SharedScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedScheduler")
            .field("queued", &self.queued.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for SharedScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedScheduler {
    #[must_use]
    pub fn new() -> Self {
        let stub = Box::new(TaskStub::new());
        let stub = NonNull::from(Box::leak(stub));
        Self {
            // Safety: `stub` is leaked for the lifetime of `run_queue` and
            // never reused.
            run_queue: unsafe { MpscQueue::new_with_static_stub(&stub.as_ref().header) },
            queued: AtomicUsize::new(0),
            current_task: AtomicPtr::new(ptr::null_mut()),
            bound: Mutex::new(Bound {
                tasks: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Spawns `future` from any thread, returning a [`JoinHandle`] for its
    /// output.
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

        let mut bound = self.bound.lock();
        if bound.closed {
            return Err(SubmitError::closed());
        }
        bound.tasks.push(task.clone());
        drop(bound);

        self.schedule(task);
        Ok(join)
    }

    /// Runs ready tasks once each in FIFO order until the ready queue is
    /// empty. Returns `true` once no tasks remain anywhere.
    ///
    /// Not re-entrant, and must always be called from the same thread.
    pub fn run(&'static self) -> bool {
        loop {
            let tick = self.tick_n(usize::MAX);
            if !tick.has_remaining {
                break;
            }
        }
        self.bound.lock().tasks.is_empty()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.bound.lock().tasks.len()
    }

    /// Closes the scheduler so no further submits succeed, then cancels and
    /// drops every task still bound to it.
    pub fn destroy(&'static self) {
        let tasks = {
            let mut bound = self.bound.lock();
            if bound.closed {
                return;
            }
            bound.closed = true;
            core::mem::take(&mut bound.tasks)
        };

        while self.run_queue.try_dequeue().is_ok() {}

        for task in tasks {
            task.cancel();
        }
    }

    fn unbind(&self, task: &TaskRef) {
        self.bound.lock().tasks.retain(|t| t != task);
    }

    fn schedule(&self, task: TaskRef) {
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.run_queue.enqueue(task);
    }
}

impl Schedule for &'static SharedScheduler {
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
        // Wakeups never take the bound-list lock: the ready queue alone
        // decides whether a task is pollable again.
        self.schedule(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::AtomicU32;

    fn leaked() -> &'static SharedScheduler {
        Box::leak(Box::new(SharedScheduler::new()))
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
        assert!(sched.submit(async {}).is_err());
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
