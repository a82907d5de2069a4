// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Scheduler implementations: the part of the runtime that owns the set of
//! live tasks and decides which one runs next.
//!
//! Two shapes are provided, differing only in who is allowed to submit work:
//!
//! - [`local`]: submit and run must both happen on the scheduler's owning
//!   thread; only wakeups may cross threads.
//! - [`shared`]: submit may happen from any thread; run must still happen on
//!   the owning thread.
//!
//! Neither variant steals work from the other; this crate has no
//! multi-threaded work-stealing scheduler, unlike the runtime it descends
//! from.

pub mod local;
pub mod shared;

use crate::task::TaskRef;

pub use local::{LocalScheduler, SubmitError};
pub use shared::SharedScheduler;

/// Information about a scheduler tick, returned by [`Schedule::tick_n`].
#[derive(Debug)]
#[non_exhaustive]
pub struct Tick {
    /// `true` if the run queue still had tasks in it once this tick stopped
    /// polling (either it hit its budget, or the queue went empty mid-tick
    /// and then received more work).
    pub has_remaining: bool,
    /// The number of tasks polled during this tick.
    pub polled: usize,
    /// The number of polled tasks that completed (including cancellation)
    /// during this tick.
    pub completed: usize,
}

/// A scheduler capable of executing tasks spawned onto it.
///
/// Tasks are generic over this trait so the same task machinery works for
/// every scheduler shape; the trait itself is not meant to be implemented
/// outside this crate.
pub trait Schedule: Sized + Clone + 'static {
    /// Runs one tick of the scheduling loop, polling up to `n` tasks from
    /// the ready queue in FIFO order.
    ///
    /// Callers should keep ticking as long as [`Tick::has_remaining`] is
    /// `true`; once it is `false` the scheduler has no more ready work and
    /// the caller should park until the next wakeup.
    fn tick_n(&self, n: usize) -> Tick;

    /// Returns a handle to the task currently being polled on this thread,
    /// if any.
    #[must_use]
    fn current_task(&self) -> Option<TaskRef>;

    /// Submits a freshly spawned task (never polled before) to this
    /// scheduler.
    fn spawn(&self, task: TaskRef);

    /// Reschedules a task that was woken while not being polled.
    ///
    /// Called from [`Waker`](core::task::Waker) implementations; may be
    /// called from any thread.
    fn wake(&self, task: TaskRef);
}
