// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The executor façade: pairs a [`scheduler`](crate::scheduler) with a
//! [`ParkingMechanism`] and exposes `submit`/`run`/`wait`.
//!
//! Three realisations are provided, differing only in how the calling thread
//! waits for more work once the ready queue drains: [`ThreadExecutor`] blocks
//! the literal OS thread, [`SerialQueueExecutor`] redispatches onto a FIFO
//! worker thread (standing in for a platform dispatch queue), and
//! [`RunLoopExecutor`] signals a dedicated run-loop thread through a
//! dedup flag (standing in for a platform run loop).

#[cfg(feature = "std")]
mod run_loop;
#[cfg(feature = "std")]
mod serial_queue;
#[cfg(feature = "std")]
mod thread;

#[cfg(feature = "std")]
pub use run_loop::{RunLoopExecutor, RunLoopPark};
#[cfg(feature = "std")]
pub use serial_queue::{SerialQueueExecutor, SerialQueuePark};
#[cfg(feature = "std")]
pub use thread::{ThreadExecutor, ThreadPark};

use crate::scheduler::{LocalScheduler, Schedule, SharedScheduler, SubmitError, Tick};
use crate::task::{JoinHandle, TaskRef};
use core::fmt;
use core::future::Future;

/// Why [`Executor::try_submit`] failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorError {
    /// The executor was constructed with a capacity and is currently at it.
    AtCapacity,
    /// The executor's underlying scheduler has been shut down.
    Shutdown,
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AtCapacity => f.write_str("executor is at capacity"),
            Self::Shutdown => f.write_str("executor is shut down"),
        }
    }
}

impl core::error::Error for ExecutorError {}

impl From<SubmitError> for ExecutorError {
    fn from(_: SubmitError) -> Self {
        Self::Shutdown
    }
}

/// How an executor suspends the calling thread until there's more work, and
/// wakes it back up from elsewhere (possibly another thread).
///
/// `signal` must be safe to call redundantly and concurrently: a realisation
/// that dedups (like [`RunLoopPark`]) is expected to swallow a signal that
/// arrives while a previous one hasn't been serviced yet.
pub trait ParkingMechanism: Send + Sync + 'static {
    /// Wakes whatever is parked waiting for work, or, if nothing is
    /// currently parked, arranges for the next `park`/`wait` call to return
    /// immediately.
    fn signal(&self);
    /// Blocks the calling thread until the next [`signal`](Self::signal).
    ///
    /// Called by [`Executor::run`] between ready-queue drains, always from
    /// the same thread that drives `run`.
    fn park(&self);
    /// Equivalent to [`park`](Self::park), but meant for a thread other than
    /// the one calling [`Executor::run`] — used by [`Executor::wait`] to
    /// block until the next wakeup without itself polling.
    fn wait(&self);
    /// Tears down any background resources (worker threads, and the like).
    fn cancel(&self);
}

/// The scheduler-administration operations every realisation needs,
/// independent of which concrete scheduler shape backs it.
pub trait Runtime: Copy + 'static {
    /// An address uniquely identifying the underlying scheduler, for
    /// [`Executor`]'s identity-based [`PartialEq`].
    fn addr(self) -> usize;

    /// Submits `future`, spawning it with `scheduler` as its `Schedule`
    /// handle so every wake also reaches the owning executor's parking
    /// mechanism.
    fn submit_with<F, S>(self, scheduler: S, future: F) -> Result<JoinHandle<F::Output>, SubmitError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
        S: Schedule;

    /// Runs ready tasks once each in FIFO order until the ready queue is
    /// empty. Returns `true` once no tasks remain anywhere.
    fn run(self) -> bool;

    /// The number of tasks currently bound to the scheduler.
    fn count(self) -> usize;

    /// Closes the scheduler and cancels every task still bound to it.
    fn destroy(self);
}

impl Runtime for &'static LocalScheduler {
    fn addr(self) -> usize {
        core::ptr::from_ref(self) as usize
    }

    fn submit_with<F, S>(self, scheduler: S, future: F) -> Result<JoinHandle<F::Output>, SubmitError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
        S: Schedule,
    {
        LocalScheduler::submit_with(self, scheduler, future)
    }

    fn run(self) -> bool {
        LocalScheduler::run(self)
    }

    fn count(self) -> usize {
        LocalScheduler::count(self)
    }

    fn destroy(self) {
        LocalScheduler::destroy(self);
    }
}

impl Runtime for &'static SharedScheduler {
    fn addr(self) -> usize {
        core::ptr::from_ref(self) as usize
    }

    fn submit_with<F, S>(self, scheduler: S, future: F) -> Result<JoinHandle<F::Output>, SubmitError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
        S: Schedule,
    {
        SharedScheduler::submit_with(self, scheduler, future)
    }

    fn run(self) -> bool {
        SharedScheduler::run(self)
    }

    fn count(self) -> usize {
        SharedScheduler::count(self)
    }

    fn destroy(self) {
        SharedScheduler::destroy(self);
    }
}

/// Wraps a scheduler handle so spawning/waking through it also signals the
/// owning executor's parking mechanism. This is the hook that lets
/// [`Executor::run`] park the calling thread instead of busy-polling: without
/// it, a wakeup arriving on another thread would reach the ready queue but
/// never reach whatever is blocked waiting to drain it.
struct Notifying<S, M: 'static> {
    inner: S,
    mechanism: &'static M,
}

impl<S: Clone, M> Clone for Notifying<S, M> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), mechanism: self.mechanism }
    }
}
impl<S: Copy, M> Copy for Notifying<S, M> {}

impl<S, M> Schedule for Notifying<S, M>
where
    S: Schedule,
    M: ParkingMechanism,
{
    fn tick_n(&self, n: usize) -> Tick {
        self.inner.tick_n(n)
    }

    fn current_task(&self) -> Option<TaskRef> {
        self.inner.current_task()
    }

    fn spawn(&self, task: TaskRef) {
        self.inner.spawn(task);
        self.mechanism.signal();
    }

    fn wake(&self, task: TaskRef) {
        self.inner.wake(task);
        self.mechanism.signal();
    }
}

/// Binds a scheduler to a parking mechanism.
///
/// Two executors are equal exactly when they share the same underlying
/// scheduler, regardless of parking mechanism.
pub struct Executor<S, M: 'static> {
    scheduler: S,
    mechanism: M,
    capacity: Option<usize>,
}

impl<S: Runtime, M> PartialEq for Executor<S, M> {
    fn eq(&self, other: &Self) -> bool {
        self.scheduler.addr() == other.scheduler.addr()
    }
}
impl<S: Runtime, M> Eq for Executor<S, M> {}

impl<S: Runtime, M: ParkingMechanism> Executor<S, M> {
    #[must_use]
    pub fn new(scheduler: S, mechanism: M) -> Self {
        Self { scheduler, mechanism, capacity: None }
    }

    /// Rejects [`try_submit`](Self::try_submit) calls once `count` tasks are
    /// bound, surfacing [`ExecutorError::AtCapacity`] instead.
    #[must_use]
    pub fn with_capacity(scheduler: S, mechanism: M, capacity: usize) -> Self {
        Self { scheduler, mechanism, capacity: Some(capacity) }
    }

    /// Attempts to spawn `future` onto this executor's scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::AtCapacity`] if this executor has a capacity
    /// and is currently at it, or [`ExecutorError::Shutdown`] if the
    /// scheduler has been shut down.
    #[track_caller]
    pub fn try_submit<F>(&'static self, future: F) -> Result<JoinHandle<F::Output>, ExecutorError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if let Some(capacity) = self.capacity {
            if self.scheduler.count() >= capacity {
                return Err(ExecutorError::AtCapacity);
            }
        }
        let scheduler = Notifying { inner: self.scheduler, mechanism: &self.mechanism };
        let join = self.scheduler.submit_with(scheduler, future)?;
        Ok(join)
    }

    /// Drains ready tasks, parking the calling thread whenever none are
    /// ready, until the scheduler reports no tasks remain anywhere.
    ///
    /// Not re-entrant: do not call `run` from within a task this executor is
    /// driving.
    pub fn run(&self) {
        while !self.scheduler.run() {
            self.mechanism.park();
        }
    }

    /// Blocks the calling thread until this executor fully drains, without
    /// itself polling (use on a thread other than the one calling
    /// [`run`](Self::run)).
    pub fn wait(&self) {
        while self.scheduler.count() > 0 {
            self.mechanism.wait();
        }
    }

    /// The number of tasks currently bound to this executor.
    #[must_use]
    pub fn count(&self) -> usize {
        self.scheduler.count()
    }

    /// Shuts down the scheduler (cancelling every bound task) and tears down
    /// the parking mechanism's background resources, if any.
    pub fn shutdown(&self) {
        self.scheduler.destroy();
        self.mechanism.cancel();
    }
}
