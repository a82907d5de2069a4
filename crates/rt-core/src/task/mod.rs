// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tasks are the reusable container a future is polled through.
//!
//! A spawned future is boxed up as a [`Task`], which is rarely touched
//! directly: everything outside this module (the scheduler, wakers,
//! `JoinHandle`) interacts with it through [`TaskRef`], a type-erased,
//! reference-counted pointer to the task's [`Header`]. Erasing the future's
//! concrete type here means the scheduler's ready queue can hold every kind
//! of spawned future in one `MpscQueue<Header>`, rather than needing one
//! queue per future type.
//!
//! # Cancellation
//!
//! Dropping a task's [`JoinHandle`] (without [`detach`](JoinHandle::detach))
//! or calling [`TaskRef::cancel`] marks the task cancelled. The task is
//! guaranteed to not be polled again: the next time the scheduler would poll
//! it, it instead observes the cancellation and completes immediately with
//! [`JoinError`].

mod builder;
mod id;
mod join;
mod state;
mod yield_now;

use crate::scheduler::Schedule;
use alloc::boxed::Box;
use core::any::type_name;
use core::cell::UnsafeCell;
use core::fmt;
use core::future::Future;
use core::mem::{self, offset_of};
use core::pin::Pin;
use core::ptr::NonNull;
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use rt_spin::Mutex;
use rt_util::CachePadded;
use state::{EndPollAction, StartPollAction, State, WakeAction};

pub use builder::TaskBuilder;
pub use id::Id;
pub use join::{JoinError, JoinHandle};
pub use yield_now::yield_now;

/// Outcome of [`TaskRef::poll`], telling the scheduler what to do with the
/// task next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollResult {
    /// The task completed. The scheduler should drop its `TaskRef`.
    Ready,
    /// The task returned pending and was not woken during the poll.
    Pending,
    /// The task woke itself (or was woken concurrently) during the poll; the
    /// scheduler should immediately re-enqueue the same `TaskRef` it polled.
    PendingSchedule,
}

/// A type-erased, reference-counted handle to a spawned task.
///
/// `TaskRef` is the currency the scheduler, waker, and `JoinHandle` trade in;
/// only [`Task::poll`] (reached through the task's vtable) knows the concrete
/// future type.
pub struct TaskRef(NonNull<Header>);

impl TaskRef {
    #[must_use]
    pub fn id(&self) -> Id {
        self.header().id
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state().is_complete()
    }

    /// Marks the task cancelled and wakes it so it can observe the
    /// cancellation and tear down. Returns `true` if this call was the one
    /// that set the flag.
    pub fn cancel(&self) -> bool {
        let cancelled = self.state().cancel();
        if cancelled {
            self.wake_by_ref();
        }
        cancelled
    }

    pub(crate) fn clone_from_raw(ptr: NonNull<Header>) -> TaskRef {
        let this = Self(ptr);
        this.state().clone_ref();
        this
    }

    pub(crate) fn header_ptr(&self) -> NonNull<Header> {
        self.0
    }

    fn header(&self) -> &Header {
        // Safety: constructors only ever produce pointers to a live `Header`.
        unsafe { self.0.as_ref() }
    }

    fn state(&self) -> &State {
        &self.header().state
    }

    pub(crate) fn wake_by_ref(&self) {
        let wake_by_ref = self.header().vtable.wake_by_ref;
        // Safety: dispatched through the task's own vtable.
        unsafe { wake_by_ref(self.0.as_ptr().cast::<()>()) }
    }

    pub(crate) fn poll(&self) -> PollResult {
        let poll = self.header().vtable.poll;
        // Safety: dispatched through the task's own vtable.
        unsafe { poll(self.0) }
    }

    /// Polls this task's output into `outptr`, which must point to a
    /// `MaybeUninit<Result<T, JoinError>>` where `T` is the task's real
    /// output type.
    ///
    /// # Safety
    ///
    /// The caller must ensure `T` matches the future this task was spawned
    /// with, and that `outptr` is valid for a write of that type once `Ready`
    /// is returned.
    pub(crate) unsafe fn poll_join(&self, outptr: NonNull<()>, cx: &mut Context<'_>) -> Poll<()> {
        let poll_join = self.header().vtable.poll_join;
        // Safety: ensured by caller.
        unsafe { poll_join(self.0, outptr, cx) }
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("id", &self.id())
            .field("addr", &self.0)
            .finish()
    }
}

impl PartialEq for TaskRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for TaskRef {}

impl Clone for TaskRef {
    fn clone(&self) -> Self {
        self.state().clone_ref();
        Self(self.0)
    }
}

impl Drop for TaskRef {
    fn drop(&mut self) {
        if !self.state().drop_ref() {
            return;
        }
        let deallocate = self.header().vtable.deallocate;
        // Safety: we just observed the last reference being dropped.
        unsafe { deallocate(self.0) }
    }
}

// Safety: all shared access to the task goes through the atomic `State`
// word, or is only performed once `State` establishes exclusive access.
unsafe impl Send for TaskRef {}
// Safety: see above.
unsafe impl Sync for TaskRef {}

/// Either the future, its completed output, or nothing (output already taken
/// by a `JoinHandle`).
enum Stage<F: Future> {
    Pending(F),
    Ready(Result<F::Output, JoinError>),
    Consumed,
}

/// The part of a task every `Schedule` implementation needs to reach,
/// regardless of the future it is running.
#[repr(C)]
pub(crate) struct Header {
    /// Must remain the first field: every `Linked` impl below computes
    /// offsets from a `NonNull<Header>`, and `Task<F, S>` is laid out with
    /// `Header` (via `Schedulable`) first so that a `NonNull<Task<F, S>>` and
    /// a `NonNull<Header>` to the same allocation are interchangeable.
    state: State,
    vtable: &'static Vtable,
    id: Id,
    run_queue_links: mpsc_queue::Links<Header>,
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header").field("id", &self.id).finish_non_exhaustive()
    }
}

struct Vtable {
    poll: unsafe fn(NonNull<Header>) -> PollResult,
    #[expect(clippy::type_complexity, reason = "mirrors the other fn-pointer fields in this vtable")]
    poll_join: unsafe fn(NonNull<Header>, NonNull<()>, &mut Context<'_>) -> Poll<()>,
    deallocate: unsafe fn(NonNull<Header>),
    wake_by_ref: unsafe fn(*const ()),
}

/// The scheduler-specific portion of a task: the header plus the handle the
/// task uses to reschedule itself.
#[repr(C)]
struct Schedulable<S> {
    header: Header,
    scheduler: S,
}

#[repr(C)]
struct TaskInner<F: Future, S> {
    schedulable: Schedulable<S>,
    stage: UnsafeCell<Stage<F>>,
    /// Waker registered by a pending `JoinHandle`. A plain mutex is enough
    /// here: `poll_join` only touches `stage` once `state.is_complete()` is
    /// observed, so the mutex only ever needs to arbitrate the waker slot
    /// itself, not the stage.
    join_waker: Mutex<Option<Waker>>,
}

/// A spawned future together with its scheduler handle and task bookkeeping.
#[repr(C)]
struct Task<F: Future, S>(CachePadded<TaskInner<F, S>>);

impl<F, S> Task<F, S>
where
    F: Future,
    S: Schedule,
{
    const VTABLE: Vtable = Vtable {
        poll: Self::poll,
        poll_join: Self::poll_join,
        deallocate: Self::deallocate,
        wake_by_ref: Schedulable::<S>::wake_by_ref,
    };

    fn new(scheduler: S, future: F, id: Id) -> Self {
        Self(CachePadded(TaskInner {
            schedulable: Schedulable {
                header: Header {
                    state: State::new(),
                    vtable: &Self::VTABLE,
                    id,
                    run_queue_links: mpsc_queue::Links::new(),
                },
                scheduler,
            },
            stage: UnsafeCell::new(Stage::Pending(future)),
            join_waker: Mutex::new(None),
        }))
    }

    fn id(&self) -> Id {
        self.0.0.schedulable.header.id
    }

    fn state(&self) -> &State {
        &self.0.0.schedulable.header.state
    }

    /// # Safety
    /// `ptr` must point at the `Header` embedded in a `Task<F, S>`.
    unsafe fn poll(ptr: NonNull<Header>) -> PollResult {
        // Safety: ensured by caller.
        let this = unsafe { ptr.cast::<Self>().as_ref() };

        let _span = tracing::trace_span!(
            "poll",
            task.id = this.id().as_u64(),
            task.output = type_name::<F::Output>(),
        )
        .entered();

        match this.state().start_poll() {
            StartPollAction::AlreadyComplete => {
                tracing::warn!("task polled after it already completed");
                return PollResult::Ready;
            }
            StartPollAction::Cancelled => {
                // Safety: COMPLETE was just set by `start_poll`; we have
                // exclusive access to `stage` (no poll is in flight, and a
                // `JoinHandle` will not touch `stage` until it too observes
                // COMPLETE).
                unsafe {
                    *this.0.0.stage.get() = Stage::Ready(Err(JoinError::cancelled()));
                }
                this.wake_join_waker();
                return PollResult::Ready;
            }
            StartPollAction::Poll => {}
        }

        // Safety: `start_poll` returning `Poll` gives us exclusive access to
        // `stage` until the matching `end_poll`.
        let stage = unsafe { &mut *this.0.0.stage.get() };
        let Stage::Pending(future) = stage else {
            unreachable!("task state said `Poll` but stage was not `Pending`")
        };
        // Safety: the future is never moved out of its allocation.
        let future = unsafe { Pin::new_unchecked(future) };

        let waker = Self::make_waker(NonNull::from(&this.0.0.schedulable));
        let mut cx = Context::from_waker(&waker);

        match future.poll(&mut cx) {
            Poll::Ready(output) => {
                *stage = Stage::Ready(Ok(output));
                match this.state().end_poll(true) {
                    EndPollAction::Completed => {}
                    other => unreachable!("a completed poll must end in `Completed`, got {other:?}"),
                }
                this.wake_join_waker();
                PollResult::Ready
            }
            Poll::Pending => match this.state().end_poll(false) {
                EndPollAction::Pending => PollResult::Pending,
                EndPollAction::PendingSchedule => PollResult::PendingSchedule,
                EndPollAction::Completed => unreachable!("poll returned pending but state says complete"),
            },
        }
    }

    fn wake_join_waker(&self) {
        if let Some(waker) = self.0.0.join_waker.lock().take() {
            waker.wake();
        }
    }

    /// # Safety
    /// `ptr` must point at the `Header` embedded in a `Task<F, S>`, and
    /// `outptr` must point at a valid, writable
    /// `MaybeUninit<Result<F::Output, JoinError>>`.
    unsafe fn poll_join(ptr: NonNull<Header>, outptr: NonNull<()>, cx: &mut Context<'_>) -> Poll<()> {
        // Safety: ensured by caller.
        let this = unsafe { ptr.cast::<Self>().as_ref() };

        if !this.state().is_complete() {
            *this.0.0.join_waker.lock() = Some(cx.waker().clone());
            if !this.state().is_complete() {
                return Poll::Pending;
            }
            // The task completed concurrently with us registering the
            // waker; fall through and serve the result ourselves rather than
            // rely on a wake that may already have fired before we
            // registered.
        }

        // Safety: COMPLETE is observed, so the completer is done writing
        // `stage` and will not touch it again; only this call mutates it
        // from here on.
        let stage = unsafe { &mut *this.0.0.stage.get() };
        let result = mem::replace(stage, Stage::Consumed);
        let Stage::Ready(result) = result else {
            unreachable!("`JoinHandle` polled again after it already yielded its output")
        };

        let out = outptr.cast::<core::mem::MaybeUninit<Result<F::Output, JoinError>>>();
        // Safety: caller guarantees `outptr` is a valid, writable slot of
        // this exact type.
        unsafe {
            out.as_ptr().write(core::mem::MaybeUninit::new(result));
        }
        Poll::Ready(())
    }

    /// # Safety
    /// `ptr` must point at the `Header` embedded in a `Task<F, S>`.
    unsafe fn deallocate(ptr: NonNull<Header>) {
        // Safety: ensured by caller; we own the last reference.
        unsafe {
            let this = Box::from_raw(ptr.cast::<Self>().as_ptr());
            drop(this);
        }
    }

    /// Builds a waker for this task, incrementing its ref count by one (the
    /// waker owns that reference until it is cloned or dropped).
    fn make_waker(schedulable: NonNull<Schedulable<S>>) -> Waker {
        let header = schedulable.cast::<Header>();
        // Safety: `header` points at the live `Header` prefix of this task.
        unsafe { (*header.as_ptr()).state.clone_ref() };
        let raw = RawWaker::new(schedulable.as_ptr().cast::<()>(), &Self::WAKER_VTABLE);
        // Safety: `WAKER_VTABLE` functions only ever dereference this pointer
        // as a live `Header`/`Schedulable<S>`, matching how it was created here.
        unsafe { Waker::from_raw(raw) }
    }

    const WAKER_VTABLE: RawWakerVTable = RawWakerVTable::new(
        Self::waker_clone,
        Self::waker_wake,
        Self::waker_wake_by_ref,
        Self::waker_drop,
    );

    unsafe fn waker_clone(ptr: *const ()) -> RawWaker {
        // Safety: `ptr` was produced by `make_waker` from a live `Schedulable<S>`.
        unsafe {
            let header = ptr.cast::<Header>();
            (*header).state.clone_ref();
        }
        RawWaker::new(ptr, &Self::WAKER_VTABLE)
    }

    unsafe fn waker_wake(ptr: *const ()) {
        // Safety: ensured by `RawWaker` contract; consumes the ref count the
        // waker held.
        unsafe { Self::waker_wake_by_ref(ptr) };
        unsafe { Self::waker_drop(ptr) };
    }

    unsafe fn waker_wake_by_ref(ptr: *const ()) {
        // Safety: `ptr` points at a live `Schedulable<S>`.
        unsafe { Schedulable::<S>::wake_by_ref(ptr) };
    }

    unsafe fn waker_drop(ptr: *const ()) {
        // Safety: `ptr` points at a live `Header`; this waker owns exactly
        // one reference, which a `TaskRef`'s `Drop` impl releases (and
        // deallocates on, if it was the last one).
        let header = NonNull::new(ptr as *mut Header).expect("waker pointer is never null");
        drop(TaskRef(header));
    }
}

impl<S: Schedule> Schedulable<S> {
    /// # Safety
    /// `ptr` must point at the `Schedulable<S>` prefix of a live `Task<F, S>`
    /// allocation for some `F`.
    unsafe fn wake_by_ref(ptr: *const ()) {
        // Safety: ensured by caller.
        let header = ptr.cast::<Header>();
        let header_nn = NonNull::new(header as *mut Header).expect("waker pointer is never null");
        // Safety: `Schedulable<S>` starts with `Header`, so this cast is valid.
        let this = unsafe { &*(header as *const Schedulable<S>) };

        match this.header.state.wake() {
            WakeAction::Enqueue => {
                let task_ref = TaskRef::clone_from_raw(header_nn);
                this.scheduler.wake(task_ref);
            }
            WakeAction::Coalesced => {}
        }
    }
}

// Safety: `Header` is always pinned for as long as it is reachable through a
// `TaskRef`, and the run queue never holds more than one handle to the same
// node at a time (enforced by the `SCHEDULED` state bit).
unsafe impl mpsc_queue::Linked for Header {
    type Handle = TaskRef;

    fn into_ptr(task: Self::Handle) -> NonNull<Self> {
        let ptr = task.header_ptr();
        // The queue now owns the ref count this `TaskRef` held.
        mem::forget(task);
        ptr
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        TaskRef(ptr)
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<mpsc_queue::Links<Self>> {
        ptr.map_addr(|addr| {
            let offset = offset_of!(Self, run_queue_links);
            addr.checked_add(offset).expect("pointer arithmetic overflow")
        })
        .cast()
    }
}

/// The stub node every `mpsc_queue::MpscQueue<Header>` is seeded with; never
/// a real task and never observably polled.
#[repr(transparent)]
pub(crate) struct TaskStub {
    pub(crate) header: Header,
}

impl TaskStub {
    const VTABLE: Vtable = Vtable {
        poll: Self::unreachable_poll,
        poll_join: Self::unreachable_poll_join,
        deallocate: Self::unreachable_deallocate,
        wake_by_ref: Self::unreachable_wake,
    };

    pub(crate) const fn new() -> Self {
        Self {
            header: Header {
                state: State::new(),
                vtable: &Self::VTABLE,
                id: Id::stub(),
                run_queue_links: mpsc_queue::Links::new_stub(),
            },
        }
    }

    unsafe fn unreachable_poll(_: NonNull<Header>) -> PollResult {
        unreachable!("the stub task is never polled")
    }

    unsafe fn unreachable_poll_join(_: NonNull<Header>, _: NonNull<()>, _: &mut Context<'_>) -> Poll<()> {
        unreachable!("the stub task is never polled")
    }

    unsafe fn unreachable_deallocate(_: NonNull<Header>) {
        unreachable!("the stub task is never deallocated")
    }

    unsafe fn unreachable_wake(_: *const ()) {
        unreachable!("the stub task is never woken")
    }
}

/// Heap-allocates a task for `future`, returning the type-erased handle the
/// scheduler will dispatch and a [`JoinHandle`] for its output.
pub(crate) fn spawn<F, S>(scheduler: S, future: F) -> (TaskRef, JoinHandle<F::Output>)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    S: Schedule,
{
    let id = Id::next();
    let task = Box::new(Task::new(scheduler, future, id));
    let ptr = NonNull::from(Box::leak(task)).cast::<Header>();
    let task_ref = TaskRef(ptr);
    let join = JoinHandle::new(task_ref.clone());
    (task_ref, join)
}

/// Starts building a task to be spawned on `scheduler`, with room to attach
/// a name or source location before it runs.
pub fn builder<'a, S: Schedule>(scheduler: S) -> TaskBuilder<'a, S> {
    TaskBuilder::new(scheduler)
}
