// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The task state machine.
//!
//! Unlike a plain `enum`, task state has to be observed and mutated from
//! several threads at once (the scheduler polling the task, a waker signalling
//! it, a `JoinHandle` cancelling it), so it is packed into a single atomic
//! word and mutated with a compare-exchange retry loop. Reference counting
//! is kept in its own atomic counter
//! rather than packed into the same word: a `TaskRef` clone/drop never needs
//! to observe or race with the poll/wake/cancel bits, so splitting it out
//! removes one source of spurious CAS failures without giving up anything.

use bitflags::bitflags;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Bits: u8 {
        /// The task's future is currently being polled by some thread.
        const POLLING   = 1 << 0;
        /// The task has produced a final value; it will never be polled again.
        const COMPLETE  = 1 << 1;
        /// The task's `JoinHandle` was dropped (or `.cancel()` was called)
        /// before completion; the next poll must short-circuit to `Cancelled`.
        const CANCELLED = 1 << 2;
        /// A handle to this task is currently sitting in (or about to be
        /// pushed into) a scheduler's ready queue. Prevents a concurrent
        /// `wake()` from enqueueing a second handle for the same intrusive
        /// node, which the queue's single `next` pointer cannot support.
        const SCHEDULED = 1 << 3;
        /// The task was woken while `POLLING`; the poll loop must reschedule
        /// it immediately after the in-flight poll returns, instead of
        /// waiting for a second, separate wake.
        const NOTIFIED  = 1 << 4;
    }
}

#[derive(Debug)]
pub(crate) struct State {
    bits: AtomicU8,
    refs: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartPollAction {
    /// Proceed to poll the future.
    Poll,
    /// The task was already complete; do not poll it again.
    AlreadyComplete,
    /// The task was cancelled before this poll; it has been marked complete
    /// without invoking the future, the caller should run completion as if
    /// the future had returned a cancelled result.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EndPollAction {
    Completed,
    Pending,
    PendingSchedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeAction {
    /// The caller must clone a `TaskRef` and push it onto the ready queue.
    Enqueue,
    /// Either the task was already scheduled/running/complete; no action
    /// beyond flipping a bit was necessary.
    Coalesced,
}

impl State {
    pub(crate) const fn new() -> Self {
        Self {
            bits: AtomicU8::new(Bits::SCHEDULED.bits()),
            refs: AtomicUsize::new(1),
        }
    }

    pub(crate) fn clone_ref(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns `true` if this was the last reference.
    pub(crate) fn drop_ref(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::Release) == 1
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.load().contains(Bits::COMPLETE)
    }

    fn load(&self) -> Bits {
        Bits::from_bits_retain(self.bits.load(Ordering::Acquire))
    }

    pub(crate) fn start_poll(&self) -> StartPollAction {
        let mut cur = self.load();
        loop {
            if cur.contains(Bits::COMPLETE) {
                return StartPollAction::AlreadyComplete;
            }

            let next = if cur.contains(Bits::CANCELLED) {
                (cur - Bits::SCHEDULED - Bits::NOTIFIED) | Bits::COMPLETE
            } else {
                (cur - Bits::SCHEDULED - Bits::NOTIFIED) | Bits::POLLING
            };

            match self.bits.compare_exchange_weak(
                cur.bits(),
                next.bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) if cur.contains(Bits::CANCELLED) => return StartPollAction::Cancelled,
                Ok(_) => return StartPollAction::Poll,
                Err(actual) => cur = Bits::from_bits_retain(actual),
            }
        }
    }

    pub(crate) fn end_poll(&self, ready: bool) -> EndPollAction {
        let mut cur = self.load();
        loop {
            debug_assert!(
                cur.contains(Bits::POLLING),
                "end_poll called without a matching start_poll"
            );

            let (next, action) = if ready {
                (
                    (cur - Bits::POLLING) | Bits::COMPLETE,
                    EndPollAction::Completed,
                )
            } else if cur.contains(Bits::NOTIFIED) {
                (
                    (cur - Bits::POLLING - Bits::NOTIFIED) | Bits::SCHEDULED,
                    EndPollAction::PendingSchedule,
                )
            } else {
                (cur - Bits::POLLING, EndPollAction::Pending)
            };

            match self.bits.compare_exchange_weak(
                cur.bits(),
                next.bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return action,
                Err(actual) => cur = Bits::from_bits_retain(actual),
            }
        }
    }

    /// Called from a waker. Returns whether the caller must push a fresh
    /// `TaskRef` onto the ready queue.
    pub(crate) fn wake(&self) -> WakeAction {
        let mut cur = self.load();
        loop {
            if cur.intersects(Bits::COMPLETE | Bits::SCHEDULED) {
                return WakeAction::Coalesced;
            }

            let next = if cur.contains(Bits::POLLING) {
                cur | Bits::NOTIFIED
            } else {
                cur | Bits::SCHEDULED
            };

            match self.bits.compare_exchange_weak(
                cur.bits(),
                next.bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) if !cur.contains(Bits::POLLING) => return WakeAction::Enqueue,
                Ok(_) => return WakeAction::Coalesced,
                Err(actual) => cur = Bits::from_bits_retain(actual),
            }
        }
    }

    /// Attempts to set the cancelled bit. Returns `false` if the task was
    /// already complete or already cancelled.
    pub(crate) fn cancel(&self) -> bool {
        let mut cur = self.load();
        loop {
            if cur.intersects(Bits::COMPLETE | Bits::CANCELLED) {
                return false;
            }

            let next = cur | Bits::CANCELLED;
            match self.bits.compare_exchange_weak(
                cur.bits(),
                next.bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = Bits::from_bits_retain(actual),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_task_is_scheduled() {
        let state = State::new();
        assert!(!state.is_complete());
        assert_eq!(state.start_poll(), StartPollAction::Poll);
    }

    #[test]
    fn pending_without_wake_does_not_reschedule() {
        let state = State::new();
        assert_eq!(state.start_poll(), StartPollAction::Poll);
        assert_eq!(state.end_poll(false), EndPollAction::Pending);
    }

    #[test]
    fn wake_during_poll_reschedules_immediately() {
        let state = State::new();
        assert_eq!(state.start_poll(), StartPollAction::Poll);
        assert_eq!(state.wake(), WakeAction::Coalesced);
        assert_eq!(state.end_poll(false), EndPollAction::PendingSchedule);
    }

    #[test]
    fn double_wake_between_polls_coalesces() {
        let state = State::new();
        assert_eq!(state.start_poll(), StartPollAction::Poll);
        assert_eq!(state.end_poll(false), EndPollAction::Pending);
        assert_eq!(state.wake(), WakeAction::Enqueue);
        assert_eq!(state.wake(), WakeAction::Coalesced);
    }

    #[test]
    fn cancel_before_first_poll_short_circuits() {
        let state = State::new();
        assert!(state.cancel());
        assert_eq!(state.start_poll(), StartPollAction::Cancelled);
        assert!(state.is_complete());
    }

    #[test]
    fn cancel_after_complete_is_noop() {
        let state = State::new();
        assert_eq!(state.start_poll(), StartPollAction::Poll);
        assert_eq!(state.end_poll(true), EndPollAction::Completed);
        assert!(!state.cancel());
    }
}
