// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A fixed-capacity, single-consumer, multi-producer slot array.
//!
//! The hard part of a lock-free MPSC ring buffer (ensuring no two producers
//! ever write the same slot while it is still occupied) is already solved
//! one layer up: [`Channel`](super::Channel)'s state word only lets a
//! producer proceed past the capacity check via a CAS that reserves exactly
//! one unit of count, so at most `capacity` writers are ever "in flight" at
//! once. What's left here is handing each of those writers a distinct slot
//! index, which a single `fetch_add` does.

use alloc::boxed::Box;
use core::cell::{Cell, UnsafeCell};
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

pub(crate) struct Ring<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    write: AtomicUsize,
    /// Slots written but not yet popped. Tracked independently from the
    /// channel's own state word so `Ring` is self-contained: the channel's
    /// count gates *producers* (how many may claim a slot), this gates the
    /// *consumer* (whether a slot has actually been written yet).
    filled: AtomicUsize,
    // Safety: only ever touched by the single receiver.
    read: Cell<usize>,
}

// Safety: `slots` entries are written by at most one producer (the capacity
// gate above) before being read by the single receiver, and never
// concurrently by two producers.
unsafe impl<T: Send> Send for Ring<T> {}
// Safety: see above; shared access across sender handles is fine since each
// slot index is handed out to exactly one caller.
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        let mut slots = alloc::vec::Vec::with_capacity(capacity);
        slots.resize_with(capacity, || UnsafeCell::new(MaybeUninit::uninit()));
        Self {
            slots: slots.into_boxed_slice(),
            write: AtomicUsize::new(0),
            filled: AtomicUsize::new(0),
            read: Cell::new(0),
        }
    }

    /// Writes `item` into the next slot. The caller must have already
    /// reserved capacity for this write through the channel's state word.
    pub(crate) fn push(&self, item: T) {
        let len = self.slots.len();
        let idx = self.write.fetch_add(1, Ordering::Relaxed) % len;
        // Safety: the reservation in `Channel::try_send` guarantees this
        // slot was fully drained by the receiver before being handed out
        // again.
        unsafe {
            (*self.slots[idx].get()).write(item);
        }
        self.filled.fetch_add(1, Ordering::Release);
    }

    /// Pops the oldest unread slot, if one has been fully written.
    ///
    /// Only ever called by the single receiver.
    pub(crate) fn pop(&self) -> Option<T> {
        let mut cur = self.filled.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return None;
            }
            match self.filled.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }

        let len = self.slots.len();
        let idx = self.read.get() % len;
        self.read.set(idx + 1);
        // Safety: `filled` only decrements past a slot once `push` has
        // finished writing it, and the single receiver never pops the same
        // index twice.
        Some(unsafe { (*self.slots[idx].get()).assume_init_read() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let ring = Ring::new(4);
        ring.push(1);
        ring.push(2);
        ring.push(3);
        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn wraps_around_capacity() {
        let ring = Ring::new(2);
        ring.push(1);
        ring.push(2);
        assert_eq!(ring.pop(), Some(1));
        ring.push(3);
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn empty_pop_returns_none() {
        let ring: Ring<u32> = Ring::new(1);
        assert_eq!(ring.pop(), None);
    }
}
