// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Non-blocking waker registration.
//!
//! [`WaitCell`](crate::sync::WaitCell) in [`sync`](crate::sync) is an
//! async-rendezvous primitive (something can `.wait()` on it). The types
//! here solve a narrower problem: a poll function that wants to stash "wake
//! me when X happens" and move on, without itself being a future. That
//! vocabulary (`register`/`signal`/`clear`) is what channel endpoints and
//! custom `Future` impls built on this crate actually want.

use alloc::boxed::Box;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::cell::UnsafeCell;
use core::fmt;
use core::mem::offset_of;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::task::Waker;
use mpsc_queue::{Links, MpscQueue, TryDequeueError};
use rt_spin::Mutex;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct State: usize {
        /// A `register` call is currently writing the waker slot.
        const REGISTERING = 1 << 0;
        /// A `signal` call observed (or arrived during) a registration and
        /// must still be serviced, either by the in-flight registrar or by
        /// taking the slot directly.
        const WAKING = 1 << 1;
    }
}

/// A single-slot, non-blocking waker register.
///
/// `register` always wins the race against a concurrent `signal`: either the
/// signal lands before registration (and the newly registered waker is
/// woken immediately instead of being stored), or it lands during or after
/// (and the stored waker is woken). A signal is never silently lost between
/// a caller checking a condition and registering to be woken about it,
/// provided the condition's change happens-before the `signal` call.
pub struct AtomicWaker {
    state: AtomicUsize,
    waker: UnsafeCell<Option<Waker>>,
}

impl fmt::Debug for AtomicWaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicWaker")
            .field("state", &State::from_bits_retain(self.state.load(Ordering::Relaxed)))
            .finish_non_exhaustive()
    }
}

// Safety: `waker` is only ever touched while `state` holds the REGISTERING
// bit exclusively (a CAS into that state), so access is effectively
// serialized even though the cell itself isn't `Sync`.
unsafe impl Send for AtomicWaker {}
// Safety: see above.
unsafe impl Sync for AtomicWaker {}

impl Default for AtomicWaker {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomicWaker {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
            waker: UnsafeCell::new(None),
        }
    }

    /// Registers `waker` to be woken by the next [`signal`](Self::signal),
    /// replacing (and dropping, unsignalled) any previously registered
    /// waker.
    pub fn register(&self, waker: &Waker) {
        match self
            .state
            .compare_exchange(0, State::REGISTERING.bits(), Ordering::Acquire, Ordering::Acquire)
        {
            Ok(_) => {
                // Safety: we hold the exclusive REGISTERING bit.
                unsafe {
                    *self.waker.get() = Some(waker.clone());
                }

                let result = self.state.compare_exchange(
                    State::REGISTERING.bits(),
                    0,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );

                if result.is_err() {
                    // A signal arrived mid-registration; it could not see our
                    // waker, so we must deliver it ourselves.
                    // Safety: still holding exclusive access to the slot.
                    let woken = unsafe { (*self.waker.get()).take() };
                    self.state.store(0, Ordering::Release);
                    if let Some(woken) = woken {
                        woken.wake();
                    }
                }
            }
            Err(state) if State::from_bits_retain(state).contains(State::WAKING) => {
                // A signal is already in flight; there is nothing useful to
                // register against, so wake the caller immediately instead
                // of risking the signal being missed.
                waker.wake_by_ref();
            }
            Err(_) => {
                // Another `register` call is concurrently in progress. Not a
                // supported usage pattern (one logical owner registers at a
                // time), but safe to just drop this registration.
            }
        }
    }

    /// Signals whichever waker is currently registered, if any.
    pub fn signal(&self) {
        let prev = self.state.fetch_or(State::WAKING.bits(), Ordering::AcqRel);
        let prev = State::from_bits_retain(prev);

        if prev.is_empty() {
            // We own the WAKING bit alone; take and wake the slot.
            // Safety: REGISTERING was not set, and we just claimed WAKING,
            // so no `register` call can be touching the slot concurrently.
            let waker = unsafe { (*self.waker.get()).take() };
            self.state.fetch_and(!State::WAKING.bits(), Ordering::AcqRel);
            if let Some(waker) = waker {
                waker.wake();
            }
        }
        // Otherwise either a registration is in flight (it will observe
        // WAKING and deliver the wake itself) or a signal already did.
    }

    /// Drops any registered waker without signalling it.
    pub fn clear(&self) {
        if self
            .state
            .compare_exchange(0, State::REGISTERING.bits(), Ordering::Acquire, Ordering::Acquire)
            .is_ok()
        {
            // Safety: exclusive REGISTERING access.
            unsafe {
                *self.waker.get() = None;
            }
            self.state.store(0, Ordering::Release);
        }
    }
}

/// A multi-slot waker queue: every registered waker is delivered exactly
/// once, either by [`signal`](Self::signal) (pops and wakes one) or
/// [`broadcast`](Self::broadcast) (wakes all currently queued).
pub struct WakerQueue {
    queue: MpscQueue<Node>,
}

struct Node {
    waker: Mutex<Option<Waker>>,
    cancelled: Arc<AtomicBool>,
    links: Links<Node>,
}

/// A handle returned by [`WakerQueue::push`] that can cancel the
/// registration before it is delivered.
#[derive(Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Marks the registration cancelled. The queued node is skipped (not
    /// woken) the next time it is popped or broadcast to.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

impl fmt::Debug for WakerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WakerQueue").finish_non_exhaustive()
    }
}

impl Default for WakerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WakerQueue {
    #[must_use]
    pub fn new() -> Self {
        let stub = Box::new(Node {
            waker: Mutex::new(None),
            cancelled: Arc::new(AtomicBool::new(true)),
            links: Links::new_stub(),
        });
        Self {
            queue: MpscQueue::new_with_stub(stub),
        }
    }

    /// Registers `waker`, returning a handle that can cancel it before
    /// delivery.
    pub fn push(&self, waker: Waker) -> CancelHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = CancelHandle(Arc::clone(&cancelled));
        let node = Box::new(Node {
            waker: Mutex::new(Some(waker)),
            cancelled,
            links: Links::new(),
        });
        self.queue.enqueue(node);
        handle
    }

    /// Pops and signals one queued waker, skipping (and dropping) any
    /// cancelled entries in front of it. No-op if the queue is empty.
    pub fn signal(&self) {
        loop {
            match self.queue.try_dequeue() {
                Ok(node) => {
                    if !node.cancelled.load(Ordering::Acquire) {
                        if let Some(waker) = node.waker.lock().take() {
                            waker.wake();
                        }
                        return;
                    }
                    // Cancelled; keep looking for a live one.
                }
                Err(TryDequeueError::Inconsistent) => core::hint::spin_loop(),
                Err(TryDequeueError::Busy | TryDequeueError::Empty) => return,
            }
        }
    }

    /// Signals every currently queued waker, draining the queue.
    pub fn broadcast(&self) {
        loop {
            match self.queue.try_dequeue() {
                Ok(node) => {
                    if !node.cancelled.load(Ordering::Acquire) {
                        if let Some(waker) = node.waker.lock().take() {
                            waker.wake();
                        }
                    }
                }
                Err(TryDequeueError::Inconsistent) => core::hint::spin_loop(),
                Err(TryDequeueError::Busy | TryDequeueError::Empty) => return,
            }
        }
    }
}

// Safety: `links` is a plain, unpinned field of `Node`; the queue never
// hands out more than one `Box<Node>` for the same node at a time.
unsafe impl mpsc_queue::Linked for Node {
    type Handle = Box<Node>;

    fn into_ptr(node: Self::Handle) -> NonNull<Self> {
        NonNull::from(Box::leak(node))
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        // Safety: every pointer in the queue was produced by `into_ptr` from
        // a `Box::leak`.
        unsafe { Box::from_raw(ptr.as_ptr()) }
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<Links<Self>> {
        ptr.map_addr(|addr| {
            let offset = offset_of!(Self, links);
            addr.checked_add(offset).expect("pointer arithmetic overflow")
        })
        .cast()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU32;
    use core::task::{RawWaker, RawWakerVTable};

    fn counting_waker(count: Arc<AtomicU32>) -> Waker {
        fn clone(ptr: *const ()) -> RawWaker {
            // Safety: the pointer came from `Arc::into_raw` in `counting_waker`.
            unsafe { Arc::increment_strong_count(ptr.cast::<AtomicU32>()) };
            RawWaker::new(ptr, &VTABLE)
        }
        fn wake(ptr: *const ()) {
            // Safety: see `clone`.
            let arc = unsafe { Arc::from_raw(ptr.cast::<AtomicU32>()) };
            arc.fetch_add(1, Ordering::SeqCst);
        }
        fn wake_by_ref(ptr: *const ()) {
            // Safety: see `clone`.
            let arc = unsafe { Arc::from_raw(ptr.cast::<AtomicU32>()) };
            arc.fetch_add(1, Ordering::SeqCst);
            core::mem::forget(arc);
        }
        fn drop_waker(ptr: *const ()) {
            // Safety: see `clone`.
            drop(unsafe { Arc::from_raw(ptr.cast::<AtomicU32>()) });
        }
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop_waker);
        let ptr = Arc::into_raw(count).cast::<()>();
        // Safety: vtable functions only ever treat `ptr` as the `Arc<AtomicU32>`
        // it was created from.
        unsafe { Waker::from_raw(RawWaker::new(ptr, &VTABLE)) }
    }

    #[test]
    fn atomic_waker_signal_before_register_wakes_immediately() {
        let cell = AtomicWaker::new();
        let count = Arc::new(AtomicU32::new(0));
        cell.signal();
        cell.register(&counting_waker(count.clone()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn atomic_waker_register_then_signal_wakes_once() {
        let cell = AtomicWaker::new();
        let count = Arc::new(AtomicU32::new(0));
        cell.register(&counting_waker(count.clone()));
        cell.signal();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        cell.signal();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn atomic_waker_clear_suppresses_delivery() {
        let cell = AtomicWaker::new();
        let count = Arc::new(AtomicU32::new(0));
        cell.register(&counting_waker(count.clone()));
        cell.clear();
        cell.signal();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn waker_queue_signal_delivers_one_in_order() {
        let queue = WakerQueue::new();
        let count_a = Arc::new(AtomicU32::new(0));
        let count_b = Arc::new(AtomicU32::new(0));
        queue.push(counting_waker(count_a.clone()));
        queue.push(counting_waker(count_b.clone()));

        queue.signal();
        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 0);

        queue.signal();
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn waker_queue_cancelled_entry_is_skipped() {
        let queue = WakerQueue::new();
        let count = Arc::new(AtomicU32::new(0));
        let handle = queue.push(counting_waker(count.clone()));
        handle.cancel();
        queue.signal();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn waker_queue_broadcast_wakes_all() {
        let queue = WakerQueue::new();
        let count_a = Arc::new(AtomicU32::new(0));
        let count_b = Arc::new(AtomicU32::new(0));
        queue.push(counting_waker(count_a.clone()));
        queue.push(counting_waker(count_b.clone()));
        queue.broadcast();
        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
    }
}
