// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! How a [`Channel`](super::Channel)'s blocked sides get woken back up.
//!
//! A single-sender channel only ever has one send-side waker to track, so
//! [`Spsc`] keeps it in one [`AtomicWaker`]. A multi-sender channel can have
//! any number of senders parked on a full buffer at once, so [`Mpsc`] queues
//! them in a [`WakerQueue`] instead and wakes them one at a time as room
//! frees up, in registration order.

use crate::waker::{AtomicWaker, WakerQueue};
use core::task::Context;

/// How a channel's blocked senders (and flushers) are parked and woken.
pub trait SenderPark: Default {
    /// Registers the current task to be woken the next time capacity frees
    /// up for a send.
    fn park_send(&self, cx: &Context<'_>);
    /// Wakes exactly one parked sender, if any (a single unit of capacity
    /// just freed up).
    fn notify_one_sender(&self);
    /// Wakes every parked sender (the channel just closed).
    fn notify_all_senders(&self);

    /// Registers the current task to be woken once the channel drains to
    /// empty.
    fn park_flush(&self, cx: &Context<'_>);
    /// Wakes a parked flush, if any (the channel just drained to empty, or
    /// just closed).
    fn notify_flush(&self);

    /// Registers the current task to be woken the next time an item is
    /// available (or the channel closes).
    fn register_recv(&self, cx: &Context<'_>);
    /// Wakes the parked receiver, if any.
    fn notify_recv(&self);
}

/// Park policy for single-producer channels: at most one sender, so a
/// single-slot [`AtomicWaker`] per concern is enough.
#[derive(Default)]
pub struct Spsc {
    send: AtomicWaker,
    flush: AtomicWaker,
    recv: AtomicWaker,
}

impl SenderPark for Spsc {
    fn park_send(&self, cx: &Context<'_>) {
        self.send.register(cx.waker());
    }

    fn notify_one_sender(&self) {
        self.send.signal();
    }

    fn notify_all_senders(&self) {
        self.send.signal();
    }

    fn park_flush(&self, cx: &Context<'_>) {
        self.flush.register(cx.waker());
    }

    fn notify_flush(&self) {
        self.flush.signal();
    }

    fn register_recv(&self, cx: &Context<'_>) {
        self.recv.register(cx.waker());
    }

    fn notify_recv(&self) {
        self.recv.signal();
    }
}

/// Park policy for multi-producer channels: any number of senders may be
/// parked on a full buffer simultaneously, so sends queue in a
/// [`WakerQueue`] and are woken one at a time as capacity frees up one unit
/// at a time. Flushes and receives still only ever have a single waiter
/// each (one [`Receiver`](super::Receiver), and `flush` is typically called
/// from the same side), so those stay single-slot.
#[derive(Default)]
pub struct Mpsc {
    send: WakerQueue,
    flush: AtomicWaker,
    recv: AtomicWaker,
}

impl SenderPark for Mpsc {
    fn park_send(&self, cx: &Context<'_>) {
        self.send.push(cx.waker().clone());
    }

    fn notify_one_sender(&self) {
        self.send.signal();
    }

    fn notify_all_senders(&self) {
        self.send.broadcast();
    }

    fn park_flush(&self, cx: &Context<'_>) {
        self.flush.register(cx.waker());
    }

    fn notify_flush(&self) {
        self.flush.signal();
    }

    fn register_recv(&self, cx: &Context<'_>) {
        self.recv.register(cx.waker());
    }

    fn notify_recv(&self) {
        self.recv.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicU32, Ordering};
    use core::task::{RawWaker, RawWakerVTable, Waker};

    fn counting_waker(count: Arc<AtomicU32>) -> Waker {
        fn clone(ptr: *const ()) -> RawWaker {
            unsafe { Arc::increment_strong_count(ptr.cast::<AtomicU32>()) };
            RawWaker::new(ptr, &VTABLE)
        }
        fn wake(ptr: *const ()) {
            let arc = unsafe { Arc::from_raw(ptr.cast::<AtomicU32>()) };
            arc.fetch_add(1, Ordering::SeqCst);
        }
        fn wake_by_ref(ptr: *const ()) {
            let arc = unsafe { Arc::from_raw(ptr.cast::<AtomicU32>()) };
            arc.fetch_add(1, Ordering::SeqCst);
            core::mem::forget(arc);
        }
        fn drop_waker(ptr: *const ()) {
            drop(unsafe { Arc::from_raw(ptr.cast::<AtomicU32>()) });
        }
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop_waker);
        let ptr = Arc::into_raw(count).cast::<()>();
        unsafe { Waker::from_raw(RawWaker::new(ptr, &VTABLE)) }
    }

    #[test]
    fn spsc_notify_one_sender_wakes_parked_waker() {
        let park = Spsc::default();
        let count = Arc::new(AtomicU32::new(0));
        let waker = counting_waker(count.clone());
        let cx = Context::from_waker(&waker);
        park.park_send(&cx);
        park.notify_one_sender();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn mpsc_notify_one_sender_wakes_oldest_parked_first() {
        let park = Mpsc::default();
        let count_a = Arc::new(AtomicU32::new(0));
        let count_b = Arc::new(AtomicU32::new(0));
        let waker_a = counting_waker(count_a.clone());
        let waker_b = counting_waker(count_b.clone());
        park.park_send(&Context::from_waker(&waker_a));
        park.park_send(&Context::from_waker(&waker_b));

        park.notify_one_sender();
        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 0);

        park.notify_one_sender();
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn mpsc_notify_all_senders_wakes_every_parked_waker() {
        let park = Mpsc::default();
        let count_a = Arc::new(AtomicU32::new(0));
        let count_b = Arc::new(AtomicU32::new(0));
        park.park_send(&Context::from_waker(&counting_waker(count_a.clone())));
        park.park_send(&Context::from_waker(&counting_waker(count_b.clone())));

        park.notify_all_senders();
        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
    }
}
