// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Item storage policies for [`Channel`](super::Channel).
//!
//! A buffer only ever sees the subset of its trait's methods that matches
//! its capability flags: a single-sender buffer's [`Buffer::try_push`] is
//! called, a multi-sender buffer's [`Buffer::try_push_unchecked`] is, never
//! both on the same buffer. The unused side is `unreachable!()`, not a
//! silent no-op, so a capability flag wired up wrong fails loudly.

use super::ring::Ring;
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::marker::PhantomData;
use core::ptr::NonNull;
use mpsc_queue::MpscQueue;
use rt_spin::Mutex;

/// Where a channel's in-flight items live.
pub trait Buffer<T> {
    /// `true` if more than one [`Sender`](super::Sender) handle may exist
    /// (the buffer must itself be safe to push into concurrently).
    const SUPPORTS_MULTIPLE_SENDERS: bool;
    /// `true` if a send always succeeds by overwriting the single slot
    /// instead of being subject to a capacity check.
    const IS_PASSTHROUGH: bool;

    fn new(capacity: usize) -> Self;

    /// Push used by single-sender buffers, once the caller has already
    /// checked there's room.
    fn try_push(&self, item: T) -> Result<(), T> {
        let _ = item;
        unreachable!("this buffer does not support single-sender pushes")
    }

    /// Push used by multi-sender buffers, after the caller has already
    /// reserved a slot via the channel's state word; must not fail.
    fn try_push_unchecked(&self, item: T) {
        let _ = item;
        unreachable!("this buffer does not support multi-sender pushes")
    }

    /// Push used by passthrough buffers: always succeeds, discarding any
    /// previously stored, not-yet-received item.
    fn push_overwrite(&self, item: T) {
        let _ = item;
        unreachable!("this buffer is not a passthrough buffer")
    }

    fn try_pop(&self) -> Option<T>;
}

/// Single-slot "latest value wins" buffer.
pub struct Passthrough<T> {
    slot: Mutex<Option<T>>,
}

impl<T> Buffer<T> for Passthrough<T> {
    const SUPPORTS_MULTIPLE_SENDERS: bool = false;
    const IS_PASSTHROUGH: bool = true;

    fn new(_capacity: usize) -> Self {
        Self { slot: Mutex::new(None) }
    }

    fn push_overwrite(&self, item: T) {
        *self.slot.lock() = Some(item);
    }

    fn try_pop(&self) -> Option<T> {
        self.slot.lock().take()
    }
}

/// Single-producer, mutex-guarded unbounded deque.
pub struct Unbounded<T> {
    queue: Mutex<VecDeque<T>>,
}

impl<T> Buffer<T> for Unbounded<T> {
    const SUPPORTS_MULTIPLE_SENDERS: bool = false;
    const IS_PASSTHROUGH: bool = false;

    fn new(_capacity: usize) -> Self {
        Self { queue: Mutex::new(VecDeque::new()) }
    }

    fn try_push(&self, item: T) -> Result<(), T> {
        self.queue.lock().push_back(item);
        Ok(())
    }

    fn try_pop(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }
}

impl<T> Buffer<T> for Ring<T> {
    const SUPPORTS_MULTIPLE_SENDERS: bool = true;
    const IS_PASSTHROUGH: bool = false;

    fn new(capacity: usize) -> Self {
        Ring::new(capacity)
    }

    fn try_push_unchecked(&self, item: T) {
        self.push(item);
    }

    fn try_pop(&self) -> Option<T> {
        self.pop()
    }
}

struct Node<T> {
    item: core::cell::UnsafeCell<core::mem::MaybeUninit<T>>,
    links: mpsc_queue::Links<Node<T>>,
}

/// Unbounded multi-producer buffer backed directly by the same intrusive
/// lock-free queue the scheduler uses for its ready queue.
pub struct UnboundedLinked<T> {
    queue: MpscQueue<Node<T>>,
    _marker: PhantomData<T>,
}

impl<T> Buffer<T> for UnboundedLinked<T> {
    const SUPPORTS_MULTIPLE_SENDERS: bool = true;
    const IS_PASSTHROUGH: bool = false;

    fn new(_capacity: usize) -> Self {
        let stub = Box::new(Node {
            item: core::cell::UnsafeCell::new(core::mem::MaybeUninit::uninit()),
            links: mpsc_queue::Links::new_stub(),
        });
        Self {
            queue: MpscQueue::new_with_stub(stub),
            _marker: PhantomData,
        }
    }

    fn try_push_unchecked(&self, item: T) {
        let node = Box::new(Node {
            item: core::cell::UnsafeCell::new(core::mem::MaybeUninit::new(item)),
            links: mpsc_queue::Links::new(),
        });
        self.queue.enqueue(node);
    }

    fn try_pop(&self) -> Option<T> {
        loop {
            match self.queue.try_dequeue() {
                Ok(node) => {
                    // Safety: every non-stub node was constructed with an
                    // initialized `item` in `try_push_unchecked`.
                    return Some(unsafe { (*node.item.get()).assume_init_read() });
                }
                Err(mpsc_queue::TryDequeueError::Inconsistent) => core::hint::spin_loop(),
                Err(mpsc_queue::TryDequeueError::Busy | mpsc_queue::TryDequeueError::Empty) => {
                    return None;
                }
            }
        }
    }
}

// Safety: `links` is a plain field of `Node<T>`; the queue never hands out
// more than one `Box<Node<T>>` for the same node at a time.
unsafe impl<T> mpsc_queue::Linked for Node<T> {
    type Handle = Box<Node<T>>;

    fn into_ptr(node: Self::Handle) -> NonNull<Self> {
        NonNull::from(Box::leak(node))
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        // Safety: every pointer in the queue was produced by `into_ptr` from
        // a `Box::leak`.
        unsafe { Box::from_raw(ptr.as_ptr()) }
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<mpsc_queue::Links<Self>> {
        ptr.map_addr(|addr| {
            let offset = core::mem::offset_of!(Self, links);
            addr.checked_add(offset).expect("pointer arithmetic overflow")
        })
        .cast()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_overwrites() {
        let buf: Passthrough<u32> = Buffer::new(1);
        buf.push_overwrite(1);
        buf.push_overwrite(2);
        assert_eq!(buf.try_pop(), Some(2));
        assert_eq!(buf.try_pop(), None);
    }

    #[test]
    fn unbounded_is_fifo() {
        let buf: Unbounded<u32> = Buffer::new(0);
        buf.try_push(1).unwrap();
        buf.try_push(2).unwrap();
        assert_eq!(buf.try_pop(), Some(1));
        assert_eq!(buf.try_pop(), Some(2));
        assert_eq!(buf.try_pop(), None);
    }

    #[test]
    fn unbounded_linked_is_fifo() {
        let buf: UnboundedLinked<u32> = Buffer::new(0);
        buf.try_push_unchecked(1);
        buf.try_push_unchecked(2);
        assert_eq!(buf.try_pop(), Some(1));
        assert_eq!(buf.try_pop(), Some(2));
        assert_eq!(buf.try_pop(), None);
    }

    #[test]
    fn ring_as_buffer_is_fifo() {
        let buf: Ring<u32> = Buffer::new(2);
        buf.try_push_unchecked(1);
        buf.try_push_unchecked(2);
        assert_eq!(buf.try_pop(), Some(1));
        assert_eq!(buf.try_pop(), Some(2));
        assert_eq!(buf.try_pop(), None);
    }
}
