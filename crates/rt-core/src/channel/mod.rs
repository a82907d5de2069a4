// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Inter-task channels.
//!
//! A [`Channel`] is parameterised by a [`buffer::Buffer`] policy (where
//! items live) and a [`park::SenderPark`] policy (how a full channel's
//! senders get woken up once there's room). The free functions at the
//! bottom of this module ([`bounded`], [`unbounded`], [`passthrough`])
//! assemble the combinations this crate actually exposes; nothing prevents
//! adding more by pairing a different buffer with a different park policy.

pub mod buffer;
pub mod park;
mod ring;

use crate::sync::Closed;
use alloc::sync::Arc;
use buffer::{Buffer, Passthrough, Unbounded, UnboundedLinked};
use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::task::{Context, Poll};
use park::{Mpsc, Spsc};
use ring::Ring;

const CLOSED: usize = 1;
const COUNT_SHIFT: u32 = 1;

#[inline]
fn count_of(state: usize) -> usize {
    state >> COUNT_SHIFT
}

#[inline]
fn is_closed(state: usize) -> bool {
    state & CLOSED != 0
}

/// A full channel rejected an item outright (no room to park and try
/// again), see [`Channel::try_send`].
#[derive(Debug)]
pub enum TrySendError<T> {
    /// The channel is at capacity.
    Full(T),
    /// A multi-sender channel's slot claim lost too many retries; the
    /// caller should yield and try again.
    Retry(T),
    /// The channel's receiver (or its last sender, for the channel itself)
    /// has gone away.
    Closed(T),
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("channel is at capacity"),
            Self::Retry(_) => f.write_str("lost the race to claim a slot, try again"),
            Self::Closed(_) => f.write_str("channel is closed"),
        }
    }
}

impl<T: fmt::Debug> core::error::Error for TrySendError<T> {}

enum SendPoll<T> {
    Ready(Result<(), Closed>),
    Pending(T),
}

/// The shared state between every sender and receiver of a channel.
pub(crate) struct Channel<T, B, P> {
    state: AtomicUsize,
    capacity: usize,
    buffer: B,
    park: P,
    senders: AtomicUsize,
    _marker: core::marker::PhantomData<T>,
}

impl<T, B, P> fmt::Debug for Channel<T, B, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load(Ordering::Relaxed);
        f.debug_struct("Channel")
            .field("count", &count_of(state))
            .field("capacity", &self.capacity)
            .field("closed", &is_closed(state))
            .finish_non_exhaustive()
    }
}

impl<T, B, P> Channel<T, B, P>
where
    B: Buffer<T>,
    P: park::SenderPark,
{
    fn new(capacity: usize) -> Self {
        Self {
            state: AtomicUsize::new(0),
            capacity,
            buffer: B::new(capacity),
            park: P::default(),
            senders: AtomicUsize::new(1),
            _marker: core::marker::PhantomData,
        }
    }

    fn try_send(&self, item: T) -> Result<(), TrySendError<T>> {
        let cur = self.state.load(Ordering::Acquire);
        if is_closed(cur) {
            return Err(TrySendError::Closed(item));
        }
        if !B::IS_PASSTHROUGH && count_of(cur) >= self.capacity {
            return Err(TrySendError::Full(item));
        }

        if !B::SUPPORTS_MULTIPLE_SENDERS {
            if B::IS_PASSTHROUGH {
                self.buffer.push_overwrite(item);
                let new = 1 << COUNT_SHIFT;
                let mut cur = self.state.load(Ordering::Acquire);
                loop {
                    if is_closed(cur) {
                        return Ok(());
                    }
                    match self.state.compare_exchange_weak(
                        cur,
                        new | (cur & CLOSED),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => break,
                        Err(actual) => cur = actual,
                    }
                }
            } else {
                self.buffer
                    .try_push(item)
                    .map_err(TrySendError::Full)?;
                let prev = self.state.fetch_add(1 << COUNT_SHIFT, Ordering::AcqRel);
                if count_of(prev) == 0 {
                    self.park.notify_recv();
                }
            }
            return Ok(());
        }

        // Bounded by the backoff's own max exponent: past that point further
        // spinning isn't earning us anything and the caller should yield
        // instead of monopolising the CPU on a hot CAS loop.
        const MAX_ATTEMPTS: u32 = 1 << rt_spin::Backoff::DEFAULT_MAX_EXPONENT as u32;
        let mut backoff = rt_spin::Backoff::new();
        let mut cur = cur;
        for _ in 0..MAX_ATTEMPTS {
            if is_closed(cur) {
                return Err(TrySendError::Closed(item));
            }
            let count = count_of(cur);
            if count >= self.capacity {
                return Err(TrySendError::Full(item));
            }
            match self.state.compare_exchange_weak(
                cur,
                cur + (1 << COUNT_SHIFT),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(prev) => {
                    self.buffer.try_push_unchecked(item);
                    let prev_count = count_of(prev);
                    if prev_count == 0 || prev_count + 1 == self.capacity {
                        self.park.notify_recv();
                    }
                    return Ok(());
                }
                Err(actual) => {
                    cur = actual;
                    backoff.spin();
                }
            }
        }
        Err(TrySendError::Retry(item))
    }

    /// Attempts to make progress on sending `item`. On `Pending`, the item
    /// is handed back so the caller (the `Send` future) can retain it for
    /// the next poll.
    fn poll_send(&self, cx: &mut Context<'_>, item: T) -> SendPoll<T> {
        match self.try_send(item) {
            Ok(()) => SendPoll::Ready(Ok(())),
            Err(TrySendError::Closed(_)) => SendPoll::Ready(Err(Closed::new())),
            Err(TrySendError::Retry(it)) => {
                cx.waker().wake_by_ref();
                SendPoll::Pending(it)
            }
            Err(TrySendError::Full(it)) => {
                // Two-phase park: park first, then re-check, so a receive
                // that happens between our first `try_send` and the park
                // registration is not missed.
                self.park.park_send(cx);
                match self.try_send(it) {
                    Ok(()) => SendPoll::Ready(Ok(())),
                    Err(TrySendError::Closed(_)) => SendPoll::Ready(Err(Closed::new())),
                    Err(TrySendError::Full(it)) => SendPoll::Pending(it),
                    Err(TrySendError::Retry(it)) => {
                        cx.waker().wake_by_ref();
                        SendPoll::Pending(it)
                    }
                }
            }
        }
    }

    fn try_recv(&self) -> Result<Option<T>, Closed> {
        match self.buffer.try_pop() {
            Some(item) => {
                let prev = self.state.fetch_sub(1 << COUNT_SHIFT, Ordering::AcqRel);
                let prev_count = count_of(prev);
                if prev_count == self.capacity {
                    self.park.notify_one_sender();
                }
                if prev_count == 1 {
                    self.park.notify_flush();
                }
                Ok(Some(item))
            }
            None => {
                if is_closed(self.state.load(Ordering::Acquire)) {
                    Err(Closed::new())
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn poll_recv(&self, cx: &mut Context<'_>) -> Poll<Result<Option<T>, Closed>> {
        match self.try_recv() {
            Ok(Some(item)) => Poll::Ready(Ok(Some(item))),
            Err(closed) => Poll::Ready(Err(closed)),
            Ok(None) => {
                self.park.register_recv(cx);
                match self.try_recv() {
                    Ok(None) => Poll::Pending,
                    other => Poll::Ready(other),
                }
            }
        }
    }

    fn poll_flush(&self, cx: &mut Context<'_>) -> Poll<()> {
        let state = self.state.load(Ordering::Acquire);
        if count_of(state) == 0 {
            return Poll::Ready(());
        }
        self.park.park_flush(cx);
        if count_of(self.state.load(Ordering::Acquire)) == 0 {
            return Poll::Ready(());
        }
        self.park.notify_recv();
        Poll::Pending
    }

    fn close(&self) {
        let prev = self.state.fetch_or(CLOSED, Ordering::AcqRel);
        if is_closed(prev) {
            return;
        }
        self.park.notify_recv();
        self.park.notify_all_senders();
        self.park.notify_flush();
    }

    fn is_closed(&self) -> bool {
        is_closed(self.state.load(Ordering::Acquire))
    }
}

/// The sending half of a channel.
pub struct Sender<T, B, P> {
    chan: Arc<Channel<T, B, P>>,
}

impl<T, B, P> fmt::Debug for Sender<T, B, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Sender").field(&self.chan).finish()
    }
}

impl<T, B, P> Clone for Sender<T, B, P>
where
    B: Buffer<T>,
{
    fn clone(&self) -> Self {
        debug_assert!(
            B::SUPPORTS_MULTIPLE_SENDERS,
            "attempted to clone a single-sender channel's `Sender`"
        );
        self.chan.senders.fetch_add(1, Ordering::Relaxed);
        Self { chan: self.chan.clone() }
    }
}

impl<T, B, P> Drop for Sender<T, B, P> {
    fn drop(&mut self) {
        if self.chan.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.chan.close();
        }
    }
}

impl<T, B, P> Sender<T, B, P>
where
    B: Buffer<T>,
    P: park::SenderPark,
{
    /// Attempts to send `item` without waiting.
    ///
    /// # Errors
    ///
    /// See [`TrySendError`].
    pub fn try_send(&self, item: T) -> Result<(), TrySendError<T>> {
        self.chan.try_send(item)
    }

    /// Sends `item`, waiting for room if the channel is at capacity.
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] if the receiver has gone away.
    pub fn send(&self, item: T) -> Send<'_, T, B, P> {
        Send {
            chan: &self.chan,
            item: Some(item),
        }
    }

    /// Closes the channel from the sending side.
    pub fn close(&self) {
        self.chan.close();
    }
}

#[must_use = "futures do nothing unless polled"]
pub struct Send<'a, T, B, P> {
    chan: &'a Channel<T, B, P>,
    item: Option<T>,
}

impl<T, B, P> Future for Send<'_, T, B, P>
where
    B: Buffer<T>,
    P: park::SenderPark,
{
    type Output = Result<(), Closed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let item = this.item.take().expect("Send polled after completion");
        match this.chan.poll_send(cx, item) {
            SendPoll::Ready(result) => Poll::Ready(result),
            SendPoll::Pending(item) => {
                this.item = Some(item);
                Poll::Pending
            }
        }
    }
}

/// The receiving half of a channel.
pub struct Receiver<T, B, P> {
    chan: Arc<Channel<T, B, P>>,
}

impl<T, B, P> fmt::Debug for Receiver<T, B, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Receiver").field(&self.chan).finish()
    }
}

impl<T, B, P> Drop for Receiver<T, B, P> {
    fn drop(&mut self) {
        self.chan.close();
    }
}

impl<T, B, P> Receiver<T, B, P>
where
    B: Buffer<T>,
    P: park::SenderPark,
{
    /// Attempts to receive an item without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] once the channel is closed and drained.
    pub fn try_recv(&self) -> Result<Option<T>, Closed> {
        self.chan.try_recv()
    }

    /// Receives the next item, waiting if none is available.
    pub fn recv(&self) -> Recv<'_, T, B, P> {
        Recv { chan: &self.chan }
    }

    /// Waits until every item sent so far has been received.
    pub fn flush(&self) -> Flush<'_, T, B, P> {
        Flush { chan: &self.chan }
    }

    /// Closes the channel from the receiving side.
    pub fn close(&self) {
        self.chan.close();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.chan.is_closed()
    }
}

#[must_use = "futures do nothing unless polled"]
pub struct Recv<'a, T, B, P> {
    chan: &'a Channel<T, B, P>,
}

impl<T, B, P> Future for Recv<'_, T, B, P>
where
    B: Buffer<T>,
    P: park::SenderPark,
{
    type Output = Result<Option<T>, Closed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.chan.poll_recv(cx)
    }
}

#[must_use = "futures do nothing unless polled"]
pub struct Flush<'a, T, B, P> {
    chan: &'a Channel<T, B, P>,
}

impl<T, B, P> Future for Flush<'_, T, B, P>
where
    B: Buffer<T>,
    P: park::SenderPark,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.chan.poll_flush(cx)
    }
}

/// Creates a bounded, multi-producer single-consumer ring-buffer channel.
#[must_use]
pub fn bounded<T>(capacity: usize) -> (Sender<T, Ring<T>, Mpsc>, Receiver<T, Ring<T>, Mpsc>) {
    assert!(capacity > 0, "bounded channel capacity must be non-zero");
    let chan = Arc::new(Channel::new(capacity));
    (Sender { chan: chan.clone() }, Receiver { chan })
}

/// Creates an unbounded, multi-producer single-consumer channel backed by
/// the same lock-free intrusive queue the scheduler's ready queue uses.
#[must_use]
pub fn unbounded<T>() -> (Sender<T, UnboundedLinked<T>, Mpsc>, Receiver<T, UnboundedLinked<T>, Mpsc>) {
    let chan = Arc::new(Channel::new(usize::MAX));
    (Sender { chan: chan.clone() }, Receiver { chan })
}

/// Creates a single-producer single-consumer, unbounded channel backed by a
/// mutex-guarded deque. Use [`bounded`]/[`unbounded`] instead unless you
/// specifically need the single-producer contract (no [`Sender::clone`]).
#[must_use]
pub fn spsc_unbounded<T>() -> (Sender<T, Unbounded<T>, Spsc>, Receiver<T, Unbounded<T>, Spsc>) {
    let chan = Arc::new(Channel::new(usize::MAX));
    (Sender { chan: chan.clone() }, Receiver { chan })
}

/// Creates a single-slot "latest value wins" channel: a send always
/// succeeds and overwrites any value the receiver hasn't yet observed.
#[must_use]
pub fn passthrough<T>() -> (Sender<T, Passthrough<T>, Spsc>, Receiver<T, Passthrough<T>, Spsc>) {
    let chan = Arc::new(Channel::new(1));
    (Sender { chan: chan.clone() }, Receiver { chan })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use futures::task::noop_waker;

    fn cx() -> Context<'static> {
        // `noop_waker` returns an owned `Waker`; leaking it for a `'static`
        // reference is fine, tests never outlive the process.
        Context::from_waker(Box::leak(Box::new(noop_waker())))
    }

    #[test]
    fn bounded_respects_capacity() {
        let (tx, rx) = bounded(2);
        assert!(tx.try_send(1).is_ok());
        assert!(tx.try_send(2).is_ok());
        assert!(matches!(tx.try_send(3), Err(TrySendError::Full(3))));
        assert_eq!(rx.try_recv(), Ok(Some(1)));
        assert!(tx.try_send(3).is_ok());
        assert_eq!(rx.try_recv(), Ok(Some(2)));
        assert_eq!(rx.try_recv(), Ok(Some(3)));
    }

    #[test]
    fn closing_receiver_fails_future_sends() {
        let (tx, rx) = bounded(1);
        drop(rx);
        assert!(matches!(tx.try_send(1), Err(TrySendError::Closed(1))));
    }

    #[test]
    fn closing_last_sender_drains_then_closes() {
        let (tx, rx) = bounded(2);
        tx.try_send(1).unwrap();
        drop(tx);
        assert_eq!(rx.try_recv(), Ok(Some(1)));
        assert_eq!(rx.try_recv(), Err(Closed::new()));
    }

    #[test]
    fn unbounded_multiple_senders_interleave() {
        let (tx, rx) = unbounded();
        let tx2 = tx.clone();
        tx.try_send(1).unwrap();
        tx2.try_send(2).unwrap();
        assert_eq!(rx.try_recv(), Ok(Some(1)));
        assert_eq!(rx.try_recv(), Ok(Some(2)));
    }

    #[test]
    fn passthrough_overwrites_unread_value() {
        let (tx, rx) = passthrough();
        tx.try_send(1).unwrap();
        tx.try_send(2).unwrap();
        assert_eq!(rx.try_recv(), Ok(Some(2)));
    }

    #[test]
    fn poll_recv_on_empty_open_channel_is_pending() {
        let (_tx, rx) = bounded::<u32>(1);
        let recv = rx.recv();
        futures::pin_mut!(recv);
        let mut context = cx();
        assert_eq!(recv.as_mut().poll(&mut context), Poll::Pending);
    }

    #[test]
    fn poll_flush_ready_when_empty() {
        let (_tx, rx) = bounded::<u32>(1);
        let flush = rx.flush();
        futures::pin_mut!(flush);
        let mut context = cx();
        assert_eq!(flush.as_mut().poll(&mut context), Poll::Ready(()));
    }
}
