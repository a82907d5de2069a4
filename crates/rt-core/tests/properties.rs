// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cross-module scenarios exercising the public API end to end, as opposed
//! to the unit tests colocated with each module.

use rt_core::channel::{self, TrySendError};
use rt_core::executor::{Executor, ThreadPark};
use rt_core::scheduler::{LocalScheduler, SharedScheduler};
use rt_core::task::yield_now;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;

fn noop_cx() -> Context<'static> {
    Context::from_waker(Box::leak(Box::new(futures::task::noop_waker())))
}

/// S1: a thread executor runs a single future to completion and reports
/// itself drained.
#[test]
fn thread_executor_runs_single_future_to_completion() {
    let scheduler: &'static LocalScheduler = Box::leak(Box::new(LocalScheduler::new()));
    let executor: &'static Executor<&'static LocalScheduler, ThreadPark> =
        Box::leak(Box::new(Executor::new(scheduler, ThreadPark::new())));

    let output = Arc::new(std::sync::Mutex::new(0u32));
    let out = output.clone();
    let _join = executor
        .try_submit(async move {
            *out.lock().unwrap() = 42;
        })
        .unwrap();

    executor.run();

    assert_eq!(*output.lock().unwrap(), 42);
    assert_eq!(executor.count(), 0);
}

/// S2: a capacity-2 bounded channel accepts two sends immediately and holds
/// the third pending until a receive frees a slot.
#[test]
fn bounded_channel_backpressure_releases_on_recv() {
    let (tx, rx) = channel::bounded::<u32>(2);

    assert!(tx.try_send(1).is_ok());
    assert!(tx.try_send(2).is_ok());

    let third = tx.send(3);
    futures::pin_mut!(third);
    let mut cx = noop_cx();
    assert_eq!(third.as_mut().poll(&mut cx), Poll::Pending);

    assert_eq!(rx.try_recv(), Ok(Some(1)));
    assert_eq!(third.as_mut().poll(&mut cx), Poll::Ready(Ok(())));

    assert_eq!(rx.try_recv(), Ok(Some(2)));
    assert_eq!(rx.try_recv(), Ok(Some(3)));
}

/// S3: closing a channel while a sender is parked on a full buffer resolves
/// that send as cancelled, rejects further sends, and still lets the
/// receiver drain what was already buffered before it too observes closed.
#[test]
fn close_resolves_blocked_send_then_drains_receiver() {
    let (tx, rx) = channel::bounded::<u32>(1);
    tx.try_send(1).unwrap();

    let blocked = tx.send(2);
    futures::pin_mut!(blocked);
    let mut cx = noop_cx();
    assert_eq!(blocked.as_mut().poll(&mut cx), Poll::Pending);

    rx.close();

    assert!(blocked.as_mut().poll(&mut cx).is_ready());
    assert!(matches!(tx.try_send(3), Err(TrySendError::Closed(3))));

    assert_eq!(rx.try_recv(), Ok(Some(1)));
    assert!(rx.try_recv().is_err());
}

/// S4: two tasks that each yield a handful of times before completing both
/// finish within a single `run()` call, since a self-wake reschedules into
/// the same ready queue `run` keeps draining.
#[test]
fn cooperative_yields_complete_within_one_run() {
    let scheduler: &'static LocalScheduler = Box::leak(Box::new(LocalScheduler::new()));

    let done_a = Arc::new(AtomicBool::new(false));
    let done_b = Arc::new(AtomicBool::new(false));

    let a = done_a.clone();
    let _join_a = scheduler
        .submit(async move {
            for _ in 0..3 {
                yield_now().await;
            }
            a.store(true, Ordering::SeqCst);
        })
        .unwrap();

    let b = done_b.clone();
    let _join_b = scheduler
        .submit(async move {
            for _ in 0..2 {
                yield_now().await;
            }
            b.store(true, Ordering::SeqCst);
        })
        .unwrap();

    assert!(scheduler.run());
    assert!(done_a.load(Ordering::SeqCst));
    assert!(done_b.load(Ordering::SeqCst));
    assert_eq!(scheduler.count(), 0);
}

/// S5: an SPSC channel moves 10,000 items from a producer thread to a
/// consumer thread in send order.
#[test]
fn spsc_channel_preserves_order_across_threads() {
    const N: u32 = 10_000;
    let (tx, rx) = channel::spsc_unbounded::<u32>();

    let producer = thread::spawn(move || {
        for i in 0..N {
            loop {
                match tx.try_send(i) {
                    Ok(()) => break,
                    Err(TrySendError::Retry(_)) => thread::yield_now(),
                    Err(_) => panic!("channel closed unexpectedly"),
                }
            }
        }
    });

    let mut received = Vec::with_capacity(N as usize);
    while received.len() < N as usize {
        match rx.try_recv() {
            Ok(Some(item)) => received.push(item),
            Ok(None) => thread::yield_now(),
            Err(_) => panic!("channel closed before all items arrived"),
        }
    }

    producer.join().unwrap();
    assert_eq!(received, (0..N).collect::<Vec<_>>());
}

/// S6: a shared scheduler accepts submits from two non-owning threads while
/// the owning thread repeatedly drains it; both tasks are eventually polled
/// on the owner thread.
#[test]
fn shared_scheduler_accepts_submits_from_other_threads() {
    let scheduler: &'static SharedScheduler = Box::leak(Box::new(SharedScheduler::new()));

    let done_a = Arc::new(AtomicBool::new(false));
    let done_b = Arc::new(AtomicBool::new(false));

    let a = done_a.clone();
    let t1 = thread::spawn(move || {
        scheduler
            .submit(async move {
                a.store(true, Ordering::SeqCst);
            })
            .unwrap();
    });

    let b = done_b.clone();
    let t2 = thread::spawn(move || {
        scheduler
            .submit(async move {
                b.store(true, Ordering::SeqCst);
            })
            .unwrap();
    });

    t1.join().unwrap();
    t2.join().unwrap();

    for _ in 0..10_000 {
        if scheduler.run() {
            break;
        }
        thread::yield_now();
    }

    assert!(done_a.load(Ordering::SeqCst));
    assert!(done_b.load(Ordering::SeqCst));
    assert_eq!(scheduler.count(), 0);
}

/// Idempotent signal: firing a `Waker` repeatedly between polls causes
/// exactly one re-poll, not one per `wake` call.
#[test]
fn repeated_wakes_between_polls_cause_one_repoll() {
    let scheduler: &'static LocalScheduler = Box::leak(Box::new(LocalScheduler::new()));
    let polls = Arc::new(AtomicU32::new(0));

    struct WakeOnce {
        polls: Arc<AtomicU32>,
        woken: bool,
    }

    impl std::future::Future for WakeOnce {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            if self.woken {
                return Poll::Ready(());
            }
            self.woken = true;
            // Fire several wakes back-to-back; only one re-poll should result.
            cx.waker().wake_by_ref();
            cx.waker().wake_by_ref();
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }

    let p = polls.clone();
    let _join = scheduler.submit(WakeOnce { polls: p, woken: false }).unwrap();

    assert!(scheduler.run());
    assert_eq!(polls.load(Ordering::SeqCst), 2);
}
