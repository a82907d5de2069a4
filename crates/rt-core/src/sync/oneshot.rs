use crate::loom::cell::UnsafeCell;
use crate::sync::WaitCell;
use alloc::sync::Arc;
use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, ready};

pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(Inner {
        value: UnsafeCell::new(None),
        rx_waker: WaitCell::new(),
    });

    let tx = Sender {
        inner: Some(inner.clone()),
    };
    let rx = Receiver { inner };

    (tx, rx)
}

#[derive(Debug)]
pub struct Sender<T> {
    inner: Option<Arc<Inner<T>>>,
}

#[derive(Debug)]
pub struct Receiver<T> {
    inner: Arc<Inner<T>>,
}

#[derive(Debug)]
struct Inner<T> {
    value: UnsafeCell<Option<T>>,
    rx_waker: WaitCell,
}

unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

#[derive(Debug, Eq, PartialEq, Clone)]
pub struct RecvError(pub(super) ());

// === impl Sender ===

impl<T: fmt::Debug> Sender<T> {
    pub fn is_closed(&self) -> bool {
        let inner = self.inner.as_ref().unwrap();
        inner.rx_waker.is_closed()
    }

    #[tracing::instrument]
    pub fn send(mut self, value: T) -> Result<(), T> {
        let inner = self.inner.take().unwrap();

        if inner.rx_waker.is_closed() {
            return Err(value);
        }

        inner.value.with_mut(|ptr| unsafe {
            *ptr = Some(value);
        });

        inner.rx_waker.wake();

        Ok(())
    }
}

// === impl Receiver ===

impl<T: fmt::Debug> Receiver<T> {
    pub fn close(&mut self) {
        self.inner.as_ref().rx_waker.close();
    }

    #[tracing::instrument]
    pub fn poll_recv(&self, cx: &mut Context<'_>) -> Poll<Result<T, RecvError>> {
        let inner = &self.inner;

        if let Some(value) = self.take_value() {
            return Poll::Ready(Ok(value));
        }

        let res = inner.rx_waker.poll_wait(cx).map_err(|_| RecvError(()));
        tracing::trace!(?res);
        ready!(res)?;

        let value = self.take_value().unwrap();

        Poll::Ready(Ok(value))
    }

    fn take_value(&self) -> Option<T> {
        self.inner.value.with_mut(|ptr| unsafe { (*ptr).take() })
    }
}

impl<T: fmt::Debug> Future for Receiver<T> {
    type Output = Result<T, RecvError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Executor, ThreadPark};
    use crate::scheduler::LocalScheduler;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    #[test]
    fn oneshot_ping_pong() {
        const NUM_PINGS: usize = 10_000;

        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        let scheduler: &'static LocalScheduler = Box::leak(Box::new(LocalScheduler::new()));
        let executor: &'static Executor<&'static LocalScheduler, ThreadPark> =
            Box::leak(Box::new(Executor::new(scheduler, ThreadPark::new())));

        let rem = Arc::new(AtomicUsize::new(NUM_PINGS));
        let done = Arc::new(Mutex::new(false));
        let done_inner = done.clone();

        let rem_main = rem.clone();
        executor
            .try_submit(async move {
                for _ in 0..NUM_PINGS {
                    let rem = rem_main.clone();

                    let (tx1, rx1) = channel();
                    let (tx2, rx2) = channel();

                    executor
                        .try_submit(async {
                            rx1.await.unwrap();
                            tx2.send(()).unwrap();
                        })
                        .unwrap();

                    tx1.send(()).unwrap();
                    rx2.await.unwrap();

                    if 1 == rem.fetch_sub(1, Ordering::Relaxed) {
                        tracing::info!("done!");
                    }
                }
                *done_inner.lock().unwrap() = true;
            })
            .unwrap();

        executor.run();

        assert!(*done.lock().unwrap());
        assert_eq!(rem.load(Ordering::Relaxed), 0);
    }
}
