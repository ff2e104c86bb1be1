//! Callback-to-future utilities for queue pair completions.
//!
//! Commands and responses report through [`Callback`]s fired from
//! [`QueuePair::poll`](crate::nvmf::QueuePair::poll). This module turns a
//! callback into a Rust future using oneshot channels.
//!
//! # Pattern
//!
//! 1. Create a callback/future pair with [`callback_completion()`]
//! 2. Hand the callback to a [`Command`](crate::nvmf::Command) or
//!    [`Response`](crate::nvmf::Response)
//! 3. Submit
//! 4. Drive the future with [`block_on()`], which polls the queue pair
//!    while the future is pending, or `.await` it next to a
//!    [`run_poller`](crate::poller::run_poller) task

use std::future::Future;
use std::pin::{Pin, pin};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};

use futures_channel::oneshot;

use crate::error::{Error, Result};
use crate::fabric::CompletionError;
use crate::nvmf::Callback;

/// Sender half of a completion pair.
pub struct CompletionSender<T> {
    tx: oneshot::Sender<Result<T>>,
}

impl<T> CompletionSender<T> {
    /// Send a result.
    pub fn complete(self, result: Result<T>) {
        // Ignore send error - receiver may have been dropped
        let _ = self.tx.send(result);
    }

    /// Send a successful value.
    pub fn success(self, value: T) {
        let _ = self.tx.send(Ok(value));
    }

    /// Send an error.
    pub fn error(self, err: Error) {
        let _ = self.tx.send(Err(err));
    }
}

/// Receiver half of a completion pair.
///
/// Implements `Future` - await this to get the result. Resolves to
/// [`Error::Cancelled`] if the sender is dropped without sending.
pub struct CompletionReceiver<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for CompletionReceiver<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Create a completion sender/receiver pair.
pub fn completion<T>() -> (CompletionSender<T>, CompletionReceiver<T>) {
    let (tx, rx) = oneshot::channel();
    (CompletionSender { tx }, CompletionReceiver { rx })
}

/// A [`Callback`] that resolves a [`CompletionReceiver`] on its first
/// `on_complete` or `on_failure`. Later notifications are ignored.
pub struct CallbackCompletion {
    tx: Mutex<Option<CompletionSender<()>>>,
}

impl CallbackCompletion {
    fn take(&self) -> Option<CompletionSender<()>> {
        self.tx.lock().ok().and_then(|mut tx| tx.take())
    }
}

impl Callback for CallbackCompletion {
    fn on_complete(&self) {
        if let Some(tx) = self.take() {
            tx.success(());
        }
    }

    fn on_failure(&self, reason: CompletionError) {
        if let Some(tx) = self.take() {
            tx.error(Error::Completion(reason));
        }
    }
}

/// Create a callback whose outcome is observed through a future.
///
/// # Example
///
/// ```
/// use nvmf_rdma::complete::{block_on, callback_completion};
/// use nvmf_rdma::nvmf::Callback;
///
/// let (callback, done) = callback_completion();
/// callback.on_complete();
/// block_on(done, || Ok(0)).unwrap().unwrap();
/// ```
pub fn callback_completion() -> (Arc<CallbackCompletion>, CompletionReceiver<()>) {
    let (tx, rx) = completion();
    (
        Arc::new(CallbackCompletion {
            tx: Mutex::new(Some(tx)),
        }),
        rx,
    )
}

/// A simple waker that does nothing - we poll manually.
struct NoopWaker;

impl Wake for NoopWaker {
    fn wake(self: Arc<Self>) {}
}

/// Block on a future, calling `poll` while waiting.
///
/// This function runs the future to completion by repeatedly:
/// 1. Polling the future
/// 2. If pending, calling `poll` to process completions
///
/// Queue pair callbacks only fire when the queue pair is polled, so `poll`
/// is normally `|| qpair.poll(&mut poller)`.
///
/// # Errors
///
/// Returns the first error `poll` returns; the future is dropped.
pub fn block_on<F, P>(future: F, mut poll: P) -> Result<F::Output>
where
    F: Future,
    P: FnMut() -> Result<usize>,
{
    let waker = Waker::from(Arc::new(NoopWaker));
    let mut cx = Context::from_waker(&waker);
    let mut future = pin!(future);

    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(result) => return Ok(result),
            Poll::Pending => {
                poll()?;
            }
        }
    }
}
