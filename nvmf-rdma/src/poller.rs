//! Queue pair polling for async executors.
//!
//! Callbacks (and therefore [`CompletionReceiver`](crate::complete::CompletionReceiver)s)
//! only fire when a queue pair is polled. To integrate with async
//! executors, run the polling as a task that yields when idle:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Local Executor                           │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────┐  │
//! │  │ App Task 1      │  │ App Task 2      │  │ run_poller  │  │
//! │  │ (cmd future)    │  │ (cmd future)    │  │ (this task) │  │
//! │  └────────┬────────┘  └────────┬────────┘  └──────┬──────┘  │
//! │           │                    │                   │         │
//! │           ▼                    ▼                   ▼         │
//! │  ┌─────────────────────────────────────────────────────────┐│
//! │  │      QueuePair::poll() - dispatches completions         ││
//! │  └─────────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use futures::executor::LocalPool;
//! use futures::task::LocalSpawnExt;
//! use nvmf_rdma::poller::run_poller;
//!
//! let mut pool = LocalPool::new();
//! let mut poller = qpair.poller()?;
//! pool.spawner().spawn_local(async move {
//!     run_poller(&qpair, &mut poller).await.ok();
//! })?;
//! pool.run_until(async {
//!     qpair.submit(command, response)?;
//!     response_done.await
//! })?;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::{Error, Result};
use crate::fabric::Connection;
use crate::nvmf::{CompletionPoller, QueuePair};

/// A future that yields once, then completes.
///
/// This allows other tasks to run before continuing.
struct YieldNow(bool);

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.0 {
            Poll::Ready(())
        } else {
            self.0 = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// Yield to other tasks in the executor.
fn yield_now() -> YieldNow {
    YieldNow(false)
}

/// Poll `qpair` until it is freed.
///
/// If a poll dispatched work, polls again immediately; otherwise yields
/// to let other tasks run.
///
/// # Errors
///
/// Returns the first poll error other than [`Error::Closed`]; a freed
/// queue pair ends the task with `Ok(())`.
pub async fn run_poller<C: Connection>(
    qpair: &QueuePair<C>,
    poller: &mut CompletionPoller<C::Poller>,
) -> Result<()> {
    loop {
        if step(qpair, poller).await? {
            return Ok(());
        }
    }
}

/// Like [`run_poller`], but returns after at most `max_iters` polls.
///
/// Useful for tests or finite workloads.
///
/// # Arguments
///
/// * `max_iters` - Maximum number of poll iterations (0 for no limit, same as `run_poller`)
pub async fn run_poller_limited<C: Connection>(
    qpair: &QueuePair<C>,
    poller: &mut CompletionPoller<C::Poller>,
    max_iters: u64,
) -> Result<()> {
    if max_iters == 0 {
        return run_poller(qpair, poller).await;
    }

    for _ in 0..max_iters {
        if step(qpair, poller).await? {
            return Ok(());
        }
    }
    Ok(())
}

/// One poll; `Ok(true)` once the queue pair is closed.
async fn step<C: Connection>(
    qpair: &QueuePair<C>,
    poller: &mut CompletionPoller<C::Poller>,
) -> Result<bool> {
    match qpair.poll(poller) {
        Ok(0) => {
            yield_now().await;
            Ok(false)
        }
        Ok(_) => Ok(false),
        Err(Error::Closed) => Ok(true),
        Err(e) => Err(e),
    }
}
