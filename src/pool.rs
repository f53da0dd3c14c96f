// src/pool.rs

use futures_util::future::{AbortHandle, Abortable, BoxFuture};
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Number of slots used when the configured size is zero.
pub const DEFAULT_POOL_SIZE: usize = 5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("unit of work terminated abnormally: {0}")]
    Execution(String),
    #[error("worker pool shut down before the unit of work ran")]
    Cancelled,
}

type Job = BoxFuture<'static, ()>;

/// A fixed number of execution slots.
///
/// Submitted work goes into one queue. A dispatcher takes jobs off the queue
/// in submission order and spawns each one only after it has obtained a slot.
pub struct WorkerPool {
    queue: mpsc::UnboundedSender<Job>,
    slots: Arc<Semaphore>,
    size: usize,
    tracker: TaskTracker,
    closing: CancellationToken,
}

impl WorkerPool {
    /// Creates a pool with `size` slots, or [`DEFAULT_POOL_SIZE`] when `size` is 0.
    /// Must be called from within a tokio runtime.
    pub fn new(size: usize) -> Self {
        let size = if size == 0 { DEFAULT_POOL_SIZE } else { size };
        let (queue, jobs) = mpsc::unbounded_channel();
        let slots = Arc::new(Semaphore::new(size));
        let tracker = TaskTracker::new();
        let closing = CancellationToken::new();

        tracker.spawn(dispatch(jobs, slots.clone(), tracker.clone(), closing.clone()));
        info!(slots = size, "worker pool created");

        Self {
            queue,
            slots,
            size,
            tracker,
            closing,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queues `work` for execution. Never waits; the returned handle resolves
    /// with the output once the work has run.
    pub fn submit<F, T>(&self, work: F) -> TaskHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done, outcome) = oneshot::channel();
        let (abort, registration) = AbortHandle::new_pair();
        let work = Abortable::new(AssertUnwindSafe(work).catch_unwind(), registration);

        let job = async move {
            let result = match work.await {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(panic)) => Err(PoolError::Execution(panic_message(panic))),
                Err(_aborted) => Err(PoolError::Cancelled),
            };
            if done.send(result).is_err() {
                debug!("task handle dropped before completion");
            }
        };

        // After shutdown the job is dropped here and the handle resolves to Cancelled.
        if self.queue.send(job.boxed()).is_err() {
            debug!("submission after pool shutdown");
        }
        TaskHandle { outcome, abort }
    }

    /// Stops admitting queued work and waits for everything already running to finish.
    ///
    /// Work still waiting for a slot resolves to [`PoolError::Cancelled`].
    pub async fn shutdown(&self) {
        self.closing.cancel();
        self.slots.close();
        self.tracker.close();
        self.tracker.wait().await;
        debug!("worker pool drained");
    }
}

async fn dispatch(
    mut jobs: mpsc::UnboundedReceiver<Job>,
    slots: Arc<Semaphore>,
    tracker: TaskTracker,
    closing: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = closing.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        let slot = tokio::select! {
            biased;
            _ = closing.cancelled() => break,
            slot = slots.clone().acquire_owned() => match slot {
                Ok(slot) => slot,
                Err(_) => break,
            },
        };
        tracker.spawn(async move {
            job.await;
            drop(slot);
        });
    }
    // Jobs left in the queue are dropped with it, which cancels their handles.
    jobs.close();
    debug!("worker pool dispatcher stopped");
}

/// Resolves to the output of one submitted unit of work.
pub struct TaskHandle<T> {
    outcome: oneshot::Receiver<Result<T, PoolError>>,
    abort: AbortHandle,
}

impl<T> TaskHandle<T> {
    /// Aborts the unit of work. The handle then resolves to [`PoolError::Cancelled`].
    pub fn abort(&self) {
        self.abort.abort();
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.outcome)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(PoolError::Cancelled)))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn zero_size_uses_default() {
        assert_eq!(WorkerPool::new(0).size(), DEFAULT_POOL_SIZE);
        assert_eq!(WorkerPool::new(3).size(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_runs_more_than_size_at_once() {
        let pool = WorkerPool::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..12)
            .map(|i| {
                let running = running.clone();
                let peak = peak.clone();
                pool.submit(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    i
                })
            })
            .collect();

        let mut outputs = Vec::new();
        for handle in handles {
            outputs.push(handle.await.unwrap());
        }

        assert_eq!(outputs, (0..12).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn burst_submissions_start_in_submission_order() {
        for _ in 0..50 {
            let pool = WorkerPool::new(1);
            let started = Arc::new(Mutex::new(Vec::new()));

            let handles: Vec<_> = (0..20)
                .map(|i| {
                    let started = started.clone();
                    pool.submit(async move {
                        started.lock().unwrap().push(i);
                    })
                })
                .collect();
            for handle in handles {
                handle.await.unwrap();
            }

            assert_eq!(*started.lock().unwrap(), (0..20).collect::<Vec<_>>());
            pool.shutdown().await;
        }
    }

    #[tokio::test]
    async fn panic_becomes_execution_error() {
        let pool = WorkerPool::new(1);
        let handle = pool.submit(async {
            if true {
                panic!("boom");
            }
            7
        });
        assert_eq!(handle.await, Err(PoolError::Execution("boom".to_string())));

        // The slot is released after the panic.
        assert_eq!(pool.submit(async { 8 }).await, Ok(8));
    }

    #[tokio::test]
    async fn queued_work_is_cancelled_on_shutdown() {
        let pool = WorkerPool::new(1);
        let (release, wait) = oneshot::channel::<()>();
        let running = pool.submit(async move {
            wait.await.unwrap();
            1
        });
        let queued = pool.submit(async { 2 });
        tokio::task::yield_now().await;

        let shutdown = pool.shutdown();
        tokio::pin!(shutdown);
        tokio::select! {
            _ = &mut shutdown => panic!("shutdown finished while work was running"),
            _ = tokio::task::yield_now() => {}
        }
        release.send(()).unwrap();
        shutdown.await;

        assert_eq!(running.await, Ok(1));
        assert_eq!(queued.await, Err(PoolError::Cancelled));
        assert_eq!(pool.submit(async { 3 }).await, Err(PoolError::Cancelled));
    }

    #[tokio::test]
    async fn aborted_work_resolves_cancelled() {
        let pool = WorkerPool::new(1);
        let handle = pool.submit(std::future::pending::<()>());
        handle.abort();
        assert_eq!(handle.await, Err(PoolError::Cancelled));
    }
}
