// src/limiter.rs

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info};

/// How often the refill task tops up the bucket.
pub const TICK_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LimiterError {
    #[error("speed limiter is shutting down")]
    ShuttingDown,
}

/// A token bucket for rate limiting, shared across all running transfers.
///
/// Tokens are bytes. A background task adds `fill_step` tokens every tick,
/// never going above `capacity`, and wakes every waiting consumer. Consumers
/// park until enough tokens are available; nobody polls.
///
/// Cloning is cheap and every clone draws from the same bucket. The refill
/// task stops when [`SpeedLimiter::shutdown`] is called, when the token passed
/// to [`SpeedLimiter::start`] is cancelled, or when the last clone is dropped.
#[derive(Clone)]
pub struct SpeedLimiter {
    shared: Arc<Shared>,
    refill: Arc<Refill>,
}

struct Shared {
    bucket: Mutex<TokenBucket>,
    /// Signalled (broadcast) after every refill that added tokens.
    has_tokens: Notify,
    /// Signalled after every successful take.
    has_headroom: Notify,
    capacity: u64,
    fill_step: u64,
    tick: Duration,
    stop: CancellationToken,
}

/// The mutable part of the bucket. Only touched through `Shared::lock`.
struct TokenBucket {
    available: u64,
    closed: bool,
}

struct Refill {
    handle: Mutex<Option<JoinHandle<()>>>,
    _stop_on_drop: DropGuard,
}

impl SpeedLimiter {
    /// Spawns the refill task for a limit of `rate_bytes_per_sec` and returns
    /// a handle to the bucket. Must be called from within a tokio runtime.
    ///
    /// The bucket can hold two read chunks (or two fill steps, whichever is
    /// larger) and starts full.
    pub fn start(rate_bytes_per_sec: u64, chunk_size: usize, stop: CancellationToken) -> Self {
        Self::start_with_tick(rate_bytes_per_sec, chunk_size, TICK_INTERVAL, stop)
    }

    pub fn start_with_tick(
        rate_bytes_per_sec: u64,
        chunk_size: usize,
        tick: Duration,
        stop: CancellationToken,
    ) -> Self {
        let fill_step = fill_step_for(rate_bytes_per_sec, tick);
        let capacity = (chunk_size as u64)
            .saturating_mul(2)
            .max(fill_step.saturating_mul(2));

        let shared = Arc::new(Shared {
            bucket: Mutex::new(TokenBucket {
                available: capacity,
                closed: false,
            }),
            has_tokens: Notify::new(),
            has_headroom: Notify::new(),
            capacity,
            fill_step,
            tick,
            stop: stop.clone(),
        });

        info!(
            rate = rate_bytes_per_sec,
            capacity,
            fill_step,
            tick_ms = tick.as_millis() as u64,
            "speed limiter started"
        );

        let handle = tokio::spawn(run_refill(shared.clone()));
        Self {
            shared,
            refill: Arc::new(Refill {
                handle: Mutex::new(Some(handle)),
                _stop_on_drop: stop.drop_guard(),
            }),
        }
    }

    /// Waits until `amount` bytes may be written, then takes them from the bucket.
    ///
    /// Requests larger than the bucket are served in capacity-sized
    /// installments. Returns [`LimiterError::ShuttingDown`] once the limiter
    /// has been stopped, including for callers that were already waiting.
    pub async fn consume(&self, amount: u64) -> Result<(), LimiterError> {
        let mut remaining = amount;
        while remaining > 0 {
            let installment = remaining.min(self.shared.capacity);
            self.take(installment).await?;
            remaining -= installment;
        }
        Ok(())
    }

    async fn take(&self, amount: u64) -> Result<(), LimiterError> {
        let notified = self.shared.has_tokens.notified();
        tokio::pin!(notified);
        loop {
            // Register interest before looking at the bucket so a refill that
            // lands between the check and the await is not lost.
            notified.as_mut().enable();
            let taken = self.shared.lock().take(amount)?;
            if taken {
                self.shared.has_headroom.notify_one();
                return Ok(());
            }
            notified.as_mut().await;
            notified.set(self.shared.has_tokens.notified());
        }
    }

    pub fn capacity(&self) -> u64 {
        self.shared.capacity
    }

    pub fn fill_step(&self) -> u64 {
        self.shared.fill_step
    }

    pub fn tick_interval(&self) -> Duration {
        self.shared.tick
    }

    /// Stops the refill task, waits for it to exit and releases every waiting consumer.
    pub async fn shutdown(&self) {
        self.shared.stop.cancel();
        let handle = self
            .refill
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("speed limiter refill task ended abnormally: {e}");
            }
        }
        self.shared.close();
    }

    #[cfg(test)]
    fn available(&self) -> u64 {
        self.shared.lock().available
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TokenBucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        self.lock().closed = true;
        self.has_tokens.notify_waiters();
    }
}

impl TokenBucket {
    /// Takes `amount` tokens if they are all available.
    fn take(&mut self, amount: u64) -> Result<bool, LimiterError> {
        if self.closed {
            return Err(LimiterError::ShuttingDown);
        }
        if self.available >= amount {
            self.available -= amount;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Adds one fill step, clamped to `capacity`. Returns whether anything was added.
    fn refill(&mut self, fill_step: u64, capacity: u64) -> bool {
        if self.available >= capacity {
            return false;
        }
        self.available = self.available.saturating_add(fill_step).min(capacity);
        true
    }
}

fn fill_step_for(rate_bytes_per_sec: u64, tick: Duration) -> u64 {
    let step = rate_bytes_per_sec as u128 * tick.as_micros() / 1_000_000;
    (step.min(u64::MAX as u128) as u64).max(1)
}

/// Closes the bucket when the refill task exits for any reason, panics included.
struct ReleaseOnExit(Arc<Shared>);

impl Drop for ReleaseOnExit {
    fn drop(&mut self) {
        self.0.close();
    }
}

async fn run_refill(shared: Arc<Shared>) {
    let _release = ReleaseOnExit(shared.clone());
    let mut ticker = time::interval(shared.tick);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shared.stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let (added, full) = {
            let mut bucket = shared.lock();
            let added = bucket.refill(shared.fill_step, shared.capacity);
            (added, bucket.available >= shared.capacity)
        };
        if added {
            shared.has_tokens.notify_waiters();
        }

        if full {
            // Nothing to do until somebody drains the bucket.
            tokio::select! {
                biased;
                _ = shared.stop.cancelled() => break,
                _ = shared.has_headroom.notified() => ticker.reset(),
            }
        }
    }

    debug!("speed limiter refill task stopped");
}
