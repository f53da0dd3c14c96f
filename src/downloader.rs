// src/downloader.rs

use reqwest::Client;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::limiter::SpeedLimiter;
use crate::models::{ErrorKind, TaskUnit, TransferResult};
use crate::pool::PoolError;
use crate::sink::{FanOutSink, SinkError};
use crate::source::{self, SourceError, SourceReader};

/// Default size of a single read from the source, in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Why a transfer failed.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(#[from] SourceError),
    #[error("sink failure: {0}")]
    Sink(#[from] SinkError),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("worker execution error: {0}")]
    PoolExecution(String),
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::SourceUnavailable(_) => ErrorKind::SourceUnavailable,
            TransferError::Sink(_) => ErrorKind::SinkFailure,
            TransferError::Cancelled => ErrorKind::Cancelled,
            TransferError::PoolExecution(_) => ErrorKind::PoolExecutionError,
        }
    }
}

impl From<PoolError> for TransferError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Execution(message) => TransferError::PoolExecution(message),
            PoolError::Cancelled => TransferError::Cancelled,
        }
    }
}

/// Copies one task's source into all of its destinations.
///
/// Cheap to clone; every clone shares the HTTP client, the speed limiter and
/// the cancellation token.
#[derive(Clone)]
pub struct Downloader {
    client: Client,
    chunk_size: usize,
    limiter: Option<SpeedLimiter>,
    cancel: CancellationToken,
}

impl Downloader {
    pub fn new(
        client: Client,
        chunk_size: usize,
        limiter: Option<SpeedLimiter>,
        cancel: CancellationToken,
    ) -> Self {
        let chunk_size = if chunk_size == 0 { DEFAULT_CHUNK_SIZE } else { chunk_size };
        Self {
            client,
            chunk_size,
            limiter,
            cancel,
        }
    }

    /// Runs `task` to completion and reports how it went. Never panics on
    /// I/O failure and never retries.
    pub async fn run(&self, task: TaskUnit) -> TransferResult {
        let started = Instant::now();
        let mut copied = 0u64;
        info!(url = %task.source(), files = task.destinations().len(), "download started");

        let outcome = self.transfer(&task, &mut copied).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(()) => {
                info!(
                    url = %task.source(),
                    bytes = copied,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "download finished"
                );
                TransferResult::completed(task.source().clone(), copied, elapsed)
            }
            Err(e) => {
                warn!(url = %task.source(), bytes = copied, "download failed: {e}");
                TransferResult::failed(task.source().clone(), copied, elapsed, e)
            }
        }
    }

    async fn transfer(&self, task: &TaskUnit, copied: &mut u64) -> Result<(), TransferError> {
        // The source goes first so a bad locator never creates destination files.
        let mut reader = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
            opened = source::open(&self.client, task.source()) => opened?,
        };
        let mut sink = FanOutSink::create(task.destinations()).await?;

        let copy_result = self.copy_chunks(&mut reader, &mut sink, copied).await;
        drop(reader);
        let close_result = sink.close().await;

        copy_result?;
        close_result?;
        Ok(())
    }

    async fn copy_chunks(
        &self,
        reader: &mut SourceReader,
        sink: &mut FanOutSink,
        copied: &mut u64,
    ) -> Result<(), TransferError> {
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let n = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                read = reader.read(&mut buf) => read.map_err(SourceError::Read)?,
            };
            if n == 0 {
                break;
            }

            if let Some(limiter) = &self.limiter {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                    granted = limiter.consume(n as u64) => {
                        granted.map_err(|_| TransferError::Cancelled)?
                    }
                }
            }

            sink.write(&buf[..n]).await?;
            *copied += n as u64;
        }
        sink.flush().await?;
        debug!(bytes = *copied, "source exhausted");
        Ok(())
    }
}
