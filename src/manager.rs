// src/manager.rs

use futures_util::future::join_all;
use reqwest::Client;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::EngineConfig;
use crate::downloader::{Downloader, TransferError};
use crate::limiter::SpeedLimiter;
use crate::models::{TaskUnit, TransferResult};
use crate::pool::{TaskHandle, WorkerPool};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("cannot build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Owns the transfer engine: worker pool, shared speed limiter, HTTP client
/// and the cancellation token every transfer observes.
pub struct DownloadManager {
    config: EngineConfig,
    pool: WorkerPool,
    downloader: Downloader,
    limiter: Option<SpeedLimiter>,
    cancel: CancellationToken,
}

impl DownloadManager {
    /// Builds the engine. Starts the limiter's refill task when a speed limit
    /// is configured, so this must run inside a tokio runtime.
    pub fn new(config: EngineConfig) -> Result<Self, ManagerError> {
        let config = config.normalized();
        let http_client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let cancel = CancellationToken::new();
        let limiter = config
            .is_rate_limited()
            .then(|| SpeedLimiter::start(config.speed_limit, config.chunk_size, cancel.child_token()));
        let downloader = Downloader::new(
            http_client,
            config.chunk_size,
            limiter.clone(),
            cancel.clone(),
        );

        info!(
            workers = config.workers,
            speed_limit = config.speed_limit,
            chunk_size = config.chunk_size,
            "download manager ready"
        );

        Ok(Self {
            pool: WorkerPool::new(config.workers),
            config,
            downloader,
            limiter,
            cancel,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Token that cancels every queued and running transfer when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Queues one task. The handle resolves to its [`TransferResult`].
    pub fn submit(&self, task: TaskUnit) -> TaskHandle<TransferResult> {
        let downloader = self.downloader.clone();
        self.pool.submit(async move { downloader.run(task).await })
    }

    /// Runs every task and waits for all of them. Yields one result per task,
    /// in submission order.
    pub async fn run_all(&self, tasks: Vec<TaskUnit>) -> Summary {
        let started = Instant::now();
        info!(count = tasks.len(), "submitting tasks");

        let (sources, handles): (Vec<_>, Vec<_>) = tasks
            .into_iter()
            .map(|task| (task.source().clone(), self.submit(task)))
            .unzip();

        let results = join_all(handles)
            .await
            .into_iter()
            .zip(sources)
            .map(|(joined, source)| {
                joined.unwrap_or_else(|e| {
                    error!(url = %source, "task did not complete: {e}");
                    TransferResult::failed(source, 0, Duration::ZERO, TransferError::from(e))
                })
            })
            .collect();

        Summary::new(results, started.elapsed())
    }

    /// Cancels outstanding work, drains the pool and stops the limiter.
    pub async fn shutdown(&self) {
        info!("shutting down download manager");
        self.cancel.cancel();
        self.pool.shutdown().await;
        if let Some(limiter) = &self.limiter {
            limiter.shutdown().await;
        }
    }
}

/// Aggregate of a batch of transfers.
#[derive(Debug, Serialize)]
pub struct Summary {
    pub tasks_total: usize,
    pub completed: usize,
    pub failed: usize,
    pub total_bytes: u64,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
    #[serde(skip)]
    pub results: Vec<TransferResult>,
}

impl Summary {
    pub fn new(results: Vec<TransferResult>, elapsed: Duration) -> Self {
        let completed = results.iter().filter(|r| r.success).count();
        Self {
            tasks_total: results.len(),
            completed,
            failed: results.len() - completed,
            total_bytes: results
                .iter()
                .filter(|r| r.success)
                .map(|r| r.bytes_transferred)
                .sum(),
            elapsed,
            results,
        }
    }

    /// Bytes per second over the whole batch.
    pub fn average_speed(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total_bytes as f64 / secs
        } else {
            0.0
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

fn as_millis<S: serde::Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(elapsed.as_millis() as u64)
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Tasks total: {}", self.tasks_total)?;
        writeln!(f, "Completed: {}", self.completed)?;
        writeln!(f, "Failed: {}", self.failed)?;
        writeln!(
            f,
            "Total downloaded size: {}",
            humansize::format_size(self.total_bytes, humansize::BINARY)
        )?;
        writeln!(f, "Total download time: {:.3} sec", self.elapsed.as_secs_f64())?;
        write!(
            f,
            "Average download speed: {}/s",
            humansize::format_size(self.average_speed() as u64, humansize::BINARY)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ErrorKind;
    use reqwest::Url;

    fn result(success: bool, bytes: u64) -> TransferResult {
        let url = Url::parse("http://example.com/x").unwrap();
        if success {
            TransferResult::completed(url, bytes, Duration::from_millis(10))
        } else {
            TransferResult::failed(url, bytes, Duration::from_millis(10), TransferError::Cancelled)
        }
    }

    #[test]
    fn summary_counts_only_successful_bytes() {
        let summary = Summary::new(
            vec![result(true, 100), result(false, 40), result(true, 60)],
            Duration::from_secs(2),
        );
        assert_eq!(summary.tasks_total, 3);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total_bytes, 160);
        assert_eq!(summary.average_speed(), 80.0);
        assert!(!summary.all_succeeded());
        assert_eq!(summary.results[1].error_kind(), Some(ErrorKind::Cancelled));
    }

    #[test]
    fn summary_serializes_without_results() {
        let summary = Summary::new(vec![result(true, 5)], Duration::from_millis(1500));
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["elapsed_ms"], 1500);
        assert_eq!(json["completed"], 1);
        assert!(json.get("results").is_none());
    }

    #[test]
    fn summary_display_lists_totals() {
        let summary = Summary::new(vec![result(true, 2048)], Duration::from_secs(1));
        let text = summary.to_string();
        assert!(text.contains("Tasks total: 1"));
        assert!(text.contains("KiB"));
    }
}
