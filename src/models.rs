// src/models.rs

use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::downloader::TransferError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task for {0} has no destinations")]
    NoDestinations(Url),
    #[error("destination {path} listed more than once for {url}")]
    DuplicateDestination { url: Url, path: PathBuf },
}

/// One source-to-destinations transfer request.
///
/// Holds a non-empty list of distinct destination paths; the list order is
/// preserved and is the order in which the files are opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskUnit {
    source: Url,
    destinations: Vec<PathBuf>,
}

impl TaskUnit {
    pub fn new(source: Url, destinations: Vec<PathBuf>) -> Result<Self, TaskError> {
        if destinations.is_empty() {
            return Err(TaskError::NoDestinations(source));
        }
        let mut seen = HashSet::with_capacity(destinations.len());
        for path in &destinations {
            if !seen.insert(path) {
                return Err(TaskError::DuplicateDestination {
                    url: source,
                    path: path.clone(),
                });
            }
        }
        Ok(Self { source, destinations })
    }

    pub fn source(&self) -> &Url {
        &self.source
    }

    pub fn destinations(&self) -> &[PathBuf] {
        &self.destinations
    }
}

/// Coarse classification of a failed transfer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    SourceUnavailable,
    SinkFailure,
    Cancelled,
    PoolExecutionError,
}

/// Outcome of a single task unit. Exactly one is produced per submitted task.
#[derive(Debug)]
pub struct TransferResult {
    pub source: Url,
    pub success: bool,
    pub bytes_transferred: u64,
    pub elapsed: Duration,
    pub error: Option<TransferError>,
}

impl TransferResult {
    pub fn completed(source: Url, bytes_transferred: u64, elapsed: Duration) -> Self {
        Self {
            source,
            success: true,
            bytes_transferred,
            elapsed,
            error: None,
        }
    }

    pub fn failed(
        source: Url,
        bytes_transferred: u64,
        elapsed: Duration,
        error: TransferError,
    ) -> Self {
        Self {
            source,
            success: false,
            bytes_transferred,
            elapsed,
            error: Some(error),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(TransferError::kind)
    }

    /// Average throughput in bytes per second, if any time elapsed.
    pub fn speed(&self) -> Option<f64> {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            Some(self.bytes_transferred as f64 / secs)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("http://example.com/file.bin").unwrap()
    }

    #[test]
    fn task_unit_rejects_empty_destinations() {
        let err = TaskUnit::new(url(), Vec::new()).unwrap_err();
        assert_eq!(err, TaskError::NoDestinations(url()));
    }

    #[test]
    fn task_unit_rejects_duplicate_destinations() {
        let err = TaskUnit::new(
            url(),
            vec![PathBuf::from("a"), PathBuf::from("b"), PathBuf::from("a")],
        )
        .unwrap_err();
        assert!(matches!(err, TaskError::DuplicateDestination { ref path, .. } if path == &PathBuf::from("a")));
    }

    #[test]
    fn task_unit_keeps_destination_order() {
        let task = TaskUnit::new(url(), vec![PathBuf::from("b"), PathBuf::from("a")]).unwrap();
        assert_eq!(task.destinations(), &[PathBuf::from("b"), PathBuf::from("a")]);
    }

    #[test]
    fn failed_result_exposes_kind() {
        let result = TransferResult::failed(url(), 12, Duration::from_millis(3), TransferError::Cancelled);
        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ErrorKind::Cancelled));
    }
}
