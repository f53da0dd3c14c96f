// src/lib.rs

pub mod config;
pub mod downloader;
pub mod limiter;
pub mod manager;
pub mod models;
pub mod pool;
pub mod sink;
pub mod source;
pub mod tasks;

/// Convenient re-exports of the types most callers need.
pub mod prelude {
    pub use crate::config::{parse_speed_limit, EngineConfig};
    pub use crate::downloader::{Downloader, TransferError};
    pub use crate::limiter::SpeedLimiter;
    pub use crate::manager::{DownloadManager, Summary};
    pub use crate::models::{ErrorKind, TaskUnit, TransferResult};
    pub use crate::pool::{TaskHandle, WorkerPool};
    pub use crate::sink::FanOutSink;
    pub use crate::tasks::{merge_tasks, prepare_output_dir, read_task_file};
}
