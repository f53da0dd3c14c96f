// src/main.rs

use anyhow::{bail, Context, Result};
use clap::Parser;
use fileloader::prelude::*;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Downloads every URL listed in a task file into an output folder.
///
/// Each line of the task file is `<URL> <FILE>`. Lines sharing a URL are
/// fetched once and written to all of their files.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Task file with one `<URL> <FILE>` pair per line.
    #[arg(short = 'f', long, env = "FILELOADER_FILE")]
    file: PathBuf,

    /// Number of downloads running at once (0 = default of 5).
    #[arg(short = 'n', long, default_value_t = 0, env = "FILELOADER_THREADS")]
    threads: usize,

    /// Output folder; created if missing.
    #[arg(short, long, default_value = "download", env = "FILELOADER_OUTPUT")]
    output: PathBuf,

    /// Aggregate speed limit in bytes per second, with an optional k or m suffix.
    #[arg(short, long, env = "FILELOADER_LIMIT")]
    limit: Option<String>,

    /// Bytes read from a source at a time.
    #[arg(long, default_value_t = fileloader::downloader::DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Print the summary as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let speed_limit = match args.limit.as_deref() {
        Some(raw) => parse_speed_limit(raw)?,
        None => 0,
    };
    let config = EngineConfig {
        workers: args.threads,
        speed_limit,
        chunk_size: args.chunk_size,
    };

    prepare_output_dir(&args.output).await?;
    let descriptions = read_task_file(&args.file)
        .await
        .with_context(|| format!("processing task file {}", args.file.display()))?;
    let tasks = merge_tasks(descriptions, &args.output)?;
    info!(tasks = tasks.len(), output = %args.output.display(), "tasks loaded");

    let manager = DownloadManager::new(config)?;

    let cancel = manager.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling downloads");
            cancel.cancel();
        }
    });

    let summary = manager.run_all(tasks).await;
    manager.shutdown().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{summary}");
    }

    if !summary.all_succeeded() {
        bail!("{} of {} downloads failed", summary.failed, summary.tasks_total);
    }
    Ok(())
}
