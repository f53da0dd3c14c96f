// src/sink.rs

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("no destinations given")]
    NoDestinations,
    #[error("destination {0} given more than once")]
    DuplicateDestination(PathBuf),
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("write to {path} failed: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("closing {path} failed: {source}")]
    Close {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

struct Destination {
    path: PathBuf,
    writer: BufWriter<File>,
}

/// One logical output that replicates every write to several files.
///
/// Every file is opened at construction. Dropping the sink releases all file
/// handles; [`FanOutSink::close`] additionally flushes and reports errors.
pub struct FanOutSink {
    destinations: Vec<Destination>,
}

impl FanOutSink {
    /// Creates (or truncates) every destination.
    ///
    /// If one of them cannot be opened the files opened so far are closed
    /// and the open error is returned.
    pub async fn create(paths: &[PathBuf]) -> Result<Self, SinkError> {
        if paths.is_empty() {
            return Err(SinkError::NoDestinations);
        }
        let mut seen = HashSet::with_capacity(paths.len());
        if let Some(dup) = paths.iter().find(|p| !seen.insert(p.as_path())) {
            return Err(SinkError::DuplicateDestination(dup.clone()));
        }

        let mut destinations = Vec::with_capacity(paths.len());
        for path in paths {
            match File::create(path).await {
                Ok(file) => destinations.push(Destination {
                    path: path.clone(),
                    writer: BufWriter::new(file),
                }),
                Err(source) => {
                    warn!(path = %path.display(), "cannot open destination: {source}");
                    for opened in destinations {
                        release(opened.writer).await;
                    }
                    return Err(SinkError::Open {
                        path: path.clone(),
                        source,
                    });
                }
            }
        }
        debug!(count = destinations.len(), "destinations opened");
        Ok(Self { destinations })
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.destinations.iter().map(|d| d.path.as_path())
    }

    /// Writes `buf` to every destination.
    ///
    /// A failing destination does not stop the others from being written.
    /// The first error is returned.
    pub async fn write(&mut self, buf: &[u8]) -> Result<(), SinkError> {
        let mut first_error = None;
        for dest in &mut self.destinations {
            if let Err(source) = dest.writer.write_all(buf).await {
                warn!(path = %dest.path.display(), "write failed: {source}");
                first_error.get_or_insert(SinkError::Write {
                    path: dest.path.clone(),
                    source,
                });
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn flush(&mut self) -> Result<(), SinkError> {
        let mut first_error = None;
        for dest in &mut self.destinations {
            if let Err(source) = dest.writer.flush().await {
                warn!(path = %dest.path.display(), "flush failed: {source}");
                first_error.get_or_insert(SinkError::Write {
                    path: dest.path.clone(),
                    source,
                });
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Flushes and closes every destination, even after earlier failures.
    pub async fn close(self) -> Result<(), SinkError> {
        let mut first_error = None;
        for mut dest in self.destinations {
            if let Err(source) = dest.writer.shutdown().await {
                warn!(path = %dest.path.display(), "close failed: {source}");
                first_error.get_or_insert(SinkError::Close {
                    path: dest.path,
                    source,
                });
            }
            release(dest.writer).await;
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Waits for in-flight operations on the file and drops the descriptor.
async fn release(writer: BufWriter<File>) {
    drop(writer.into_inner().into_std().await);
}
