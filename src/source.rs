// src/source.rs

use futures_util::TryStreamExt;
use reqwest::{Client, Url};
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unsupported locator scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("locator {0} does not name a local file")]
    InvalidFileLocator(Url),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
}

/// A byte stream read from a URL-addressed resource.
pub type SourceReader = Pin<Box<dyn AsyncRead + Send>>;

/// Opens the resource behind `url`.
///
/// `http` and `https` locators are fetched with `client`; non-success status
/// codes are errors. `file` locators are read from the local filesystem.
pub async fn open(client: &Client, url: &Url) -> Result<SourceReader, SourceError> {
    match url.scheme() {
        "http" | "https" => {
            let resp = client.get(url.clone()).send().await?.error_for_status()?;
            debug!(%url, status = %resp.status(), length = ?resp.content_length(), "source opened");
            let stream = resp.bytes_stream().map_err(io::Error::other);
            Ok(Box::pin(StreamReader::new(stream)))
        }
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|_| SourceError::InvalidFileLocator(url.clone()))?;
            let file = File::open(&path)
                .await
                .map_err(|source| SourceError::Open { path, source })?;
            debug!(%url, "source opened");
            Ok(Box::pin(file))
        }
        other => Err(SourceError::UnsupportedScheme(other.to_string())),
    }
}
