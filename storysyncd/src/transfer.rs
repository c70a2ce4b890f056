use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures_util::StreamExt;
use reqwest::{Client, Method};
use storysync_core::SignedUrl;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("unsupported signed url method: {0}")]
    Method(String),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
}

impl TransferError {
    /// Worth another attempt later: the network or the object store hiccuped.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Request(err) => err
                .status()
                .is_none_or(|status| status.is_server_error() || status.as_u16() == 429),
            TransferError::Io(_) => false,
            TransferError::Method(_) | TransferError::ConcurrencyClosed => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_concurrency: 4,
            upload_concurrency: 2,
        }
    }
}

/// Moves media blobs to and from time-limited signed URLs.
#[derive(Clone)]
pub struct BlobTransfer {
    http: Client,
    download_limit: Arc<Semaphore>,
    upload_limit: Arc<Semaphore>,
}

impl BlobTransfer {
    pub fn new() -> Self {
        Self::with_config(TransferConfig::default())
    }

    pub fn with_config(config: TransferConfig) -> Self {
        Self {
            http: Client::new(),
            download_limit: Arc::new(Semaphore::new(config.download_concurrency.max(1))),
            upload_limit: Arc::new(Semaphore::new(config.upload_concurrency.max(1))),
        }
    }

    /// Streams `source` to the signed URL without buffering it in memory.
    pub async fn upload_from_path(
        &self,
        link: &SignedUrl,
        source: &Path,
        content_type: &str,
    ) -> Result<(), TransferError> {
        let _permit = self
            .upload_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let method = signed_method(link, Method::PUT)?;
        let file = tokio::fs::File::open(source).await?;
        let length = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        self.http
            .request(method, link.href.clone())
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(reqwest::header::CONTENT_LENGTH, length)
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        debug!(source = %source.display(), bytes = length, "blob uploaded");
        Ok(())
    }

    /// Downloads into `<target>.partial` and renames once complete, so a
    /// crash never leaves a truncated blob under the final name.
    pub async fn download_to_path(
        &self,
        link: &SignedUrl,
        target: &Path,
    ) -> Result<(), TransferError> {
        let _permit = self
            .download_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let method = signed_method(link, Method::GET)?;
        let response = self
            .http
            .request(method, link.href.clone())
            .send()
            .await?
            .error_for_status()?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = tokio::fs::remove_file(&partial).await;
                    return Err(err.into());
                }
            };
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        tokio::fs::rename(partial, target).await?;
        debug!(target = %target.display(), "blob downloaded");
        Ok(())
    }
}

impl Default for BlobTransfer {
    fn default() -> Self {
        Self::new()
    }
}

fn signed_method(link: &SignedUrl, fallback: Method) -> Result<Method, TransferError> {
    if link.method.trim().is_empty() {
        return Ok(fallback);
    }
    Method::from_bytes(link.method.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| TransferError::Method(link.method.clone()))
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}
