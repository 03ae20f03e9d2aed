//! Artifact download

use std::io::Write;
use std::path::Path;

use async_trait::async_trait;
use futures_util::TryStreamExt;

use crate::error::{BackendError, Result};
use crate::types::{report, DownloadProgress, ProgressCallback};

/// Fetches a release artifact to a local file
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Download `url` into `dest`, reporting progress as bytes arrive
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<&ProgressCallback>,
    ) -> Result<()>;
}

/// Downloads artifacts over HTTP (GitHub releases)
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<&ProgressCallback>,
    ) -> Result<()> {
        log::info!("Downloading {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| BackendError::Install(format!("Failed to start download: {}", e)))?;

        if !response.status().is_success() {
            return Err(BackendError::Install(format!(
                "Download of {} failed with status: {}",
                url,
                response.status()
            )));
        }

        let total = response.content_length().unwrap_or(0);
        let mut file = std::fs::File::create(dest)
            .map_err(|e| BackendError::Install(format!("Failed to create {:?}: {}", dest, e)))?;

        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream
            .try_next()
            .await
            .map_err(|e| BackendError::Install(format!("Download error: {}", e)))?
        {
            file.write_all(&chunk)
                .map_err(|e| BackendError::Install(format!("Failed to write chunk: {}", e)))?;

            downloaded += chunk.len() as u64;
            report(
                progress,
                DownloadProgress {
                    status: "Downloading...".to_string(),
                    current: downloaded,
                    total,
                    done: false,
                    error: None,
                },
            );
        }

        file.flush()?;
        Ok(())
    }
}
