// hops-net/src/http.rs
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use hops_aio::checksum::{verify_checksum_async, verify_checksum_sync};
use hops_common::config::Config;
use hops_common::error::{HopsError, Result};
use hops_common::fetch::{FetchRequest, Fetcher};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::{Client, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

use crate::validation::validate_url;

const DOWNLOAD_TIMEOUT_SECS: u64 = 300;
const CONNECT_TIMEOUT_SECS: u64 = 30;
const USER_AGENT_STRING: &str = "hops build tool (Rust)";

/// Downloads into a checksum-validated cache directory.
///
/// Cached files are named `<request name>--<file name>` and reused only
/// while their checksum still matches. The main URL is tried first, then
/// each mirror in order.
#[derive(Debug, Clone)]
pub struct CachingFetcher {
    client: Client,
    cache_dir: PathBuf,
}

impl CachingFetcher {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            client: build_http_client()?,
            cache_dir: cache_dir.into(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.cache_dir())
    }

    pub fn cache_path(&self, request: &FetchRequest) -> PathBuf {
        self.cache_dir
            .join(format!("{}--{}", request.name, request.file_name))
    }

    fn cached(&self, request: &FetchRequest, cache_path: &Path) -> Option<PathBuf> {
        if !cache_path.is_file() {
            debug!("'{}' not found in cache.", request.name);
            return None;
        }
        match verify_checksum_sync(cache_path, &request.sha256) {
            Ok(()) => {
                debug!("Using valid cached file: {}", cache_path.display());
                Some(cache_path.to_path_buf())
            }
            Err(e) => {
                debug!(
                    "Cached file checksum mismatch ({}): {}. Redownloading.",
                    cache_path.display(),
                    e
                );
                if let Err(remove_err) = fs::remove_file(cache_path) {
                    debug!(
                        "Failed to remove corrupted cached file {}: {}",
                        cache_path.display(),
                        remove_err
                    );
                }
                None
            }
        }
    }

    async fn fetch_one(&self, request: &FetchRequest, url: &str, final_path: &Path) -> Result<()> {
        let parsed = validate_url(url)?;
        let temp_path = final_path.with_file_name(format!(
            ".{}.download",
            final_path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
        ));
        hops_aio::fs::remove_path(&temp_path)?;

        let result = if parsed.scheme() == "file" {
            let source = parsed.to_file_path().map_err(|_| HopsError::FetchFailure {
                name: request.name.clone(),
                url: url.to_string(),
                reason: "not a local path".to_string(),
            })?;
            tokio::fs::copy(&source, &temp_path)
                .await
                .map(|_| ())
                .map_err(|e| HopsError::FetchFailure {
                    name: request.name.clone(),
                    url: url.to_string(),
                    reason: e.to_string(),
                })
        } else {
            self.download(request, url, &temp_path).await
        };

        let verified = match result {
            Ok(()) => verify_checksum_async(&temp_path, &request.sha256).await,
            Err(e) => Err(e),
        };
        if let Err(e) = verified {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }

        fs::rename(&temp_path, final_path)?;
        debug!(
            "Moved verified file to final location: {}",
            final_path.display()
        );
        Ok(())
    }

    async fn download(&self, request: &FetchRequest, url: &str, temp_path: &Path) -> Result<()> {
        let failure = |reason: String| HopsError::FetchFailure {
            name: request.name.clone(),
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| failure(format!("HTTP request failed: {e}")))?;
        let status = response.status();
        debug!("Received HTTP status: {} for {}", status, url);
        if !status.is_success() {
            return Err(failure(match status {
                StatusCode::NOT_FOUND => "Resource not found (404)".to_string(),
                StatusCode::FORBIDDEN => "Access forbidden (403)".to_string(),
                other => format!("HTTP error {other}"),
            }));
        }

        let mut file = tokio::fs::File::create(temp_path).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| failure(format!("Failed to read response body: {e}")))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        debug!("Downloaded {} bytes from {}", written, url);
        Ok(())
    }
}

#[async_trait]
impl Fetcher for CachingFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<PathBuf> {
        let cache_path = self.cache_path(request);
        debug!(
            "Preparing to fetch '{}' from {} (cache: {})",
            request.name,
            request.url,
            cache_path.display()
        );
        if let Some(path) = self.cached(request, &cache_path) {
            return Ok(path);
        }
        fs::create_dir_all(&self.cache_dir)?;

        let mut last_error = None;
        for url in request.candidates() {
            debug!("Attempting download from: {}", url);
            match self.fetch_one(request, url, &cache_path).await {
                Ok(()) => return Ok(cache_path),
                Err(e) => {
                    error!("Download attempt failed from {}: {}", url, e);
                    last_error = Some(e);
                }
            }
        }
        if request.mirrors.is_empty() {
            warn!("'{}' has no mirrors to fall back on", request.name);
        }
        Err(last_error.unwrap_or_else(|| HopsError::FetchFailure {
            name: request.name.clone(),
            url: request.url.clone(),
            reason: "All download attempts failed.".to_string(),
        }))
    }
}

fn build_http_client() -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_STRING));
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    Ok(Client::builder()
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .default_headers(headers)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()?)
}
