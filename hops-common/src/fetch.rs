// hops-common/src/fetch.rs
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::formula::SourceSpec;

/// A checksum-pinned download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Formula or resource name, used for cache naming and errors.
    pub name: String,
    pub url: String,
    pub mirrors: Vec<String>,
    pub sha256: String,
    pub file_name: String,
}

impl FetchRequest {
    pub fn from_source(name: impl Into<String>, source: &SourceSpec) -> Self {
        Self {
            name: name.into(),
            url: source.url.clone(),
            mirrors: source.mirrors.clone(),
            sha256: source.sha256.clone(),
            file_name: source.file_name(),
        }
    }

    /// URL followed by mirrors, in the order they are tried.
    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.url.as_str()).chain(self.mirrors.iter().map(String::as_str))
    }
}

/// Turns a [`FetchRequest`] into a verified local file.
///
/// Failures are reported as `HopsError::FetchFailure` or
/// `HopsError::ChecksumMismatch`.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<PathBuf>;
}
