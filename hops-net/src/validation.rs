// hops-net/src/validation.rs
use hops_common::error::{HopsError, Result};
use url::Url;

/// Parses `url_str` and checks that its scheme is one hops can fetch from.
pub fn validate_url(url_str: &str) -> Result<Url> {
    let url = Url::parse(url_str)
        .map_err(|e| HopsError::Generic(format!("Failed to parse URL '{url_str}': {e}")))?;
    match url.scheme() {
        "https" | "file" => Ok(url),
        "http" => {
            tracing::warn!("Fetching over plain http: {}", url_str);
            Ok(url)
        }
        other => Err(HopsError::Generic(format!(
            "Invalid URL scheme for '{url_str}': '{other}' is not http, https or file"
        ))),
    }
}
