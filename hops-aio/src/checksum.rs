// hops-aio/src/checksum.rs
use std::path::Path;

use hops_common::error::{HopsError, Result};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Hex encoded SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    let mut hasher = Sha256::new();
    let bytes = std::io::copy(&mut reader, &mut hasher)?;
    let actual = hex::encode(hasher.finalize());
    debug!("SHA256 of {} ({} bytes): {}", path.display(), bytes, actual);
    Ok(actual)
}

fn compare(path: &Path, expected: &str, actual: &str) -> Result<()> {
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(HopsError::ChecksumMismatch(format!(
            "{}: expected {}, got {}",
            path.display(),
            expected,
            actual
        )))
    }
}

pub fn verify_checksum_sync(path: &Path, expected: &str) -> Result<()> {
    debug!("Verifying checksum for: {}", path.display());
    let actual = sha256_file(path)?;
    compare(path, expected, &actual)
}

/// Reads the file asynchronously and hashes as it goes.
pub async fn verify_checksum_async(path: &Path, expected: &str) -> Result<()> {
    debug!("Async verifying checksum for: {}", path.display());
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = Vec::with_capacity(64 * 1024);
    let mut total_bytes_read = 0u64;

    loop {
        buffer.clear();
        let n = file.read_buf(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total_bytes_read += n as u64;
    }

    let actual = hex::encode(hasher.finalize());
    debug!(
        "Async calculated SHA256: {} ({} bytes read), expected {}",
        actual, total_bytes_read, expected
    );
    compare(path, expected, &actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    // sha256("hello\n")
    const HELLO: &str = "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";

    #[test]
    fn hashes_and_verifies() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f");
        std::fs::write(&path, "hello\n").unwrap();
        assert_eq!(sha256_file(&path).unwrap(), HELLO);
        verify_checksum_sync(&path, &HELLO.to_uppercase()).unwrap();
    }

    #[tokio::test]
    async fn mismatch_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f");
        std::fs::write(&path, "hello\n").unwrap();
        verify_checksum_async(&path, HELLO).await.unwrap();
        let err = verify_checksum_async(&path, &"0".repeat(64)).await.unwrap_err();
        assert!(matches!(err, HopsError::ChecksumMismatch(_)));
    }
}
