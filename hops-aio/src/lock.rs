// hops-aio/src/lock.rs
//! Advisory per-key build locks backed by `flock(2)`.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use hops_common::error::{HopsError, Result};
use tracing::debug;

/// Exclusive lock on `<dir>/<key>.lock`, released on drop. The holder's pid
/// is written into the file for contention messages.
#[derive(Debug)]
pub struct BuildLock {
    file: File,
    key: String,
    path: PathBuf,
}

fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    // SAFETY: the descriptor is owned by `file` and valid for this call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn open_lock_file(dir: &Path, key: &str) -> Result<(File, PathBuf)> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{key}.lock"));
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;
    Ok((file, path))
}

impl BuildLock {
    /// Takes the lock without waiting; a held lock is `LockContention`.
    pub fn try_acquire(dir: &Path, key: &str) -> Result<Self> {
        let (file, path) = open_lock_file(dir, key)?;
        if let Err(err) = flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(HopsError::LockContention {
                    key: key.to_string(),
                    holder: read_holder(&path),
                });
            }
            return Err(err.into());
        }
        Self::finish(file, key, path)
    }

    /// Waits until the lock is free.
    pub async fn acquire(dir: &Path, key: &str) -> Result<Self> {
        let dir = dir.to_path_buf();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let (file, path) = open_lock_file(&dir, &key)?;
            if let Err(err) = flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
                if err.kind() != io::ErrorKind::WouldBlock {
                    return Err(err.into());
                }
                debug!(
                    "Waiting for build lock '{}' held by {}",
                    key,
                    read_holder(&path).unwrap_or_else(|| "unknown".to_string())
                );
                flock(&file, libc::LOCK_EX)?;
            }
            Self::finish(file, &key, path)
        })
        .await
        .map_err(|e| HopsError::Generic(format!("JoinError acquiring lock: {e}")))?
    }

    fn finish(mut file: File, key: &str, path: PathBuf) -> Result<Self> {
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "pid {}", std::process::id())?;
        file.flush()?;
        debug!("Acquired build lock {}", path.display());
        Ok(Self {
            file,
            key: key.to_string(),
            path,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_holder(path: &Path) -> Option<String> {
    let mut contents = String::new();
    File::open(path).ok()?.read_to_string(&mut contents).ok()?;
    let contents = contents.trim();
    (!contents.is_empty()).then(|| contents.to_string())
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = flock(&self.file, libc::LOCK_UN);
        debug!("Released build lock {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_sees_contention() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = BuildLock::try_acquire(tmp.path(), "r-abc").unwrap();
        match BuildLock::try_acquire(tmp.path(), "r-abc") {
            Err(HopsError::LockContention { key, holder }) => {
                assert_eq!(key, "r-abc");
                assert_eq!(holder, Some(format!("pid {}", std::process::id())));
            }
            other => panic!("expected contention, got {other:?}"),
        }
        assert!(BuildLock::try_acquire(tmp.path(), "plr-abc").is_ok());
        drop(lock);
        assert!(BuildLock::try_acquire(tmp.path(), "r-abc").is_ok());
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let tmp = tempfile::tempdir().unwrap();
        let held = BuildLock::try_acquire(tmp.path(), "k").unwrap();
        let dir = tmp.path().to_path_buf();
        let waiter = tokio::spawn(async move { BuildLock::acquire(&dir, "k").await });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());
        drop(held);
        let lock = waiter.await.unwrap().unwrap();
        assert_eq!(lock.key(), "k");
    }
}
