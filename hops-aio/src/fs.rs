// hops-aio/src/fs.rs
//! Primitive synchronous filesystem operations.
use std::fs::{self, Permissions};
use std::io::{self, Write};
#[cfg(unix)]
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use hops_common::error::{HopsError, Result};
use tempfile::NamedTempFile;
use tracing::{debug, error, warn};

/// Checks if a path exists without following symlinks.
pub fn check_symlink_exists(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

/// Removes a file, symlink or directory tree. Missing paths are fine.
pub fn remove_path(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    debug!("Removing {}", path.display());
    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|e| {
        error!("Failed to remove {}: {}", path.display(), e);
        HopsError::from(e)
    })
}

#[cfg(unix)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    debug!("Setting permissions on {}: {:o}", path.display(), mode);
    fs::set_permissions(path, Permissions::from_mode(mode)).map_err(|e| {
        error!("Failed set permissions on {}: {}", path.display(), e);
        HopsError::from(e)
    })
}

#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Points `link` at `target`, replacing whatever was at `link`.
#[cfg(unix)]
pub fn replace_symlink(target: &Path, link: &Path) -> Result<()> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)?;
    }
    if check_symlink_exists(link) {
        remove_path(link)?;
    }
    debug!("Creating symlink {} -> {}", link.display(), target.display());
    symlink(target, link).map_err(|e| {
        error!(
            "Failed create symlink {} -> {}: {}",
            link.display(),
            target.display(),
            e
        );
        HopsError::from(e)
    })
}

/// Path of `to` as seen from inside directory `from_dir`. Both must be
/// absolute or both relative to the same base.
pub fn relative_path(from_dir: &Path, to: &Path) -> PathBuf {
    let from: Vec<Component<'_>> = from_dir.components().collect();
    let to_components: Vec<Component<'_>> = to.components().collect();
    let common = from
        .iter()
        .zip(to_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..from.len() {
        rel.push("..");
    }
    for comp in &to_components[common..] {
        rel.push(comp.as_os_str());
    }
    if rel.as_os_str().is_empty() {
        rel.push(".");
    }
    rel
}

/// Copies a tree, recreating symlinks as symlinks and keeping file modes.
#[cfg(unix)]
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<u64> {
    fs::create_dir_all(dst)?;
    let mut copied = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        copied += copy_entry(&from, &to)?;
    }
    Ok(copied)
}

/// Copies one file, symlink or directory.
#[cfg(unix)]
pub fn copy_entry(from: &Path, to: &Path) -> Result<u64> {
    let meta = fs::symlink_metadata(from)?;
    if meta.file_type().is_symlink() {
        let target = fs::read_link(from)?;
        replace_symlink(&target, to)?;
        Ok(1)
    } else if meta.is_dir() {
        copy_dir_recursive(from, to)
    } else {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        if check_symlink_exists(to) {
            remove_path(to)?;
        }
        fs::copy(from, to)?;
        fs::set_permissions(to, Permissions::from_mode(meta.permissions().mode()))?;
        Ok(1)
    }
}

/// Atomically writes data to a file using a temporary file.
/// Preserves original permissions if possible.
pub fn atomic_write_file(original_path: &Path, content: &[u8]) -> Result<()> {
    let dir = original_path.parent().ok_or_else(|| {
        HopsError::Generic(format!(
            "Cannot get parent directory for {}",
            original_path.display()
        ))
    })?;
    fs::create_dir_all(dir)?;

    let original_perms = fs::metadata(original_path).map(|m| m.permissions()).ok();

    let mut temp_file = NamedTempFile::new_in(dir)?;
    let temp_path = temp_file.path().to_path_buf();
    debug!(
        "Atomically writing {} bytes to {} via temp file {}",
        content.len(),
        original_path.display(),
        temp_path.display()
    );

    temp_file.write_all(content)?;
    temp_file.flush()?;
    temp_file.as_file().sync_all()?;

    temp_file.persist(original_path).map_err(|e| {
        error!(
            "Failed to persist temporary file {} over {}: {}",
            temp_path.display(),
            original_path.display(),
            e.error
        );
        HopsError::Io(Arc::new(e.error))
    })?;

    let mode_result = match original_perms {
        Some(perms) => fs::set_permissions(original_path, perms).map_err(HopsError::from),
        None => set_permissions(original_path, 0o644),
    };
    if let Err(e) = mode_result {
        warn!(
            "Failed to set permissions on {}: {}",
            original_path.display(),
            e
        );
    }
    Ok(())
}
