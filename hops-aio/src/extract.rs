// hops-aio/src/extract.rs
// Archive detection, root inference and extraction with strip-components.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read, Seek};
use std::path::{Component, Path, PathBuf};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use hops_common::error::{HopsError, Result};
use tar::{Archive, EntryType};
use tracing::{debug, error, warn};
use xz2::read::XzDecoder;
use zip::ZipArchive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Tar,
    TarGz,
    TarBz2,
    TarXz,
    Zip,
}

impl ArchiveKind {
    /// Detects the archive type from the file name, then from its contents.
    /// Returns `None` for anything that is not an archive.
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let by_name = [
            (".tar.gz", Self::TarGz),
            (".tgz", Self::TarGz),
            (".tar.bz2", Self::TarBz2),
            (".tbz", Self::TarBz2),
            (".tbz2", Self::TarBz2),
            (".tar.xz", Self::TarXz),
            (".txz", Self::TarXz),
            (".tar", Self::Tar),
            (".zip", Self::Zip),
        ];
        if let Some((_, kind)) = by_name.iter().find(|(ext, _)| name.ends_with(ext)) {
            return Some(*kind);
        }

        let kind = match infer::get_from_path(path).ok().flatten()?.mime_type() {
            "application/gzip" => Self::TarGz,
            "application/x-bzip2" => Self::TarBz2,
            "application/x-xz" => Self::TarXz,
            "application/x-tar" => Self::Tar,
            "application/zip" => Self::Zip,
            _ => return None,
        };
        debug!("Detected {:?} from contents of {}", kind, path.display());
        Some(kind)
    }

    fn tar_reader(self, file: File) -> Option<Box<dyn Read>> {
        match self {
            Self::Tar => Some(Box::new(file)),
            Self::TarGz => Some(Box::new(GzDecoder::new(file))),
            Self::TarBz2 => Some(Box::new(BzDecoder::new(file))),
            Self::TarXz => Some(Box::new(XzDecoder::new(file))),
            Self::Zip => None,
        }
    }
}

fn open(archive_path: &Path) -> Result<(File, ArchiveKind)> {
    let kind = ArchiveKind::detect(archive_path).ok_or_else(|| {
        HopsError::Generic(format!(
            "Unsupported archive type for {}",
            archive_path.display()
        ))
    })?;
    let file = File::open(archive_path).map_err(|e| {
        HopsError::Io(std::sync::Arc::new(io::Error::new(
            e.kind(),
            format!("Failed to open archive {}: {}", archive_path.display(), e),
        )))
    })?;
    Ok((file, kind))
}

/// The single top-level directory every entry lives under, if there is one.
pub fn infer_archive_root_dir(archive_path: &Path) -> Result<Option<PathBuf>> {
    debug!(
        "Inferring root directory for archive: {}",
        archive_path.display()
    );
    let (file, kind) = open(archive_path)?;
    let paths: Vec<PathBuf> = match kind.tar_reader(file.try_clone()?) {
        Some(reader) => {
            let mut archive = Archive::new(reader);
            let mut paths = Vec::new();
            for entry in archive.entries()? {
                paths.push(entry?.path()?.into_owned());
            }
            paths
        }
        None => {
            let mut archive = open_zip(file, archive_path)?;
            (0..archive.len())
                .map(|i| {
                    archive
                        .by_index_raw(i)
                        .map(|f| PathBuf::from(f.name()))
                        .map_err(|e| zip_error(archive_path, e))
                })
                .collect::<Result<_>>()?
        }
    };
    Ok(single_root(&paths, archive_path))
}

fn single_root(paths: &[PathBuf], archive_path_for_log: &Path) -> Option<PathBuf> {
    let mut unique_roots = HashSet::new();
    for path in paths {
        match path.components().find(|c| *c != Component::CurDir) {
            Some(Component::Normal(name)) => {
                unique_roots.insert(PathBuf::from(name));
            }
            Some(other) => {
                debug!(
                    "Non-standard top-level component ({:?}) in {}, cannot infer single root.",
                    other,
                    archive_path_for_log.display()
                );
                return None;
            }
            None => continue,
        }
        if unique_roots.len() > 1 {
            return None;
        }
    }
    let root = unique_roots.into_iter().next();
    if root.is_none() {
        warn!(
            "Archive {} appears to be empty.",
            archive_path_for_log.display()
        );
    }
    root
}

/// Extracts `archive_path` into `target_dir`, dropping the first
/// `strip_components` path components of every entry.
pub fn extract_archive(
    archive_path: &Path,
    target_dir: &Path,
    strip_components: usize,
) -> Result<()> {
    let (file, kind) = open(archive_path)?;
    debug!(
        "Extracting archive '{}' ({:?}) to '{}' (strip_components={})",
        archive_path.display(),
        kind,
        target_dir.display(),
        strip_components
    );
    fs::create_dir_all(target_dir)?;

    match kind.tar_reader(file.try_clone()?) {
        Some(reader) => extract_tar_archive(reader, target_dir, strip_components, archive_path),
        None => extract_zip_archive(file, target_dir, strip_components, archive_path),
    }
}

pub async fn extract_archive_async(
    archive_path: &Path,
    target_dir: &Path,
    strip_components: usize,
) -> Result<()> {
    let archive_path = archive_path.to_path_buf();
    let target_dir = target_dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        extract_archive(&archive_path, &target_dir, strip_components)
    })
    .await
    .map_err(|e| HopsError::Generic(format!("JoinError in archive extraction: {e}")))?
}

/// Target path of an archive entry after stripping, or `None` when the entry
/// is consumed entirely by the strip.
fn stripped_target(
    original: &Path,
    target_dir: &Path,
    strip_components: usize,
    archive_path_for_log: &Path,
) -> Result<Option<PathBuf>> {
    let stripped: Vec<Component<'_>> = original.components().skip(strip_components).collect();
    if stripped.is_empty() {
        return Ok(None);
    }
    let mut out = target_dir.to_path_buf();
    for comp in stripped {
        match comp {
            Component::Normal(p) => out.push(p),
            Component::CurDir => {}
            _ => {
                error!(
                    "Disallowed component {:?} in path {} within {}",
                    comp,
                    original.display(),
                    archive_path_for_log.display()
                );
                return Err(HopsError::Generic(format!(
                    "Unsafe path component in {} within {}",
                    original.display(),
                    archive_path_for_log.display()
                )));
            }
        }
    }
    if out == target_dir {
        return Ok(None);
    }
    Ok(Some(out))
}

struct DeferredHardLink {
    link: PathBuf,
    target_in_archive: PathBuf,
}

fn extract_tar_archive<R: Read>(
    reader: R,
    target_dir: &Path,
    strip_components: usize,
    archive_path_for_log: &Path,
) -> Result<()> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let mut deferred_hardlinks = Vec::new();
    for entry_result in archive.entries()? {
        let mut entry = entry_result.map_err(|e| {
            HopsError::Generic(format!(
                "Error reading TAR entry from {}: {}",
                archive_path_for_log.display(),
                e
            ))
        })?;
        let original = entry.path()?.into_owned();
        let Some(target) =
            stripped_target(&original, target_dir, strip_components, archive_path_for_log)?
        else {
            continue;
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        if entry.header().entry_type() == EntryType::Link {
            if let Some(link_name) = entry.link_name()? {
                deferred_hardlinks.push(DeferredHardLink {
                    link: target,
                    target_in_archive: link_name.into_owned(),
                });
            }
            continue;
        }

        entry.unpack(&target).map_err(|e| {
            HopsError::Generic(format!(
                "Failed to unpack {} from {}: {}",
                original.display(),
                archive_path_for_log.display(),
                e
            ))
        })?;
    }

    for deferred in deferred_hardlinks {
        let Some(source) = stripped_target(
            &deferred.target_in_archive,
            target_dir,
            strip_components,
            archive_path_for_log,
        )?
        else {
            warn!(
                "Hardlink target {} stripped away, skipping {}",
                deferred.target_in_archive.display(),
                deferred.link.display()
            );
            continue;
        };
        crate::fs::remove_path(&deferred.link)?;
        if fs::hard_link(&source, &deferred.link).is_err() {
            fs::copy(&source, &deferred.link)?;
        }
    }

    debug!(
        "Finished TAR extraction for {}",
        archive_path_for_log.display()
    );
    Ok(())
}

fn zip_error(archive_path: &Path, e: zip::result::ZipError) -> HopsError {
    HopsError::Generic(format!("ZIP error in {}: {}", archive_path.display(), e))
}

fn open_zip<R: Read + Seek>(reader: R, archive_path: &Path) -> Result<ZipArchive<R>> {
    ZipArchive::new(reader).map_err(|e| zip_error(archive_path, e))
}

fn extract_zip_archive<R: Read + Seek>(
    reader: R,
    target_dir: &Path,
    strip_components: usize,
    archive_path_for_log: &Path,
) -> Result<()> {
    let mut archive = open_zip(reader, archive_path_for_log)?;
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| zip_error(archive_path_for_log, e))?;
        let Some(original) = file.enclosed_name() else {
            return Err(HopsError::Generic(format!(
                "Unsafe ZIP entry path '{}' in {}",
                file.name(),
                archive_path_for_log.display()
            )));
        };
        let Some(target) =
            stripped_target(&original, target_dir, strip_components, archive_path_for_log)?
        else {
            continue;
        };

        if file.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&target)?;
        io::copy(&mut file, &mut outfile)?;
        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            crate::fs::set_permissions(&target, mode & 0o7777)?;
        }
    }
    Ok(())
}
