//! Result collection: image discovery and workspace archiving.

use crate::error::ArchiveError;
use std::fs::File;
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Name of the archive written into the workspace.
pub(crate) const ARCHIVE_NAME: &str = "outputs.zip";

/// Extensions (lowercase) treated as result images.
pub(crate) const IMAGE_EXTS: [&str; 5] = ["png", "jpg", "jpeg", "tif", "tiff"];

/// Entries above this size need zip64 headers.
const ZIP32_LIMIT: u64 = 0xFFFF_FFFF;

#[derive(Debug)]
pub(crate) struct Collection {
    /// Image files at the workspace top level, sorted by path.
    pub images: Vec<PathBuf>,
    pub archive: Result<PathBuf, ArchiveError>,
}

struct Entry {
    path: PathBuf,
    name: String,
    is_dir: bool,
    len: u64,
}

pub(crate) fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Collect images and build the archive on the blocking pool.
pub(crate) async fn collect(dir: &Path) -> Collection {
    let owned = dir.to_path_buf();
    match tokio::task::spawn_blocking(move || collect_blocking(&owned)).await {
        Ok(c) => c,
        Err(e) => Collection {
            images: Vec::new(),
            archive: Err(ArchiveError::Write {
                path: dir.join(ARCHIVE_NAME),
                source: std::io::Error::other(e),
            }),
        },
    }
}

pub(crate) fn collect_blocking(dir: &Path) -> Collection {
    let entries = match list_entries(dir) {
        Ok(entries) => entries,
        Err(source) => {
            return Collection {
                images: Vec::new(),
                archive: Err(ArchiveError::ReadDir {
                    path: dir.to_path_buf(),
                    source,
                }),
            }
        }
    };

    let images = entries
        .iter()
        .filter(|e| !e.is_dir && is_image(&e.path))
        .map(|e| e.path.clone())
        .collect();

    let archive_path = dir.join(ARCHIVE_NAME);
    let archive = match write_archive(&archive_path, &entries) {
        Ok(()) => Ok(archive_path),
        Err(e) => {
            // Never leave a truncated archive behind.
            let _ = std::fs::remove_file(&archive_path);
            Err(e)
        }
    };

    Collection { images, archive }
}

/// Top-level listing sorted by path, without the archive itself.
///
/// Symlinks are resolved; a dangling link or an entry that cannot be
/// inspected is skipped with a warning instead of failing the listing.
fn list_entries(dir: &Path) -> std::io::Result<Vec<Entry>> {
    let mut entries = Vec::new();
    for item in std::fs::read_dir(dir)? {
        let item = match item {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };
        let name = item.file_name().to_string_lossy().into_owned();
        if name == ARCHIVE_NAME {
            continue;
        }
        let path = item.path();
        let meta = match item.file_type() {
            Ok(ft) if ft.is_symlink() => std::fs::metadata(&path),
            Ok(_) => item.metadata(),
            Err(e) => Err(e),
        };
        let meta = match meta {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping entry");
                continue;
            }
        };
        entries.push(Entry {
            path,
            name,
            is_dir: meta.is_dir(),
            len: meta.len(),
        });
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

fn write_archive(archive_path: &Path, entries: &[Entry]) -> Result<(), ArchiveError> {
    let write_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| ArchiveError::Write { path, source }
    };
    let zip_err = |source: zip::result::ZipError| ArchiveError::Zip {
        path: archive_path.to_path_buf(),
        source,
    };

    let file = File::create(archive_path).map_err(write_err(archive_path))?;
    let mut zip = ZipWriter::new(file);
    let opts = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in entries {
        if entry.is_dir {
            zip.add_directory(entry.name.clone(), opts)
                .map_err(zip_err)?;
            continue;
        }
        zip.start_file(entry.name.clone(), opts.large_file(entry.len >= ZIP32_LIMIT))
            .map_err(zip_err)?;
        let mut src = File::open(&entry.path).map_err(write_err(&entry.path))?;
        std::io::copy(&mut src, &mut zip).map_err(write_err(archive_path))?;
    }
    zip.finish().map_err(zip_err)?;
    Ok(())
}
