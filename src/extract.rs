//! Source unpacking.
//!
//! Fetched sources are unpacked into a formula's scoped build directory:
//!
//! ```text
//! Input:  librm--2.1.1--librm-v2.1.1.tar.gz
//!   librm-v2.1.1/
//!     meson.build
//!     src/
//! Source root: <build dir>/librm-v2.1.1/
//! ```
//!
//! Gzip-compressed (`.tar.gz`, `.tgz`) and plain `.tar` archives are
//! extracted. Any other file is copied into the directory as-is. When an
//! archive holds exactly one top-level directory, that directory becomes the
//! source root.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::Archive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    TarGz,
    Tar,
    Plain,
}

impl SourceKind {
    pub fn detect(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            SourceKind::TarGz
        } else if name.ends_with(".tar") {
            SourceKind::Tar
        } else {
            SourceKind::Plain
        }
    }
}

/// Unpack `source` into `dest` and return the source root.
///
/// `file_name` names the copy for plain sources (cached files carry a
/// `<name>--<version>--` prefix that the build should not see).
pub fn unpack_source(source: &Path, file_name: &str, dest: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create directory: {}", dest.display()))?;

    match SourceKind::detect(Path::new(file_name)) {
        SourceKind::TarGz => {
            let file = fs::File::open(source)
                .with_context(|| format!("Failed to open source: {}", source.display()))?;
            unpack_archive(GzDecoder::new(file), source, dest)?;
        }
        SourceKind::Tar => {
            let file = fs::File::open(source)
                .with_context(|| format!("Failed to open source: {}", source.display()))?;
            unpack_archive(file, source, dest)?;
        }
        SourceKind::Plain => {
            let target = dest.join(file_name);
            fs::copy(source, &target).with_context(|| {
                format!("Failed to copy {} to {}", source.display(), target.display())
            })?;
            return Ok(dest.to_path_buf());
        }
    }

    Ok(source_root(dest)?)
}

fn unpack_archive<R: Read>(reader: R, source: &Path, dest: &Path) -> Result<()> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive
        .unpack(dest)
        .with_context(|| format!("Failed to extract {} to {}", source.display(), dest.display()))
}

/// The single top-level directory of `dir`, or `dir` itself.
fn source_root(dir: &Path) -> std::io::Result<PathBuf> {
    let entries: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();

    match entries.as_slice() {
        [only] if only.is_dir() => Ok(only.clone()),
        _ => Ok(dir.to_path_buf()),
    }
}
