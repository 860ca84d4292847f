//! Symlink management for installed kegs.
//!
//! Linking exposes a keg's `bin`, `lib`, ... under the prefix through
//! relative symlinks and points `opt/<name>` at the keg. Links are relative
//! so a prefix can be moved as a whole.

use crate::cellar::Layout;
use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs as unix_fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Keg directories mirrored into the prefix.
pub const LINKABLE_DIRS: &[&str] = &["bin", "sbin", "lib", "include", "share", "etc"];

/// Link every file of a keg into the prefix. Returns the links created.
///
/// Existing links to the same file are left alone; paths owned by something
/// else are skipped with a warning.
pub fn link_keg(layout: &Layout, name: &str, version: &str) -> Result<Vec<PathBuf>> {
    let keg = layout.keg(name, version);
    let mut linked_files = Vec::new();

    for dir_name in LINKABLE_DIRS {
        let source_dir = keg.join(dir_name);
        if !source_dir.is_dir() {
            continue;
        }

        let target_dir = layout.root().join(dir_name);
        fs::create_dir_all(&target_dir)
            .with_context(|| format!("Failed to create directory: {}", target_dir.display()))?;

        link_directory(&source_dir, &target_dir, &mut linked_files)?;
    }

    debug!(formula = name, links = linked_files.len(), "linked keg");
    Ok(linked_files)
}

fn link_directory(source: &Path, target: &Path, linked_files: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries = fs::read_dir(source)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let source_path = entry.path();
        let target_path = target.join(entry.file_name());

        // Real directories are merged; symlinked directories are linked as files
        if source_path.is_dir() && !source_path.is_symlink() {
            if target_path.is_symlink() {
                warn!(path = %target_path.display(), "not replacing symlink with directory");
                continue;
            }
            fs::create_dir_all(&target_path)?;
            link_directory(&source_path, &target_path, linked_files)?;
        } else if create_relative_symlink(&source_path, &target_path)? {
            linked_files.push(target_path);
        }
    }

    Ok(())
}

/// Returns `true` when a new link was created.
fn create_relative_symlink(source: &Path, target: &Path) -> Result<bool> {
    let parent = target.parent().unwrap_or(Path::new("/"));
    let relative_source = relative_path(parent, source);

    if target.symlink_metadata().is_ok() {
        match fs::read_link(target) {
            Ok(existing) if existing == relative_source => {}
            _ => warn!(path = %target.display(), "path exists, not linking"),
        }
        return Ok(false);
    }

    unix_fs::symlink(&relative_source, target).with_context(|| {
        format!(
            "Failed to create symlink: {} -> {}",
            target.display(),
            relative_source.display()
        )
    })?;

    Ok(true)
}

/// Point `opt/<name>` at the keg, replacing a link to another version.
pub fn link_opt(layout: &Layout, name: &str, version: &str) -> Result<PathBuf> {
    let opt = layout.opt(name);
    let opt_dir = opt.parent().unwrap_or(layout.root());
    fs::create_dir_all(opt_dir)
        .with_context(|| format!("Failed to create directory: {}", opt_dir.display()))?;

    let relative_keg = relative_path(opt_dir, &layout.keg(name, version));
    if let Ok(existing) = fs::read_link(&opt) {
        if existing == relative_keg {
            return Ok(opt);
        }
        fs::remove_file(&opt)
            .with_context(|| format!("Failed to remove stale link: {}", opt.display()))?;
    }

    unix_fs::symlink(&relative_keg, &opt)
        .with_context(|| format!("Failed to create symlink: {}", opt.display()))?;
    Ok(opt)
}

/// Version `opt/<name>` points at, if it is linked.
pub fn opt_version(layout: &Layout, name: &str) -> Option<String> {
    let target = fs::read_link(layout.opt(name)).ok()?;
    target.file_name().map(|v| v.to_string_lossy().into_owned())
}

/// Remove every prefix link (including `opt/<name>`) that points into the keg.
pub fn unlink_keg(layout: &Layout, name: &str, version: &str) -> Result<Vec<PathBuf>> {
    let keg = layout.keg(name, version);
    let mut unlinked_files = Vec::new();

    for dir_name in LINKABLE_DIRS {
        let source_dir = keg.join(dir_name);
        let target_dir = layout.root().join(dir_name);

        if !source_dir.is_dir() || !target_dir.is_dir() {
            continue;
        }

        unlink_directory(&source_dir, &target_dir, &keg, &mut unlinked_files)?;
    }

    let opt = layout.opt(name);
    if points_into(&opt, &keg) {
        fs::remove_file(&opt)?;
        unlinked_files.push(opt);
    }

    Ok(unlinked_files)
}

fn unlink_directory(
    source: &Path,
    target: &Path,
    keg: &Path,
    unlinked_files: &mut Vec<PathBuf>,
) -> Result<()> {
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let source_path = entry.path();
        let target_path = target.join(entry.file_name());

        if source_path.is_dir() && !source_path.is_symlink() {
            if target_path.is_dir() && !target_path.is_symlink() {
                unlink_directory(&source_path, &target_path, keg, unlinked_files)?;
            }
        } else if points_into(&target_path, keg) {
            fs::remove_file(&target_path)?;
            unlinked_files.push(target_path);
        }
    }

    Ok(())
}

/// Whether `link` is a symlink resolving (lexically) to a path inside `dir`.
fn points_into(link: &Path, dir: &Path) -> bool {
    let Ok(link_target) = fs::read_link(link) else {
        return false;
    };
    let resolved = if link_target.is_relative() {
        link.parent().unwrap_or(Path::new("/")).join(&link_target)
    } else {
        link_target
    };
    normalize_path(&resolved).starts_with(normalize_path(dir))
}

/// Relative path leading from directory `from` to `to`. Both must be absolute
/// or both relative to the same base.
pub fn relative_path(from: &Path, to: &Path) -> PathBuf {
    let from = normalize_path(from);
    let to = normalize_path(to);

    let from_parts: Vec<Component> = from.components().collect();
    let to_parts: Vec<Component> = to.components().collect();
    let common = from_parts
        .iter()
        .zip(&to_parts)
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..from_parts.len() {
        relative.push("..");
    }
    for part in &to_parts[common..] {
        relative.push(part);
    }
    if relative.as_os_str().is_empty() {
        relative.push(".");
    }
    relative
}

/// Lexically normalize a path, resolving `.` and `..` without touching the
/// filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(components.last(), Some(Component::Normal(_))) {
                    components.pop();
                } else if !matches!(components.last(), Some(Component::RootDir)) {
                    components.push(component);
                }
            }
            _ => components.push(component),
        }
    }

    components.iter().collect()
}

/// Symlink every file matching `pattern` into directory `into`, keeping file
/// names. Used by `symlink` build steps. Returns the links created.
pub fn symlink_matches(pattern: &str, into: &Path) -> Result<Vec<PathBuf>> {
    let matches = glob::glob(pattern)
        .with_context(|| format!("Invalid glob pattern: {pattern}"))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to expand {pattern}"))?;

    if matches.is_empty() {
        warn!(pattern, "symlink pattern matched nothing");
        return Ok(vec![]);
    }

    fs::create_dir_all(into)
        .with_context(|| format!("Failed to create directory: {}", into.display()))?;

    let mut links = Vec::new();
    for source in matches {
        let Some(file_name) = source.file_name() else {
            continue;
        };
        let target = into.join(file_name);
        if create_relative_symlink(&source, &target)? {
            links.push(target);
        }
    }
    Ok(links)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path() {
        assert_eq!(
            relative_path(Path::new("/opt/keg/bin"), Path::new("/opt/keg/Cellar/a/1/bin/a")),
            PathBuf::from("../Cellar/a/1/bin/a")
        );
        assert_eq!(
            relative_path(
                Path::new("/opt/keg/share/man/man1"),
                Path::new("/opt/keg/Cellar/a/1/share/man/man1/a.1")
            ),
            PathBuf::from("../../../Cellar/a/1/share/man/man1/a.1")
        );
        assert_eq!(
            relative_path(Path::new("/k/lib"), Path::new("/k/lib/rm/librm.so")),
            PathBuf::from("rm/librm.so")
        );
        assert_eq!(relative_path(Path::new("/k"), Path::new("/k")), PathBuf::from("."));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path(Path::new("/opt/keg/bin/../Cellar/./a")),
            PathBuf::from("/opt/keg/Cellar/a")
        );
        assert_eq!(normalize_path(Path::new("/../a")), PathBuf::from("/a"));
        assert_eq!(normalize_path(Path::new("../a")), PathBuf::from("../a"));
    }
}
