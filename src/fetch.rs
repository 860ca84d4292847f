//! Source fetching with a download cache and progress bars.
//!
//! Sources are fetched before anything is built. `http(s)://` URLs are
//! downloaded with reqwest; `file://` URLs and plain paths are copied (a
//! relative path is taken relative to the formula file). Everything lands in
//! the download cache as `<name>--<version>--<file>`; a cached copy is reused
//! only while it still matches the declared checksum.

use crate::error::{KegError, Result};
use crate::formula::Formula;
use crate::verify;
use futures::future::join_all;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// `$XDG_CACHE_HOME/keg/downloads`, falling back to `~/.cache/keg/downloads`.
pub fn default_cache_dir() -> PathBuf {
    if let Some(cache_home) = std::env::var_os("XDG_CACHE_HOME") {
        PathBuf::from(cache_home).join("keg/downloads")
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".cache/keg/downloads")
    } else {
        PathBuf::from(".cache/keg/downloads")
    }
}

/// Download target for `path`; renamed into place once complete.
fn partial_path(path: &Path) -> PathBuf {
    let mut partial = path.as_os_str().to_owned();
    partial.push(".part");
    PathBuf::from(partial)
}

pub fn cached_path(cache: &Path, formula: &Formula) -> PathBuf {
    cache.join(format!(
        "{}--{}--{}",
        formula.name,
        formula.version,
        formula.source_filename()
    ))
}

enum Source {
    Remote(Url),
    Local(PathBuf),
}

fn classify(formula: &Formula) -> Result<Source> {
    let fetch_err = |message: String| KegError::Fetch {
        formula: formula.name.clone(),
        url: formula.url.clone(),
        message,
    };

    if !formula.url.contains("://") {
        let path = PathBuf::from(&formula.url);
        let path = match formula.path.as_ref().and_then(|p| p.parent()) {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path,
        };
        return Ok(Source::Local(path));
    }

    let url = Url::parse(&formula.url).map_err(|e| fetch_err(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(Source::Remote(url)),
        "file" => url
            .to_file_path()
            .map(Source::Local)
            .map_err(|_| fetch_err("not a valid file URL".into())),
        other => Err(fetch_err(format!("unsupported URL scheme '{other}'"))),
    }
}

/// Fetch one formula's source into the cache and return its path.
pub async fn fetch_source(
    client: &reqwest::Client,
    formula: &Formula,
    cache: &Path,
    progress: Option<&MultiProgress>,
) -> Result<PathBuf> {
    let output_path = cached_path(cache, formula);

    if output_path.is_file() {
        let cached = output_path.clone();
        let expected = formula.sha256.clone();
        let fresh = tokio::task::spawn_blocking(move || {
            verify::sha256_file(&cached).map(|actual| verify::checksums_match(&expected, &actual))
        })
        .await
        .map_err(|e| KegError::Other(e.into()))??;

        if fresh {
            debug!(formula = %formula.name, path = %output_path.display(), "using cached source");
            return Ok(output_path);
        }
        fs::remove_file(&output_path).await?;
    }

    fs::create_dir_all(cache).await?;
    let partial = partial_path(&output_path);

    match classify(formula)? {
        Source::Local(path) => {
            debug!(formula = %formula.name, path = %path.display(), "copying local source");
            fs::copy(&path, &partial)
                .await
                .map_err(|e| KegError::Fetch {
                    formula: formula.name.clone(),
                    url: formula.url.clone(),
                    message: format!("{}: {e}", path.display()),
                })?;
        }
        Source::Remote(url) => {
            download(client, formula, url, &partial, progress).await?;
        }
    }

    fs::rename(&partial, &output_path).await?;
    Ok(output_path)
}

async fn download(
    client: &reqwest::Client,
    formula: &Formula,
    url: Url,
    output: &Path,
    progress: Option<&MultiProgress>,
) -> Result<()> {
    let fetch_err = |message: String| KegError::Fetch {
        formula: formula.name.clone(),
        url: formula.url.clone(),
        message,
    };

    let pb = if let Some(mp) = progress {
        let pb = mp.add(ProgressBar::new(0));
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
                )
                .map_err(|e| KegError::Other(e.into()))?
                .progress_chars("#>-"),
        );
        pb.set_message(format!("⬇ {}", formula.name));
        Some(pb)
    } else {
        None
    };

    let mut response = client
        .get(url)
        .send()
        .await
        .map_err(|e| fetch_err(e.to_string()))?;

    if !response.status().is_success() {
        if let Some(pb) = &pb {
            pb.abandon_with_message(format!("✗ {}", formula.name));
        }
        return Err(fetch_err(format!("HTTP {}", response.status())));
    }

    if let Some(pb) = &pb
        && let Some(total) = response.content_length()
    {
        pb.set_length(total);
    }

    let mut file = fs::File::create(output).await?;
    let mut downloaded: u64 = 0;

    while let Some(chunk) = response.chunk().await.map_err(|e| fetch_err(e.to_string()))? {
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
        if let Some(pb) = &pb {
            pb.set_position(downloaded);
        }
    }

    file.flush().await?;

    if let Some(pb) = &pb {
        pb.finish_with_message(format!("✓ {}", formula.name));
    }
    Ok(())
}

/// Fetch many sources concurrently.
///
/// Every fetch runs to completion; the first failure in input order is
/// returned.
pub async fn fetch_all(
    formulae: &[Arc<Formula>],
    cache: &Path,
    show_progress: bool,
) -> Result<Vec<(Arc<Formula>, PathBuf)>> {
    if formulae.is_empty() {
        return Ok(vec![]);
    }

    let client = reqwest::Client::new();
    let mp = show_progress.then(MultiProgress::new);

    let results = join_all(
        formulae
            .iter()
            .map(|formula| fetch_source(&client, formula, cache, mp.as_ref())),
    )
    .await;

    let mut fetched = Vec::with_capacity(formulae.len());
    for (formula, result) in formulae.iter().zip(results) {
        fetched.push((formula.clone(), result?));
    }

    info!(count = fetched.len(), "fetched sources");
    Ok(fetched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::BuildStep;
    use tempfile::TempDir;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn local_formula(url: String, sha256: &str) -> Formula {
        Formula {
            name: "capi20".into(),
            version: "3.2.1".into(),
            desc: None,
            homepage: None,
            url,
            sha256: sha256.into(),
            build_dependencies: vec![],
            runtime_dependencies: vec![],
            install: vec![BuildStep::run(["true"])],
            post_install: vec![],
            test: None,
            path: None,
        }
    }

    #[tokio::test]
    async fn test_fetch_file_url_into_cache() {
        let src = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let archive = src.path().join("capi20.tar.gz");
        std::fs::write(&archive, b"").unwrap();

        let formula = local_formula(format!("file://{}", archive.display()), EMPTY_SHA256);
        let client = reqwest::Client::new();
        let path = fetch_source(&client, &formula, cache.path(), None)
            .await
            .unwrap();

        assert_eq!(path, cache.path().join("capi20--3.2.1--capi20.tar.gz"));
        assert!(path.is_file());
        assert_eq!(std::fs::read_dir(cache.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_partial_path_keeps_version() {
        let cache = Path::new("/cache");
        let a = partial_path(&cache.join("foo--1.0--foo-1.0"));
        let b = partial_path(&cache.join("foo--1.0--foo-1.1"));
        assert_eq!(a, cache.join("foo--1.0--foo-1.0.part"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_relative_path_resolved_against_formula_file() {
        let dir = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        std::fs::write(dir.path().join("capi20.tar.gz"), b"").unwrap();

        let mut formula = local_formula("capi20.tar.gz".into(), EMPTY_SHA256);
        formula.path = Some(dir.path().join("capi20.toml"));

        let fetched = fetch_all(&[Arc::new(formula)], cache.path(), false)
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);
        assert!(fetched[0].1.is_file());
    }

    #[tokio::test]
    async fn test_stale_cache_entry_replaced() {
        let src = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let archive = src.path().join("capi20.tar.gz");
        std::fs::write(&archive, b"").unwrap();

        let formula = local_formula(archive.display().to_string(), EMPTY_SHA256);
        let cached = cached_path(cache.path(), &formula);
        std::fs::write(&cached, b"stale").unwrap();

        let client = reqwest::Client::new();
        fetch_source(&client, &formula, cache.path(), None)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&cached).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_missing_local_source() {
        let cache = TempDir::new().unwrap();
        let formula = local_formula("/nonexistent/keg/capi20.tar.gz".into(), EMPTY_SHA256);
        let client = reqwest::Client::new();
        let err = fetch_source(&client, &formula, cache.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, KegError::Fetch { ref formula, .. } if formula == "capi20"));
    }

    #[test]
    fn test_unsupported_scheme() {
        let formula = local_formula("ftp://example.com/capi20.tar.gz".into(), EMPTY_SHA256);
        assert!(matches!(classify(&formula), Err(KegError::Fetch { .. })));
    }
}
