// Test helpers for isolated pipeline testing
// Everything lives under one temporary directory; nothing touches the system
#![allow(dead_code)]

use flate2::Compression;
use flate2::write::GzEncoder;
use kegworks::cellar::Layout;
use kegworks::pipeline::{Pipeline, PipelineOptions};
use kegworks::registry::FormulaRegistry;
use kegworks::runner::{CommandOutput, CommandRunner, CommandSpec};
use kegworks::verify::sha256_file;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Isolated test environment using temporary directories
/// Automatically cleaned up when dropped
///
/// - temp/
///   - prefix/    (install root with Cellar/, opt/, bin/, ...)
///   - cache/     (download cache)
///   - Formula/   (formula files)
///   - sources/   (source tarballs referenced by file:// URLs)
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub prefix: PathBuf,
    pub cache: PathBuf,
    pub formula_dir: PathBuf,
    pub sources: PathBuf,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let root = temp_dir.path().to_path_buf();
        let prefix = root.join("prefix");
        let cache = root.join("cache");
        let formula_dir = root.join("Formula");
        let sources = root.join("sources");

        for dir in [&prefix, &cache, &formula_dir, &sources] {
            fs::create_dir_all(dir).unwrap();
        }

        Self {
            temp_dir,
            prefix,
            cache,
            formula_dir,
            sources,
        }
    }

    /// Write `<name>-<version>.tar.gz` with a single top-level directory.
    /// Returns the archive path and its sha256.
    pub fn write_source(
        &self,
        name: &str,
        version: &str,
        files: &[(&str, &str)],
    ) -> (PathBuf, String) {
        let path = self.sources.join(format!("{name}-{version}.tar.gz"));
        let file = fs::File::create(&path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

        for (rel, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, format!("{name}-{version}/{rel}"), contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();

        let sha = sha256_file(&path).unwrap();
        (path, sha)
    }

    /// Write a formula whose source is a freshly built tarball.
    /// `steps` is appended verbatim after the header and dependency table.
    pub fn add_formula(&self, name: &str, runtime: &[&str], steps: &str) -> PathBuf {
        let (source, sha) = self.write_source(name, "1.0", &[("configure", "#!/bin/sh\n")]);
        self.add_formula_with_source(name, runtime, steps, &source, &sha)
    }

    /// Like [`add_formula`](Self::add_formula) at a given version, replacing
    /// any earlier file for the same formula.
    pub fn add_formula_version(&self, name: &str, version: &str, steps: &str) -> PathBuf {
        let (source, sha) = self.write_source(name, version, &[("configure", "#!/bin/sh\n")]);
        self.write_formula(name, version, &[], steps, &source, &sha)
    }

    pub fn add_formula_with_source(
        &self,
        name: &str,
        runtime: &[&str],
        steps: &str,
        source: &Path,
        sha256: &str,
    ) -> PathBuf {
        self.write_formula(name, "1.0", runtime, steps, source, sha256)
    }

    fn write_formula(
        &self,
        name: &str,
        version: &str,
        runtime: &[&str],
        steps: &str,
        source: &Path,
        sha256: &str,
    ) -> PathBuf {
        let runtime = runtime
            .iter()
            .map(|d| format!("\"{d}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let contents = format!(
            r#"name = "{name}"
version = "{version}"
url = "file://{}"
sha256 = "{sha256}"

[dependencies]
runtime = [{runtime}]

{steps}
"#,
            source.display()
        );

        let path = self.formula_dir.join(format!("{name}.toml"));
        fs::write(&path, contents).unwrap();
        path
    }

    pub fn registry(&self) -> FormulaRegistry {
        FormulaRegistry::load_dirs(&[&self.formula_dir]).unwrap()
    }

    pub fn layout(&self) -> Layout {
        Layout::new(&self.prefix)
    }

    pub fn pipeline(&self, runner: Arc<dyn CommandRunner>, jobs: usize) -> Pipeline {
        let options = PipelineOptions {
            jobs,
            force: false,
            cache_dir: self.cache.clone(),
            show_progress: false,
        };
        Pipeline::new(self.layout(), runner, options)
    }

    /// Every path under the prefix, relative to it.
    pub fn prefix_entries(&self) -> Vec<PathBuf> {
        let mut entries: Vec<PathBuf> = walkdir::WalkDir::new(&self.prefix)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.path().strip_prefix(&self.prefix).unwrap().to_path_buf())
            .collect();
        entries.sort();
        entries
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

type Predicate = Box<dyn Fn(&CommandSpec) -> bool + Send + Sync>;

/// Records every command instead of running it.
///
/// - `touch <path>` creates the file, so steps can populate a keg
/// - commands matching the failure predicate exit 1 with "boom" on stderr
/// - every command sleeps for `delay`, tracking peak concurrency
pub struct ScriptedRunner {
    calls: Mutex<Vec<CommandSpec>>,
    fail_when: Predicate,
    on_run: Option<Box<dyn Fn(&CommandSpec) + Send + Sync>>,
    delay: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_when: Box::new(|_| false),
            on_run: None,
            delay: Duration::ZERO,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn failing(predicate: impl Fn(&CommandSpec) -> bool + Send + Sync + 'static) -> Self {
        Self {
            fail_when: Box::new(predicate),
            ..Self::new()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn on_run(mut self, hook: impl Fn(&CommandSpec) + Send + Sync + 'static) -> Self {
        self.on_run = Some(Box::new(hook));
        self
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Rendered commands in the order they ran.
    pub fn commands(&self) -> Vec<String> {
        self.calls().iter().map(CommandSpec::display).collect()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: &CommandSpec) -> io::Result<CommandOutput> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        self.calls.lock().unwrap().push(spec.clone());

        if let Some(hook) = &self.on_run {
            hook(spec);
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let output = if (self.fail_when)(spec) {
            CommandOutput::failure(1, "boom")
        } else {
            if spec.program == "touch" {
                for arg in &spec.args {
                    let path = Path::new(arg);
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(path, "")?;
                }
            }
            CommandOutput::success()
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new();

        assert!(env.prefix.exists());
        assert!(env.cache.exists());
        assert!(env.formula_dir.exists());
        assert!(env.prefix_entries().is_empty());
    }

    #[test]
    fn test_environment_cleanup() {
        let prefix = {
            let env = TestEnvironment::new();
            env.prefix.clone()
        };

        assert!(!prefix.exists());
    }

    #[test]
    fn test_formula_files_load() {
        let env = TestEnvironment::new();
        env.add_formula("zlib", &[], "[[install]]\nrun = [\"make\"]");
        env.add_formula("libpng", &["zlib"], "[[install]]\nrun = [\"make\"]");

        let registry = env.registry();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("libpng").unwrap().runtime_dependencies, vec!["zlib"]);
    }
}
