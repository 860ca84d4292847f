//! External command execution.
//!
//! Build tools (meson, ninja, make, ...) are opaque subprocesses. The pipeline
//! never spawns them directly: it hands a [`CommandSpec`] to a
//! [`CommandRunner`], which lets tests substitute a recording double for the
//! real [`SystemRunner`].

use crate::placeholder::{PlaceholderError, Scope};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// One fully expanded command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Variables set on top of the inherited environment.
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    /// Expand placeholders in `argv` and split off the program.
    pub fn expand(
        argv: &[String],
        scope: &Scope,
        cwd: &Path,
        env: BTreeMap<String, String>,
    ) -> Result<Self, PlaceholderError> {
        let mut expanded = argv
            .iter()
            .map(|arg| scope.expand(arg))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter();

        Ok(Self {
            program: expanded.next().unwrap_or_default(),
            args: expanded.collect(),
            cwd: cwd.to_path_buf(),
            env,
        })
    }

    /// Shell-like rendering for messages.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(|part| {
                if part.is_empty() || part.contains(char::is_whitespace) {
                    format!("'{part}'")
                } else {
                    part.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success() -> Self {
        Self {
            status: Some(0),
            ..Self::default()
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs external commands. Implementations must be usable from several
/// worker threads at once.
pub trait CommandRunner: Send + Sync {
    /// Run to completion. `Err` means the command could not be started at all.
    fn run(&self, spec: &CommandSpec) -> io::Result<CommandOutput>;
}

/// Spawns real processes with captured output and a closed stdin.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> io::Result<CommandOutput> {
        debug!(command = %spec.display(), cwd = %spec.cwd.display(), "spawning process");

        let output = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .output()?;

        let result = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.is_success() && !result.stderr.is_empty() {
            debug!(stderr = %result.stderr, "command stderr");
        }
        Ok(result)
    }
}

/// Variables every step sees so tools find what earlier formulae installed.
pub fn base_environment(root: &Path) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();

    let bin = root.join("bin").display().to_string();
    let path = match std::env::var("PATH") {
        Ok(existing) if !existing.is_empty() => format!("{bin}:{existing}"),
        _ => bin,
    };
    env.insert("PATH".to_string(), path);

    let mut pkg_config = format!(
        "{}:{}",
        root.join("lib/pkgconfig").display(),
        root.join("share/pkgconfig").display()
    );
    if let Ok(existing) = std::env::var("PKG_CONFIG_PATH")
        && !existing.is_empty()
    {
        pkg_config = format!("{pkg_config}:{existing}");
    }
    env.insert("PKG_CONFIG_PATH".to_string(), pkg_config);

    env.insert("KEG_PREFIX".to_string(), root.display().to_string());
    env
}
