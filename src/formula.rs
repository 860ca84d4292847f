//! Formula records and their on-disk format.
//!
//! A formula describes how to fetch, build and install one package. Formulae
//! are plain data loaded from TOML (or JSON) files; nothing in a formula file
//! is executed at load time.
//!
//! ```toml
//! name = "capi20"
//! version = "3.2.1"
//! url = "https://gitlab.com/tabos/libcapi/-/archive/v3.2.1/libcapi-v3.2.1.tar.gz"
//! sha256 = "5c18c765d9d6b1c13c9737e05313aec636106f18666eab4606358de3e1d42cc8"
//!
//! [dependencies]
//! build = ["meson", "ninja", "pkg-config"]
//!
//! [[install]]
//! run = ["meson", "--prefix={prefix}", "-Denable-post-install=false", ".."]
//! cwd = "build"
//!
//! [[install]]
//! run = ["ninja", "install"]
//! cwd = "build"
//! ```
//!
//! Loaded formulae are immutable and shared as `Arc<Formula>` by the registry.

use crate::error::ConfigError;
use crate::placeholder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    Build,
    Runtime,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyKind::Build => write!(f, "build"),
            DependencyKind::Runtime => write!(f, "runtime"),
        }
    }
}

/// `formula` depends on `depends_on`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DependencyEdge {
    pub formula: String,
    pub depends_on: String,
    pub kind: DependencyKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Run an external command; `argv[0]` is the program.
    Run { argv: Vec<String> },
    /// Symlink every file matching `pattern` into the `into` directory.
    Symlink { pattern: String, into: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStep {
    pub action: StepAction,
    /// Relative to the unpacked source root.
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl BuildStep {
    pub fn run<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            action: StepAction::Run {
                argv: argv.into_iter().map(Into::into).collect(),
            },
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    pub fn symlink(pattern: impl Into<String>, into: impl Into<String>) -> Self {
        Self {
            action: StepAction::Symlink {
                pattern: pattern.into(),
                into: into.into(),
            },
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    pub fn in_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Unexpanded one-line rendering used in messages.
    pub fn describe(&self) -> String {
        match &self.action {
            StepAction::Run { argv } => argv.join(" "),
            StepAction::Symlink { pattern, into } => format!("symlink {pattern} -> {into}"),
        }
    }

    fn arguments(&self) -> Vec<&str> {
        let mut args: Vec<&str> = match &self.action {
            StepAction::Run { argv } => argv.iter().map(String::as_str).collect(),
            StepAction::Symlink { pattern, into } => vec![pattern.as_str(), into.as_str()],
        };
        args.extend(self.env.values().map(String::as_str));
        args
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formula {
    pub name: String,
    pub version: String,
    pub desc: Option<String>,
    pub homepage: Option<String>,
    pub url: String,
    /// Lowercase hex SHA-256 of the source.
    pub sha256: String,
    pub build_dependencies: Vec<String>,
    pub runtime_dependencies: Vec<String>,
    pub install: Vec<BuildStep>,
    pub post_install: Vec<BuildStep>,
    pub test: Option<BuildStep>,
    /// File the formula was loaded from.
    pub path: Option<PathBuf>,
}

impl Formula {
    /// Load a formula file, choosing the format by extension (`.toml` or `.json`).
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let file: FormulaFile = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&contents).map_err(|e| ConfigError::Malformed {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?,
            _ => toml::from_str(&contents).map_err(|e| ConfigError::Malformed {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?,
        };

        let mut formula = Self::from_file(file)?;
        formula.path = Some(path.to_path_buf());
        Ok(formula)
    }

    /// Parse a formula from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let file: FormulaFile = toml::from_str(contents).map_err(|e| ConfigError::Malformed {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })?;
        Self::from_file(file)
    }

    fn from_file(file: FormulaFile) -> Result<Self, ConfigError> {
        let name = file.name.trim().to_string();
        let invalid = |reason: String| ConfigError::Invalid {
            name: name.clone(),
            reason,
        };

        if !is_valid_name(&name) {
            return Err(invalid("name must be non-empty without '/' or whitespace".into()));
        }
        if file.version.trim().is_empty() {
            return Err(invalid("version is empty".into()));
        }
        if file.url.trim().is_empty() {
            return Err(invalid("url is empty".into()));
        }

        let sha256 = file.sha256.trim().to_ascii_lowercase();
        if sha256.len() != 64 || !sha256.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid(format!(
                "sha256 must be 64 hex characters, got '{}'",
                file.sha256
            )));
        }

        if file.install.is_empty() {
            return Err(invalid("no install steps".into()));
        }

        let install = convert_steps(&name, "install", file.install)?;
        let post_install = convert_steps(&name, "post_install", file.post_install)?;
        let test = match file.test {
            Some(step) => Some(convert_step(&name, "test", 1, step)?),
            None => None,
        };
        if let Some(step) = &test
            && !matches!(step.action, StepAction::Run { .. })
        {
            return Err(invalid("test must be a `run` command".into()));
        }

        let formula = Self {
            build_dependencies: normalize_dependencies(&file.dependencies.build),
            runtime_dependencies: normalize_dependencies(&file.dependencies.runtime),
            name,
            version: file.version.trim().to_string(),
            desc: file.desc,
            homepage: file.homepage,
            url: file.url.trim().to_string(),
            sha256,
            install,
            post_install,
            test,
            path: None,
        };

        formula.check_placeholders()?;
        Ok(formula)
    }

    fn check_placeholders(&self) -> Result<(), ConfigError> {
        let steps = self
            .install
            .iter()
            .chain(self.post_install.iter())
            .chain(self.test.iter());

        for step in steps {
            for arg in step.arguments() {
                placeholder::validate(arg).map_err(|e| ConfigError::Invalid {
                    name: self.name.clone(),
                    reason: format!("'{arg}': {e}"),
                })?;
            }
        }
        Ok(())
    }

    /// All dependencies with their kind, runtime winning over build for names
    /// listed in both.
    pub fn dependencies(&self) -> Vec<(String, DependencyKind)> {
        let mut deps: Vec<(String, DependencyKind)> = Vec::new();
        for name in &self.runtime_dependencies {
            deps.push((name.clone(), DependencyKind::Runtime));
        }
        for name in &self.build_dependencies {
            if !deps.iter().any(|(n, _)| n == name) {
                deps.push((name.clone(), DependencyKind::Build));
            }
        }
        deps
    }

    pub fn edges(&self) -> Vec<DependencyEdge> {
        self.dependencies()
            .into_iter()
            .map(|(depends_on, kind)| DependencyEdge {
                formula: self.name.clone(),
                depends_on,
                kind,
            })
            .collect()
    }

    /// File name of the fetched source, taken from the last URL segment.
    pub fn source_filename(&self) -> String {
        let trimmed = self.url.split(['?', '#']).next().unwrap_or(&self.url);
        let last = trimmed.rsplit('/').next().unwrap_or_default();
        if last.is_empty() {
            format!("{}-{}", self.name, self.version)
        } else {
            last.to_string()
        }
    }
}

/// Strip a `user/repo/` tap qualifier from a formula reference.
pub fn canonical_name(reference: &str) -> &str {
    reference.rsplit('/').next().unwrap_or(reference).trim()
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.chars().any(char::is_whitespace)
}

fn normalize_dependencies(deps: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(deps.len());
    for dep in deps {
        let name = canonical_name(dep);
        if !name.is_empty() && !out.iter().any(|d| d == name) {
            out.push(name.to_string());
        }
    }
    out
}

fn convert_steps(
    formula: &str,
    section: &str,
    steps: Vec<StepFile>,
) -> Result<Vec<BuildStep>, ConfigError> {
    steps
        .into_iter()
        .enumerate()
        .map(|(i, step)| convert_step(formula, section, i + 1, step))
        .collect()
}

fn convert_step(
    formula: &str,
    section: &str,
    index: usize,
    step: StepFile,
) -> Result<BuildStep, ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        name: formula.to_string(),
        reason: format!("{section} step {index}: {reason}"),
    };

    let action = match (step.run, step.symlink, step.into) {
        (Some(argv), None, None) => {
            if argv.is_empty() || argv[0].trim().is_empty() {
                return Err(invalid("`run` needs a program"));
            }
            StepAction::Run { argv }
        }
        (None, Some(pattern), Some(into)) => StepAction::Symlink { pattern, into },
        (None, Some(_), None) => return Err(invalid("`symlink` needs `into`")),
        (None, None, Some(_)) => return Err(invalid("`into` without `symlink`")),
        (None, None, None) => return Err(invalid("expected `run` or `symlink`")),
        _ => return Err(invalid("`run` and `symlink` are mutually exclusive")),
    };

    if let Some(cwd) = &step.cwd {
        let escapes = cwd
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(invalid("`cwd` must be a relative path inside the source tree"));
        }
    }

    Ok(BuildStep {
        action,
        cwd: step.cwd,
        env: step.env,
    })
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FormulaFile {
    name: String,
    version: String,
    #[serde(default)]
    desc: Option<String>,
    #[serde(default)]
    homepage: Option<String>,
    url: String,
    sha256: String,
    #[serde(default)]
    dependencies: DependencyLists,
    #[serde(default)]
    install: Vec<StepFile>,
    #[serde(default)]
    post_install: Vec<StepFile>,
    #[serde(default)]
    test: Option<StepFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DependencyLists {
    #[serde(default)]
    build: Vec<String>,
    #[serde(default)]
    runtime: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepFile {
    #[serde(default)]
    run: Option<Vec<String>>,
    #[serde(default)]
    symlink: Option<String>,
    #[serde(default)]
    into: Option<String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}
