use std::path::PathBuf;
use thiserror::Error;

/// Problems with formula files, the dependency graph or the settings file.
///
/// Every variant is raised before the pipeline touches the filesystem.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed formula {}: {message}", path.display())]
    Malformed { path: PathBuf, message: String },

    #[error("Invalid formula {name}: {reason}")]
    Invalid { name: String, reason: String },

    #[error("Formula {name} is defined twice: {} and {}", first.display(), second.display())]
    Duplicate {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("Formula not found: {name}{}", suggestion.as_ref().map(|s| format!(" (did you mean {s}?)")).unwrap_or_default())]
    UnknownFormula {
        name: String,
        suggestion: Option<String>,
    },

    #[error("{formula} depends on unknown formula {dependency}")]
    MissingDependency { formula: String, dependency: String },

    #[error("Dependency cycle detected: {}", cycle_path(members))]
    Cycle {
        /// Each member depends on the next; the last depends on the first.
        members: Vec<String>,
    },

    #[error("Invalid settings in {}: {message}", path.display())]
    Settings { path: PathBuf, message: String },
}

impl ConfigError {
    /// Formulae participating in a cycle, empty for every other variant.
    pub fn cycle_members(&self) -> &[String] {
        match self {
            ConfigError::Cycle { members } => members,
            _ => &[],
        }
    }
}

/// Declared and computed source digests disagree.
#[derive(Error, Debug, Clone)]
#[error("Checksum mismatch for {formula}: expected {expected}, got {actual} ({})", path.display())]
pub struct ChecksumMismatch {
    pub formula: String,
    pub expected: String,
    pub actual: String,
    pub path: PathBuf,
}

/// A build step exited non-zero or could not be carried out.
#[derive(Error, Debug, Clone)]
#[error("{formula}: step {step} `{command}` failed{}", status_suffix(*status))]
pub struct BuildStepError {
    pub formula: String,
    /// 1-based position in the formula's install steps.
    pub step: usize,
    pub command: String,
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// A post-install step failed. Reported, never fatal.
#[derive(Error, Debug, Clone)]
#[error("{formula}: post-install step {step} `{command}` failed{}", status_suffix(*status))]
pub struct PostInstallError {
    pub formula: String,
    pub step: usize,
    pub command: String,
    pub status: Option<i32>,
    pub stderr: String,
}

/// The smoke test command of an installed formula did not pass.
#[derive(Error, Debug, Clone)]
#[error("{formula}: test `{command}` failed{}", status_suffix(*status))]
pub struct SmokeTestError {
    pub formula: String,
    pub command: String,
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

fn cycle_path(members: &[String]) -> String {
    match members.first() {
        Some(first) => format!("{} -> {first}", members.join(" -> ")),
        None => String::new(),
    }
}

fn status_suffix(status: Option<i32>) -> String {
    match status {
        Some(code) => format!(" with exit code {code}"),
        None => " (terminated by signal or not started)".to_string(),
    }
}

#[derive(Error, Debug)]
pub enum KegError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    ChecksumMismatch(#[from] ChecksumMismatch),

    #[error(transparent)]
    BuildStep(#[from] BuildStepError),

    #[error(transparent)]
    SmokeTest(#[from] SmokeTestError),

    #[error("Failed to fetch {url} for {formula}: {message}")]
    Fetch {
        formula: String,
        url: String,
        message: String,
    },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl KegError {
    /// Formula the error is attributed to, if any.
    pub fn formula(&self) -> Option<&str> {
        match self {
            KegError::ChecksumMismatch(e) => Some(&e.formula),
            KegError::BuildStep(e) => Some(&e.formula),
            KegError::SmokeTest(e) => Some(&e.formula),
            KegError::Fetch { formula, .. } => Some(formula),
            KegError::Config(ConfigError::Invalid { name, .. }) => Some(name),
            KegError::Config(ConfigError::MissingDependency { formula, .. }) => Some(formula),
            _ => None,
        }
    }

    /// Errors the pipeline raises before any build step is allowed to run.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            KegError::Config(_) | KegError::ChecksumMismatch(_) | KegError::Fetch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, KegError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_members() {
        let err = ConfigError::Cycle {
            members: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
        assert_eq!(err.cycle_members().len(), 2);
    }

    #[test]
    fn test_unknown_formula_suggestion() {
        let err = ConfigError::UnknownFormula {
            name: "libmr".into(),
            suggestion: Some("librm".into()),
        };
        assert_eq!(
            err.to_string(),
            "Formula not found: libmr (did you mean librm?)"
        );
    }

    #[test]
    fn test_build_step_error_names_formula_and_step() {
        let err = BuildStepError {
            formula: "capi20".into(),
            step: 2,
            command: "ninja".into(),
            status: Some(1),
            stdout: String::new(),
            stderr: "boom".into(),
        };
        assert_eq!(
            err.to_string(),
            "capi20: step 2 `ninja` failed with exit code 1"
        );
        assert!(!KegError::from(err).is_preflight());
    }

    #[test]
    fn test_checksum_mismatch_is_attributed() {
        let err = KegError::from(ChecksumMismatch {
            formula: "librm".into(),
            expected: "aa".into(),
            actual: "bb".into(),
            path: PathBuf::from("/tmp/librm.tar.gz"),
        });
        assert!(err.is_preflight());
        assert_eq!(err.formula(), Some("librm"));
        assert_eq!(KegError::Other(anyhow::anyhow!("x")).formula(), None);
    }
}
