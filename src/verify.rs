//! Source verification and post-install smoke tests.

use crate::error::{ChecksumMismatch, Result, SmokeTestError};
use crate::formula::{Formula, StepAction};
use crate::placeholder::Scope;
use crate::runner::{CommandOutput, CommandRunner, CommandSpec};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info};

/// Lowercase hex SHA-256 of a file, read in fixed-size chunks.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; 8192];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Compare two hex digests without stopping at the first difference.
///
/// Case-insensitive. Every byte position of the longer input is visited, so
/// the time taken does not depend on where the inputs differ.
pub fn checksums_match(expected: &str, actual: &str) -> bool {
    let a = expected.as_bytes();
    let b = actual.as_bytes();
    let len = a.len().max(b.len());

    let mut diff = u8::from(a.len() != b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0).to_ascii_lowercase();
        let y = b.get(i).copied().unwrap_or(0).to_ascii_lowercase();
        diff |= x ^ y;
    }
    diff == 0
}

/// Hash a fetched source and compare it to the formula's declared checksum.
pub fn verify_source(formula: &Formula, path: &Path) -> Result<()> {
    let actual = sha256_file(path)?;
    if checksums_match(&formula.sha256, &actual) {
        debug!(formula = %formula.name, "checksum verified");
        Ok(())
    } else {
        Err(ChecksumMismatch {
            formula: formula.name.clone(),
            expected: formula.sha256.clone(),
            actual,
            path: path.to_path_buf(),
        }
        .into())
    }
}

/// Verify many sources in parallel. Reports the first failure in input order.
pub fn verify_all(sources: &[(Arc<Formula>, PathBuf)]) -> Result<()> {
    let results: Vec<Result<()>> = sources
        .par_iter()
        .map(|(formula, path)| verify_source(formula, path))
        .collect();

    if let Some(err) = results.into_iter().find_map(|r| r.err()) {
        return Err(err);
    }
    info!(count = sources.len(), "verified source checksums");
    Ok(())
}

/// Run a formula's test command inside a fresh temporary directory.
///
/// Returns `Ok(None)` when the formula has no test.
pub fn run_smoke_test(
    formula: &Formula,
    scope: &Scope,
    env: &BTreeMap<String, String>,
    runner: &dyn CommandRunner,
) -> std::result::Result<Option<CommandOutput>, SmokeTestError> {
    let Some(step) = &formula.test else {
        return Ok(None);
    };

    let failed = |command: String, status: Option<i32>, stdout: String, stderr: String| {
        SmokeTestError {
            formula: formula.name.clone(),
            command,
            status,
            stdout,
            stderr,
        }
    };

    let StepAction::Run { argv } = &step.action else {
        return Err(failed(
            step.describe(),
            None,
            String::new(),
            "test must be a `run` command".into(),
        ));
    };

    let workdir = TempDir::new()
        .map_err(|e| failed(step.describe(), None, String::new(), e.to_string()))?;
    let cwd = match &step.cwd {
        Some(rel) => workdir.path().join(rel),
        None => workdir.path().to_path_buf(),
    };
    std::fs::create_dir_all(&cwd)
        .map_err(|e| failed(step.describe(), None, String::new(), e.to_string()))?;

    let mut step_env = env.clone();
    step_env.extend(step.env.clone());
    let spec = CommandSpec::expand(argv, scope, &cwd, step_env)
        .map_err(|e| failed(step.describe(), None, String::new(), e.to_string()))?;
    let command = spec.display();

    info!(formula = %formula.name, command = %command, "running test");
    let output = runner
        .run(&spec)
        .map_err(|e| failed(command.clone(), None, String::new(), e.to_string()))?;

    if output.is_success() {
        Ok(Some(output))
    } else {
        Err(failed(command, output.status, output.stdout, output.stderr))
    }
}
