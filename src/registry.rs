//! Formula registry: every formula known to one run.
//!
//! The registry is an explicit value handed to the resolver and pipeline; there
//! is no process-wide formula table. It is built from one or more formula
//! directories (a tap checkout's `Formula/` directory, for instance) or from
//! records constructed in code.

use crate::error::ConfigError;
use crate::formula::{Formula, canonical_name};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// File extensions recognised as formula files.
const FORMULA_EXTENSIONS: &[&str] = &["toml", "json"];

#[derive(Debug, Clone, Default)]
pub struct FormulaRegistry {
    formulae: BTreeMap<String, Arc<Formula>>,
    /// Names satisfied by the host system rather than built here.
    provided: BTreeSet<String>,
}

impl FormulaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every formula file found directly inside each directory.
    ///
    /// Missing directories are skipped with a warning; unreadable or invalid
    /// formula files are errors.
    pub fn load_dirs<P: AsRef<Path>>(dirs: &[P]) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for dir in dirs {
            registry.load_dir(dir.as_ref())?;
        }
        Ok(registry)
    }

    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, ConfigError> {
        if !dir.is_dir() {
            warn!(dir = %dir.display(), "formula directory does not exist");
            return Ok(0);
        }

        let read_err = |source: std::io::Error| ConfigError::Read {
            path: dir.to_path_buf(),
            source,
        };

        let mut paths = Vec::new();
        for entry in fs::read_dir(dir).map_err(read_err)? {
            let path = entry.map_err(read_err)?.path();
            let is_formula = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| FORMULA_EXTENSIONS.contains(&e));
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'));
            if path.is_file() && is_formula && !hidden {
                paths.push(path);
            }
        }
        // Directory order is not stable across filesystems
        paths.sort();

        let count = paths.len();
        for path in paths {
            let formula = Formula::from_path(&path)?;
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && stem != formula.name
            {
                warn!(
                    file = %path.display(),
                    name = %formula.name,
                    "formula file name does not match formula name"
                );
            }
            self.insert(formula)?;
        }

        debug!(dir = %dir.display(), count, "loaded formula directory");
        Ok(count)
    }

    /// Add a formula, rejecting a second definition of the same name.
    pub fn insert(&mut self, formula: Formula) -> Result<(), ConfigError> {
        if let Some(existing) = self.formulae.get(&formula.name) {
            return Err(ConfigError::Duplicate {
                name: formula.name.clone(),
                first: existing.path.clone().unwrap_or_default(),
                second: formula.path.clone().unwrap_or_default(),
            });
        }
        self.formulae
            .insert(formula.name.clone(), Arc::new(formula));
        Ok(())
    }

    /// Mark names as supplied by the host; dependency edges to them are satisfied.
    pub fn with_provided<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.provided
            .extend(names.into_iter().map(|n| canonical_name(n.as_ref()).to_string()));
        self
    }

    pub fn is_provided(&self, name: &str) -> bool {
        self.provided.contains(canonical_name(name))
    }

    pub fn provided(&self) -> impl Iterator<Item = &str> {
        self.provided.iter().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Formula>> {
        self.formulae.get(canonical_name(name))
    }

    /// Look up a formula, suggesting the closest known name when absent.
    pub fn lookup(&self, name: &str) -> Result<&Arc<Formula>, ConfigError> {
        self.get(name).ok_or_else(|| ConfigError::UnknownFormula {
            name: name.to_string(),
            suggestion: self.suggest(name),
        })
    }

    /// Closest known formula name by Jaro-Winkler similarity.
    pub fn suggest(&self, name: &str) -> Option<String> {
        let name = canonical_name(name);
        self.formulae
            .keys()
            .map(|candidate| (strsim::jaro_winkler(name, candidate), candidate))
            .filter(|(score, _)| *score >= 0.8)
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, candidate)| candidate.clone())
    }

    /// Formula names in lexicographic order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.formulae.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Formula>> {
        self.formulae.values()
    }

    pub fn len(&self) -> usize {
        self.formulae.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formulae.is_empty()
    }
}

impl FromIterator<Formula> for FormulaRegistry {
    /// Later duplicates replace earlier ones; use [`FormulaRegistry::insert`]
    /// to reject them instead.
    fn from_iter<T: IntoIterator<Item = Formula>>(iter: T) -> Self {
        let mut registry = Self::new();
        for formula in iter {
            registry
                .formulae
                .insert(formula.name.clone(), Arc::new(formula));
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn formula_toml(name: &str, deps: &[&str]) -> String {
        let deps = deps
            .iter()
            .map(|d| format!("\"{d}\""))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            r#"name = "{name}"
version = "1.0"
url = "file:///src/{name}.tar.gz"
sha256 = "{}"
dependencies = {{ runtime = [{deps}] }}
install = [{{ run = ["make", "install"] }}]
"#,
            "a".repeat(64)
        )
    }

    #[test]
    fn test_load_dir_reads_toml_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("capi20.toml"), formula_toml("capi20", &[])).unwrap();
        fs::write(
            dir.path().join("librm.toml"),
            formula_toml("librm", &["capi20"]),
        )
        .unwrap();
        fs::write(dir.path().join("README.md"), "not a formula").unwrap();

        let registry = FormulaRegistry::load_dirs(&[dir.path()]).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["capi20", "librm"]);
        assert_eq!(
            registry.get("librm").unwrap().path.as_deref(),
            Some(dir.path().join("librm.toml").as_path())
        );
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.toml"), formula_toml("a", &[])).unwrap();
        fs::write(dir.path().join("b.toml"), formula_toml("a", &[])).unwrap();

        let err = FormulaRegistry::load_dirs(&[dir.path()]).unwrap_err();
        assert!(matches!(err, ConfigError::Duplicate { ref name, .. } if name == "a"));
    }

    #[test]
    fn test_missing_dir_is_skipped() {
        let dir = TempDir::new().unwrap();
        let registry = FormulaRegistry::load_dirs(&[dir.path().join("nope")]).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_lookup_suggests_close_name() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("librm.toml"), formula_toml("librm", &[])).unwrap();
        let registry = FormulaRegistry::load_dirs(&[dir.path()]).unwrap();

        assert!(registry.lookup("tabos/rogerrouter/librm").is_ok());
        match registry.lookup("libr") {
            Err(ConfigError::UnknownFormula { suggestion, .. }) => {
                assert_eq!(suggestion.as_deref(), Some("librm"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        match registry.lookup("zzz") {
            Err(ConfigError::UnknownFormula { suggestion, .. }) => assert!(suggestion.is_none()),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_provided_names_are_canonical() {
        let registry = FormulaRegistry::new().with_provided(["glib", "tabos/rogerrouter/gtk+3"]);
        assert!(registry.is_provided("gtk+3"));
        assert!(registry.is_provided("glib"));
        assert!(!registry.is_provided("librm"));
    }
}
