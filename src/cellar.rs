//! Install prefix layout and installed kegs.
//!
//! ```text
//! <prefix>/
//!   Cellar/<name>/<version>/   one keg per installed formula version
//!   opt/<name> -> ../Cellar/<name>/<version>
//!   bin/ lib/ include/ ...     symlinks into kegs
//! ```

use crate::formula::Formula;
use crate::placeholder::Scope;
use crate::receipt::{InstallReceipt, RECEIPT_FILE};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Default prefix when neither configuration nor `KEG_PREFIX` names one.
pub const DEFAULT_PREFIX: &str = "/opt/keg";

/// Paths under one install prefix. Passed explicitly; there is no global prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cellar(&self) -> PathBuf {
        self.root.join("Cellar")
    }

    pub fn keg(&self, name: &str, version: &str) -> PathBuf {
        self.cellar().join(name).join(version)
    }

    pub fn keg_for(&self, formula: &Formula) -> PathBuf {
        self.keg(&formula.name, &formula.version)
    }

    pub fn opt(&self, name: &str) -> PathBuf {
        self.root.join("opt").join(name)
    }

    /// Placeholder values for steps of `formula`.
    pub fn scope(&self, formula: &Formula, jobs: usize) -> Scope {
        Scope::new(
            &self.root,
            &self.keg_for(formula),
            &formula.name,
            &formula.version,
            jobs,
        )
    }

    /// Where a keg being rebuilt is kept until its replacement is in place.
    /// Hidden, so listings skip it.
    pub fn backup_keg(&self, name: &str, version: &str) -> PathBuf {
        self.cellar().join(name).join(format!(".{version}.old"))
    }

    /// Receipt of the formula's keg, if it holds one for the same version.
    pub fn receipt_for(&self, formula: &Formula) -> Option<InstallReceipt> {
        let keg = self.keg_for(formula);
        if !keg.join(RECEIPT_FILE).is_file() {
            return None;
        }
        InstallReceipt::read(&keg)
            .ok()
            .filter(|r| r.version == formula.version)
    }

    /// A formula is satisfied when its keg holds a receipt for the same version.
    pub fn is_installed(&self, formula: &Formula) -> bool {
        self.receipt_for(formula).is_some()
    }

    /// Every keg in the Cellar, sorted by name then newest version first.
    pub fn list_installed(&self) -> Result<Vec<InstalledKeg>> {
        let cellar = self.cellar();
        if !cellar.exists() {
            return Ok(vec![]);
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(&cellar)
            .with_context(|| format!("Failed to read Cellar: {}", cellar.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') && entry.path().is_dir() {
                names.push(name);
            }
        }
        names.sort();

        let mut kegs = Vec::new();
        for name in names {
            kegs.extend(self.installed_versions(&name)?);
        }
        Ok(kegs)
    }

    /// Installed versions of one formula, newest first.
    pub fn installed_versions(&self, name: &str) -> Result<Vec<InstalledKeg>> {
        let formula_path = self.cellar().join(name);
        if !formula_path.exists() {
            return Ok(vec![]);
        }

        let mut kegs = Vec::new();
        for entry in fs::read_dir(&formula_path)
            .with_context(|| format!("Failed to read {}", formula_path.display()))?
        {
            let entry = entry?;
            let version = entry.file_name().to_string_lossy().to_string();
            if version.starts_with('.') {
                continue;
            }
            kegs.push(InstalledKeg::from_path(name.to_string(), version, entry.path()));
        }

        kegs.sort_by(|a, b| compare_versions(&b.version, &a.version));
        Ok(kegs)
    }
}

#[derive(Debug, Clone)]
pub struct InstalledKeg {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    /// `None` for an incomplete keg.
    pub receipt: Option<InstallReceipt>,
}

impl InstalledKeg {
    pub fn from_path(name: String, version: String, path: PathBuf) -> Self {
        let receipt = InstallReceipt::read(&path).ok();
        Self {
            name,
            version,
            path,
            receipt,
        }
    }

    pub fn installed_on_request(&self) -> bool {
        self.receipt
            .as_ref()
            .map(|r| r.installed_on_request)
            .unwrap_or(false)
    }

    /// Total size in bytes of the files in the keg. Symlinks are not followed.
    pub fn disk_usage(&self) -> u64 {
        walkdir::WalkDir::new(&self.path)
            .follow_links(false)
            .max_open(64)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|metadata| metadata.len())
            .sum()
    }
}

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

/// Compare dotted version strings numerically, falling back to text order.
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let a_parts: Vec<u32> = a.split('.').filter_map(|s| s.parse::<u32>().ok()).collect();
    let b_parts: Vec<u32> = b.split('.').filter_map(|s| s.parse::<u32>().ok()).collect();

    for i in 0..a_parts.len().max(b_parts.len()) {
        let a_part = a_parts.get(i).unwrap_or(&0);
        let b_part = b_parts.get(i).unwrap_or(&0);
        match a_part.cmp(b_part) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }

    a.cmp(b)
}
