//! Install receipts.
//!
//! A receipt is written into a keg only after every install step of the
//! formula succeeded, so its presence marks a complete install:
//!
//! ```text
//! <prefix>/Cellar/librm/2.1.1/
//!   INSTALL_RECEIPT.json
//!   bin/
//!   lib/
//! ```
//!
//! The receipt records where the source came from and which runtime
//! dependencies (at which versions) the keg was built against.
//!
//! # Examples
//!
//! ```no_run
//! use kegworks::receipt::InstallReceipt;
//! use std::path::Path;
//!
//! fn main() -> anyhow::Result<()> {
//!     let receipt = InstallReceipt::read(Path::new("/opt/keg/Cellar/librm/2.1.1"))?;
//!     println!("{} {} installed {}", receipt.name, receipt.version, receipt.time);
//!     Ok(())
//! }
//! ```

use crate::formula::Formula;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const RECEIPT_FILE: &str = "INSTALL_RECEIPT.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeDependency {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub url: String,
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReceipt {
    pub name: String,
    pub version: String,
    /// `keg/<version>` of the tool that performed the install.
    pub tool_version: String,
    pub installed_on_request: bool,
    #[serde(default)]
    pub installed_as_dependency: bool,
    /// Whether the keg is linked into the prefix. Build-only kegs are not.
    #[serde(default = "default_linked")]
    pub linked: bool,
    pub time: DateTime<Utc>,
    pub source: SourceInfo,
    #[serde(default)]
    pub runtime_dependencies: Vec<RuntimeDependency>,
    #[serde(default)]
    pub build_dependencies: Vec<String>,
}

impl InstallReceipt {
    pub fn new(
        formula: &Formula,
        runtime_dependencies: Vec<RuntimeDependency>,
        installed_on_request: bool,
    ) -> Self {
        Self {
            name: formula.name.clone(),
            version: formula.version.clone(),
            tool_version: format!("keg/{}", env!("CARGO_PKG_VERSION")),
            installed_on_request,
            installed_as_dependency: !installed_on_request,
            linked: true,
            time: Utc::now(),
            source: SourceInfo {
                url: formula.url.clone(),
                sha256: formula.sha256.clone(),
                formula_path: formula.path.as_ref().map(|p| p.display().to_string()),
            },
            runtime_dependencies,
            build_dependencies: formula.build_dependencies.clone(),
        }
    }

    /// Read `INSTALL_RECEIPT.json` from a keg.
    pub fn read(keg: &Path) -> Result<Self> {
        let receipt_path = keg.join(RECEIPT_FILE);
        let contents = fs::read_to_string(&receipt_path)
            .with_context(|| format!("Failed to read receipt: {}", receipt_path.display()))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse receipt: {}", receipt_path.display()))
    }

    pub fn write(&self, keg: &Path) -> Result<()> {
        let receipt_path = keg.join(RECEIPT_FILE);
        let json =
            serde_json::to_string_pretty(self).context("Failed to serialize install receipt")?;

        fs::write(&receipt_path, json)
            .with_context(|| format!("Failed to write receipt: {}", receipt_path.display()))?;

        Ok(())
    }

    /// Rewrite the `linked` flag of the receipt in `keg`.
    pub fn set_linked(keg: &Path, linked: bool) -> Result<()> {
        let mut receipt = Self::read(keg)?;
        if receipt.linked != linked {
            receipt.linked = linked;
            receipt.write(keg)?;
        }
        Ok(())
    }
}

fn default_linked() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::BuildStep;
    use tempfile::TempDir;

    fn librm() -> Formula {
        Formula {
            name: "librm".into(),
            version: "2.1.1".into(),
            desc: Some("RouterManager Library".into()),
            homepage: None,
            url: "https://gitlab.com/tabos/librm/-/archive/v2.1.1/librm-v2.1.1.tar.gz".into(),
            sha256: "196e6bb5a16c3a34da4f9743c7f68a4d0dd970cc11efcc4ea74d6393e55363f8".into(),
            build_dependencies: vec!["meson".into(), "ninja".into()],
            runtime_dependencies: vec!["capi20".into()],
            install: vec![BuildStep::run(["ninja", "install"])],
            post_install: vec![],
            test: None,
            path: None,
        }
    }

    #[test]
    fn test_write_then_read() {
        let keg = TempDir::new().unwrap();
        let receipt = InstallReceipt::new(
            &librm(),
            vec![RuntimeDependency {
                name: "capi20".into(),
                version: "3.2.1".into(),
            }],
            true,
        );
        receipt.write(keg.path()).unwrap();

        let read = InstallReceipt::read(keg.path()).unwrap();
        assert_eq!(read, receipt);
        assert!(read.installed_on_request);
        assert!(!read.installed_as_dependency);
        assert!(read.tool_version.starts_with("keg/"));
    }

    #[test]
    fn test_read_missing_receipt() {
        let keg = TempDir::new().unwrap();
        let err = InstallReceipt::read(keg.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to read receipt"));
    }

    #[test]
    fn test_read_minimal_receipt() {
        let keg = TempDir::new().unwrap();
        fs::write(
            keg.path().join(RECEIPT_FILE),
            r#"{
                "name": "capi20",
                "version": "3.2.1",
                "tool_version": "keg/0.1.0",
                "installed_on_request": false,
                "time": "2024-05-01T12:00:00Z",
                "source": { "url": "file:///src/capi20.tar.gz", "sha256": "00" }
            }"#,
        )
        .unwrap();

        let receipt = InstallReceipt::read(keg.path()).unwrap();
        assert_eq!(receipt.version, "3.2.1");
        assert!(receipt.runtime_dependencies.is_empty());
        assert!(receipt.source.formula_path.is_none());
        assert!(receipt.linked, "receipts without the flag were linked");
    }

    #[test]
    fn test_set_linked() {
        let keg = TempDir::new().unwrap();
        let mut receipt = InstallReceipt::new(&librm(), vec![], true);
        receipt.linked = false;
        receipt.write(keg.path()).unwrap();

        InstallReceipt::set_linked(keg.path(), true).unwrap();
        let read = InstallReceipt::read(keg.path()).unwrap();
        assert!(read.linked);
        assert_eq!(read.time, receipt.time);
    }
}
