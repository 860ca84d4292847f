//! Layered settings.
//!
//! Values are resolved from, lowest to highest precedence:
//!
//! 1. built-in defaults
//! 2. `keg.toml` (`--config`, `$KEG_CONFIG`, or `~/.config/keg/keg.toml`)
//! 3. environment: `KEG_PREFIX`, `KEG_JOBS`, `KEG_CACHE`
//! 4. command-line flags
//!
//! ```toml
//! prefix = "/opt/keg"
//! jobs = 4
//! formula_dirs = ["Formula", "/srv/taps/rogerrouter/Formula"]
//! provided = ["glib", "gtk+3", "meson", "ninja", "pkg-config"]
//! ```

use crate::cellar::{DEFAULT_PREFIX, Layout};
use crate::error::ConfigError;
use crate::fetch;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CONFIG_FILE_NAME: &str = "keg.toml";

/// Contents of `keg.toml`. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub prefix: Option<PathBuf>,
    pub jobs: Option<usize>,
    /// Relative entries are taken relative to the config file.
    pub formula_dirs: Vec<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    /// Formulae supplied by the host system instead of being built.
    pub provided: Vec<String>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut file: ConfigFile = toml::from_str(&contents).map_err(|e| ConfigError::Settings {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        if let Some(base) = path.parent() {
            for dir in &mut file.formula_dirs {
                if dir.is_relative() {
                    *dir = base.join(&*dir);
                }
            }
        }
        Ok(file)
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub prefix: Option<PathBuf>,
    pub jobs: Option<usize>,
    pub formula_dirs: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub prefix: PathBuf,
    /// Worker pool size, at least 1.
    pub jobs: usize,
    pub formula_dirs: Vec<PathBuf>,
    pub cache_dir: PathBuf,
    pub provided: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            prefix: PathBuf::from(DEFAULT_PREFIX),
            jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            formula_dirs: vec![PathBuf::from("Formula")],
            cache_dir: fetch::default_cache_dir(),
            provided: vec![],
        }
    }
}

impl Settings {
    /// Resolve against the process environment.
    pub fn resolve(overrides: &Overrides) -> Result<Self, ConfigError> {
        Self::resolve_with(overrides, |key| std::env::var(key).ok())
    }

    /// Resolve with an explicit environment lookup.
    pub fn resolve_with<F>(overrides: &Overrides, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();

        if let Some(path) = config_path(overrides, &env) {
            debug!(path = %path.display(), "loading settings file");
            settings.apply_file(ConfigFile::load(&path)?);
        }

        if let Some(prefix) = env("KEG_PREFIX").filter(|v| !v.is_empty()) {
            settings.prefix = PathBuf::from(prefix);
        }
        if let Some(jobs) = env("KEG_JOBS").filter(|v| !v.is_empty()) {
            settings.jobs = jobs.trim().parse().map_err(|_| ConfigError::Settings {
                path: PathBuf::from("$KEG_JOBS"),
                message: format!("'{jobs}' is not a number"),
            })?;
        }
        if let Some(cache) = env("KEG_CACHE").filter(|v| !v.is_empty()) {
            settings.cache_dir = PathBuf::from(cache);
        }

        if let Some(prefix) = &overrides.prefix {
            settings.prefix = prefix.clone();
        }
        if let Some(jobs) = overrides.jobs {
            settings.jobs = jobs;
        }
        if !overrides.formula_dirs.is_empty() {
            settings.formula_dirs = overrides.formula_dirs.clone();
        }

        if settings.jobs == 0 {
            return Err(ConfigError::Settings {
                path: PathBuf::from("jobs"),
                message: "must be at least 1".into(),
            });
        }

        Ok(settings)
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(prefix) = file.prefix {
            self.prefix = prefix;
        }
        if let Some(jobs) = file.jobs {
            self.jobs = jobs;
        }
        if !file.formula_dirs.is_empty() {
            self.formula_dirs = file.formula_dirs;
        }
        if let Some(cache) = file.cache_dir {
            self.cache_dir = cache;
        }
        self.provided.extend(file.provided);
    }

    pub fn layout(&self) -> Layout {
        Layout::new(&self.prefix)
    }
}

/// An explicitly named file must exist; the default location is optional.
fn config_path<F>(overrides: &Overrides, env: &F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = &overrides.config {
        return Some(path.clone());
    }
    if let Some(path) = env("KEG_CONFIG").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(path));
    }

    let base = env("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    let default = base.join("keg").join(CONFIG_FILE_NAME);
    default.is_file().then_some(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_file() {
        let settings = Settings::resolve_with(&Overrides::default(), env_from(&[])).unwrap();
        assert_eq!(settings.prefix, PathBuf::from(DEFAULT_PREFIX));
        assert!(settings.jobs >= 1);
        assert_eq!(settings.formula_dirs, vec![PathBuf::from("Formula")]);
        assert!(settings.provided.is_empty());
    }

    #[test]
    fn test_layers_in_order() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("keg.toml");
        fs::write(
            &config,
            r#"
prefix = "/from/file"
jobs = 3
formula_dirs = ["Formula"]
provided = ["glib", "gtk+3"]
"#,
        )
        .unwrap();

        let overrides = Overrides {
            config: Some(config),
            ..Default::default()
        };

        let file_only = Settings::resolve_with(&overrides, env_from(&[])).unwrap();
        assert_eq!(file_only.prefix, PathBuf::from("/from/file"));
        assert_eq!(file_only.jobs, 3);
        assert_eq!(file_only.formula_dirs, vec![dir.path().join("Formula")]);
        assert_eq!(file_only.provided, vec!["glib", "gtk+3"]);

        let with_env = Settings::resolve_with(
            &overrides,
            env_from(&[("KEG_PREFIX", "/from/env"), ("KEG_JOBS", "5")]),
        )
        .unwrap();
        assert_eq!(with_env.prefix, PathBuf::from("/from/env"));
        assert_eq!(with_env.jobs, 5);

        let with_cli = Settings::resolve_with(
            &Overrides {
                prefix: Some(PathBuf::from("/from/cli")),
                jobs: Some(1),
                ..overrides.clone()
            },
            env_from(&[("KEG_PREFIX", "/from/env")]),
        )
        .unwrap();
        assert_eq!(with_cli.prefix, PathBuf::from("/from/cli"));
        assert_eq!(with_cli.jobs, 1);
    }

    #[test]
    fn test_config_from_env_var() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("custom.toml");
        fs::write(&config, "cache_dir = \"/var/cache/keg\"\n").unwrap();

        let settings = Settings::resolve_with(
            &Overrides::default(),
            env_from(&[("KEG_CONFIG", config.to_str().unwrap())]),
        )
        .unwrap();
        assert_eq!(settings.cache_dir, PathBuf::from("/var/cache/keg"));
    }

    #[test]
    fn test_default_location_under_xdg() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("keg")).unwrap();
        fs::write(dir.path().join("keg/keg.toml"), "jobs = 7\n").unwrap();

        let settings = Settings::resolve_with(
            &Overrides::default(),
            env_from(&[("XDG_CONFIG_HOME", dir.path().to_str().unwrap())]),
        )
        .unwrap();
        assert_eq!(settings.jobs, 7);
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let overrides = Overrides {
            config: Some(PathBuf::from("/nonexistent/keg.toml")),
            ..Default::default()
        };
        assert!(matches!(
            Settings::resolve_with(&overrides, env_from(&[])),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            Settings::resolve_with(&Overrides::default(), env_from(&[("KEG_JOBS", "many")])),
            Err(ConfigError::Settings { .. })
        ));

        let zero = Overrides {
            jobs: Some(0),
            ..Default::default()
        };
        assert!(Settings::resolve_with(&zero, env_from(&[])).is_err());

        let dir = TempDir::new().unwrap();
        let config = dir.path().join("keg.toml");
        fs::write(&config, "bottles = true\n").unwrap();
        let overrides = Overrides {
            config: Some(config),
            ..Default::default()
        };
        assert!(matches!(
            Settings::resolve_with(&overrides, env_from(&[])),
            Err(ConfigError::Settings { .. })
        ));
    }
}
