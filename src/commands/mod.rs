//! Command implementations for the keg CLI.
//!
//! - **install**: `build`, `install` and `fetch`
//! - **query**: `deps`, `uses` and `list`
//! - **test**: `test`

pub mod install;
pub mod query;
pub mod test;

pub use install::{build, fetch, install};
pub use query::{deps, list, uses};
pub use test::test;

use crate::config::{Overrides, Settings};
use crate::error::Result;
use crate::pipeline::{CancelToken, Pipeline, PipelineOptions};
use crate::progress;
use crate::registry::FormulaRegistry;
use crate::runner::{CommandRunner, SystemRunner};
use std::sync::Arc;
use tracing::debug;

/// Name of the first formula that did not succeed, `None` on full success.
pub type FirstFailure = Option<String>;

/// Everything a command needs, resolved once from flags, environment and
/// the settings file.
pub struct Context {
    pub settings: Settings,
    pub registry: FormulaRegistry,
    pub runner: Arc<dyn CommandRunner>,
    pub cancel: CancelToken,
    /// Print machine-readable JSON instead of human output.
    pub json: bool,
}

impl Context {
    pub fn load(overrides: &Overrides, json: bool) -> Result<Self> {
        let settings = Settings::resolve(overrides)?;
        Self::from_settings(settings, Arc::new(SystemRunner), json)
    }

    pub fn from_settings(
        settings: Settings,
        runner: Arc<dyn CommandRunner>,
        json: bool,
    ) -> Result<Self> {
        let registry = FormulaRegistry::load_dirs(&settings.formula_dirs)?
            .with_provided(&settings.provided);
        debug!(
            formulae = registry.len(),
            prefix = %settings.prefix.display(),
            jobs = settings.jobs,
            "loaded context"
        );

        Ok(Self {
            settings,
            registry,
            runner,
            cancel: CancelToken::new(),
            json,
        })
    }

    pub fn pipeline(&self, force: bool) -> Pipeline {
        let options = PipelineOptions {
            force,
            show_progress: !self.json && progress::should_show_progress(),
            ..PipelineOptions::from_settings(&self.settings)
        };
        Pipeline::new(self.settings.layout(), self.runner.clone(), options)
            .with_cancel_token(self.cancel.clone())
    }
}
