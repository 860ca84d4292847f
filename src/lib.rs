//! Library interface for kegworks (keg), a from-source formula build
//! orchestrator.
//!
//! Formulae are TOML records loaded into a [`FormulaRegistry`], resolved into
//! a [`BuildPlan`] and executed by the [`Pipeline`] into a prefix laid out by
//! [`Layout`].

pub mod cellar;
pub mod commands;
pub mod config;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod formula;
pub mod pipeline;
pub mod placeholder;
pub mod progress;
pub mod receipt;
pub mod registry;
pub mod report;
pub mod resolve;
pub mod runner;
pub mod symlink;
pub mod verify;

pub use cellar::Layout;
pub use config::Settings;
pub use error::{ConfigError, KegError, Result};
pub use formula::Formula;
pub use pipeline::{CancelToken, Mode, Outcome, Pipeline, PipelineOptions, RunReport, Status};
pub use registry::FormulaRegistry;
pub use resolve::{BuildPlan, DependencyGraph, resolve};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, SystemRunner};
