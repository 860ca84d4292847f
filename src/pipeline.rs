//! Build-step pipeline executor.
//!
//! A run goes through four phases:
//!
//! 1. **Satisfaction**: formulae whose keg already holds a receipt for the
//!    same version are skipped (`--force` rebuilds requested formulae). A
//!    keg left unlinked by an earlier `build` is linked without rebuilding
//!    when this run links it.
//! 2. **Fetch**: every remaining source is fetched into the download cache.
//! 3. **Verify**: every checksum is checked. A single mismatch aborts the run
//!    before any build step has run anywhere.
//! 4. **Schedule**: formulae are built in dependency order on a bounded
//!    worker pool. Independent branches run concurrently; dependents of a
//!    failed formula are skipped while unrelated branches keep going.
//!
//! Each formula is built by one worker as a single sequential unit inside its
//! own temporary directory: unpack, run install steps, write the receipt,
//! link, run post-install steps. Linking a keg first unlinks the other
//! installed versions of the formula. A failed install step rolls the keg
//! back, restoring the keg and links it replaced.
//! Post-install failures are recorded on the outcome but never fail the
//! formula.
//!
//! Only the scheduler loop writes outcomes; workers return them.

use crate::cellar::Layout;
use crate::config::Settings;
use crate::error::{BuildStepError, KegError, PostInstallError, Result};
use crate::extract;
use crate::fetch;
use crate::formula::{BuildStep, Formula, StepAction};
use crate::placeholder::Scope;
use crate::progress::BuildProgress;
use crate::receipt::{InstallReceipt, RuntimeDependency};
use crate::registry::FormulaRegistry;
use crate::resolve::BuildPlan;
use crate::runner::{CommandRunner, CommandSpec, base_environment};
use crate::symlink;
use crate::verify;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Build the requested formulae into their kegs without linking them
    /// or running their post-install steps. Dependencies are fully installed.
    Build,
    Install,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Build => write!(f, "build"),
            Mode::Install => write!(f, "install"),
        }
    }
}

/// Stops a run from scheduling further formulae. Builds already running
/// finish normally.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Maximum number of formulae building at once.
    pub jobs: usize,
    /// Rebuild requested formulae even when already installed.
    pub force: bool,
    pub cache_dir: PathBuf,
    pub show_progress: bool,
}

impl PipelineOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            jobs: settings.jobs,
            force: false,
            cache_dir: settings.cache_dir.clone(),
            show_progress: false,
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            jobs: 1,
            force: false,
            cache_dir: fetch::default_cache_dir(),
            show_progress: false,
        }
    }
}

/// What happened to one formula.
#[derive(Debug, Clone)]
pub enum Outcome {
    Installed {
        /// Non-fatal failures of post-install steps.
        post_install_errors: Vec<PostInstallError>,
        /// Whether the keg was linked into the prefix.
        linked: bool,
    },
    Failed(BuildStepError),
    /// Already satisfied by an existing keg.
    AlreadyInstalled,
    /// Not attempted because a dependency did not succeed.
    DependencyFailed { dependency: String },
    /// Not attempted because the run was cancelled.
    Cancelled,
}

impl Outcome {
    pub fn status(&self) -> Status {
        match self {
            Outcome::Installed { .. } => Status::Installed,
            Outcome::Failed(_) => Status::Failed,
            Outcome::AlreadyInstalled => Status::Skipped,
            Outcome::DependencyFailed { .. } => Status::DependencyFailed,
            Outcome::Cancelled => Status::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Installed,
    Skipped,
    Failed,
    DependencyFailed,
    Cancelled,
}

impl Status {
    pub fn is_success(self) -> bool {
        matches!(self, Status::Installed | Status::Skipped)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Installed => "installed",
            Status::Skipped => "skipped",
            Status::Failed => "failed",
            Status::DependencyFailed => "dependency-failed",
            Status::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Outcome of every formula a run considered.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub mode: Mode,
    /// Build order of the plan.
    pub order: Vec<String>,
    pub outcomes: BTreeMap<String, Outcome>,
}

impl RunReport {
    fn new(mode: Mode, order: Vec<String>) -> Self {
        Self {
            mode,
            order,
            outcomes: BTreeMap::new(),
        }
    }

    fn record(&mut self, name: &str, outcome: Outcome) {
        debug!(formula = name, status = %outcome.status(), "recorded outcome");
        self.outcomes.insert(name.to_string(), outcome);
    }

    pub fn outcome(&self, name: &str) -> Option<&Outcome> {
        self.outcomes.get(name)
    }

    pub fn status(&self, name: &str) -> Option<Status> {
        self.outcomes.get(name).map(Outcome::status)
    }

    /// Outcomes in build order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Outcome)> {
        self.order
            .iter()
            .filter_map(|name| self.outcomes.get(name).map(|o| (name.as_str(), o)))
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.values().all(|o| o.status().is_success())
    }

    /// The formula to blame for an unsuccessful run: the first failed
    /// formula in build order, else the first one that did not succeed.
    pub fn first_failure(&self) -> Option<&str> {
        self.iter()
            .find(|(_, o)| o.status() == Status::Failed)
            .or_else(|| self.iter().find(|(_, o)| !o.status().is_success()))
            .map(|(name, _)| name)
    }

    pub fn count(&self, status: Status) -> usize {
        self.outcomes
            .values()
            .filter(|o| o.status() == status)
            .count()
    }

    pub fn post_install_errors(&self) -> impl Iterator<Item = &PostInstallError> {
        self.iter().flat_map(|(_, outcome)| match outcome {
            Outcome::Installed {
                post_install_errors,
                ..
            } => post_install_errors.as_slice(),
            _ => &[],
        })
    }
}

pub struct Pipeline {
    worker: Worker,
    options: PipelineOptions,
    cancel: CancelToken,
}

impl Pipeline {
    pub fn new(layout: Layout, runner: Arc<dyn CommandRunner>, options: PipelineOptions) -> Self {
        Self {
            worker: Worker {
                layout,
                runner,
                jobs: options.jobs.max(1),
            },
            options,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn layout(&self) -> &Layout {
        &self.worker.layout
    }

    /// Fetch and verify the sources of every formula in the plan.
    pub async fn fetch_sources(
        &self,
        registry: &FormulaRegistry,
        plan: &BuildPlan,
    ) -> Result<Vec<(Arc<Formula>, PathBuf)>> {
        let formulae = plan
            .order
            .iter()
            .map(|name| registry.lookup(name).cloned())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.fetch_and_verify(&formulae).await
    }

    async fn fetch_and_verify(
        &self,
        formulae: &[Arc<Formula>],
    ) -> Result<Vec<(Arc<Formula>, PathBuf)>> {
        let sources =
            fetch::fetch_all(formulae, &self.options.cache_dir, self.options.show_progress)
                .await?;

        let to_verify = sources.clone();
        tokio::task::spawn_blocking(move || verify::verify_all(&to_verify))
            .await
            .map_err(|e| KegError::Other(e.into()))??;

        Ok(sources)
    }

    /// Run the plan. `Err` means the run was aborted before any build step
    /// ran; build failures are reported per formula in the [`RunReport`].
    pub async fn run(
        &self,
        registry: &FormulaRegistry,
        plan: &BuildPlan,
        mode: Mode,
    ) -> Result<RunReport> {
        let mut report = RunReport::new(mode, plan.order.clone());
        // `true` marks an existing keg that only needs linking
        let mut pending = Vec::new();

        for name in &plan.order {
            let formula = registry.lookup(name)?.clone();
            let forced = self.options.force && plan.is_requested(name);
            let receipt = if forced {
                None
            } else {
                self.worker.layout.receipt_for(&formula)
            };

            match receipt {
                Some(receipt) if !receipt.linked && links(mode, plan, name) => {
                    info!(formula = %name, version = %formula.version, "installed but not linked");
                    pending.push((formula, true));
                }
                Some(_) => {
                    info!(formula = %name, version = %formula.version, "already installed");
                    report.record(name, Outcome::AlreadyInstalled);
                }
                None => pending.push((formula, false)),
            }
        }

        if pending.is_empty() {
            return Ok(report);
        }

        if self.cancel.is_cancelled() {
            for (formula, _) in &pending {
                report.record(&formula.name, Outcome::Cancelled);
            }
            return Ok(report);
        }

        let builds: Vec<Arc<Formula>> = pending
            .iter()
            .filter(|(_, link_only)| !link_only)
            .map(|(formula, _)| formula.clone())
            .collect();
        let fetched = if builds.is_empty() {
            Vec::new()
        } else {
            info!(formulae = builds.len(), %mode, "fetching sources");
            self.fetch_and_verify(&builds).await?
        };
        let mut sources = fetched.into_iter();

        // Sources come back in request order
        let work = pending
            .into_iter()
            .map(|(formula, link_only)| {
                let source = if link_only {
                    None
                } else {
                    sources.next().map(|(_, path)| path)
                };
                (formula, source)
            })
            .collect();

        self.schedule(registry, plan, mode, work, &mut report).await;

        info!(
            installed = report.count(Status::Installed),
            skipped = report.count(Status::Skipped),
            failed = report.count(Status::Failed),
            dependency_failed = report.count(Status::DependencyFailed),
            cancelled = report.count(Status::Cancelled),
            "run complete"
        );
        Ok(report)
    }

    async fn schedule(
        &self,
        registry: &FormulaRegistry,
        plan: &BuildPlan,
        mode: Mode,
        work: Vec<(Arc<Formula>, Option<PathBuf>)>,
        report: &mut RunReport,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.worker.jobs));
        let mut tasks: JoinSet<Outcome> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, String> = HashMap::new();
        let mut waiting = work;
        let mut progress = BuildProgress::new(waiting.len(), self.options.show_progress);

        loop {
            if !self.cancel.is_cancelled() {
                let mut still_waiting = Vec::new();

                for (formula, source) in std::mem::take(&mut waiting) {
                    let deps = plan.graph().dependencies_of(&formula.name);

                    let failed_dep = deps
                        .iter()
                        .find(|d| report.status(d).is_some_and(|s| !s.is_success()));
                    if let Some(dep) = failed_dep {
                        warn!(
                            formula = %formula.name,
                            dependency = %dep,
                            "skipping, dependency did not succeed"
                        );
                        progress.finished(&formula.name, false);
                        report.record(
                            &formula.name,
                            Outcome::DependencyFailed {
                                dependency: dep.clone(),
                            },
                        );
                        continue;
                    }

                    let ready = deps
                        .iter()
                        .all(|d| report.status(d).is_some_and(Status::is_success));
                    if !ready {
                        still_waiting.push((formula, source));
                        continue;
                    }

                    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                        still_waiting.push((formula, source));
                        continue;
                    };

                    let job = self.job(registry, plan, mode, &formula, source);
                    let worker = self.worker.clone();
                    progress.started(&formula.name);
                    let handle = tasks.spawn_blocking(move || {
                        let _permit = permit;
                        worker.build(job)
                    });
                    running.insert(handle.id(), formula.name.clone());
                }

                waiting = still_waiting;
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };

            let (name, outcome) = match joined {
                Ok((id, outcome)) => (running.remove(&id).unwrap_or_default(), outcome),
                Err(err) => {
                    let name = running.remove(&err.id()).unwrap_or_default();
                    error!(formula = %name, error = %err, "build task aborted");
                    let outcome = Outcome::Failed(BuildStepError {
                        formula: name.clone(),
                        step: 0,
                        command: "build".into(),
                        status: None,
                        stdout: String::new(),
                        stderr: err.to_string(),
                    });
                    (name, outcome)
                }
            };

            progress.finished(&name, outcome.status().is_success());
            report.record(&name, outcome);
        }

        if !waiting.is_empty() {
            warn!(remaining = waiting.len(), "run cancelled");
        }
        for (formula, _) in waiting {
            report.record(&formula.name, Outcome::Cancelled);
        }

        progress.finish();
        debug!(elapsed = %progress.format_elapsed(), "scheduler finished");
    }

    fn job(
        &self,
        registry: &FormulaRegistry,
        plan: &BuildPlan,
        mode: Mode,
        formula: &Arc<Formula>,
        source: Option<PathBuf>,
    ) -> Job {
        let on_request = plan.is_requested(&formula.name);
        let runtime_dependencies = formula
            .runtime_dependencies
            .iter()
            .map(|dep| RuntimeDependency {
                name: dep.clone(),
                version: registry
                    .get(dep)
                    .map(|f| f.version.clone())
                    .unwrap_or_else(|| "provided".to_string()),
            })
            .collect();

        Job {
            formula: formula.clone(),
            source,
            link: links(mode, plan, &formula.name),
            on_request,
            runtime_dependencies,
        }
    }
}

/// Whether a run in `mode` links `name` into the prefix.
fn links(mode: Mode, plan: &BuildPlan, name: &str) -> bool {
    !(mode == Mode::Build && plan.is_requested(name))
}

struct Job {
    formula: Arc<Formula>,
    /// `None` for an existing keg that only needs linking.
    source: Option<PathBuf>,
    /// Link into the prefix and run post-install steps.
    link: bool,
    on_request: bool,
    runtime_dependencies: Vec<RuntimeDependency>,
}

/// A step that did not complete, before it is attributed to a formula.
struct StepFailure {
    command: String,
    status: Option<i32>,
    stdout: String,
    stderr: String,
}

impl StepFailure {
    fn message(command: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            command: command.into(),
            status: None,
            stdout: String::new(),
            stderr: message.to_string(),
        }
    }
}

/// Prefix state a build replaced, put back by [`Worker::rollback`].
#[derive(Debug, Default)]
struct Displaced {
    /// The new keg directory was created.
    created: bool,
    /// Previous keg of the same version, moved aside.
    backup: Option<PathBuf>,
    /// Versions whose prefix links were removed.
    unlinked: Vec<String>,
    /// Version `opt/<name>` pointed at.
    opt: Option<String>,
}

#[derive(Clone)]
struct Worker {
    layout: Layout,
    runner: Arc<dyn CommandRunner>,
    jobs: usize,
}

impl Worker {
    fn build(&self, job: Job) -> Outcome {
        let formula = &job.formula;
        info!(formula = %formula.name, version = %formula.version, "building");

        // Dropped on every return path, taking the sources with it
        let workdir = match TempDir::new() {
            Ok(dir) => dir,
            Err(e) => {
                return Outcome::Failed(build_error(
                    formula,
                    0,
                    StepFailure::message("create build directory", e),
                ));
            }
        };

        let scope = self.layout.scope(formula, self.jobs);
        let env = base_environment(self.layout.root());

        let src_root = match &job.source {
            Some(source) => {
                let mut displaced = Displaced::default();
                let installed =
                    self.install_keg(&job, source, &mut displaced, &scope, &env, workdir.path());
                match installed {
                    Ok(root) => root,
                    Err(err) => {
                        error!(formula = %formula.name, error = %err, "build failed");
                        self.rollback(formula, displaced);
                        return Outcome::Failed(err);
                    }
                }
            }
            None => match self.link_existing(formula) {
                // Post-install steps of an existing keg run in the empty build dir
                Ok(()) => workdir.path().to_path_buf(),
                Err(err) => {
                    error!(formula = %formula.name, error = %err, "linking failed");
                    return Outcome::Failed(err);
                }
            },
        };

        let post_install_errors = if job.link {
            self.post_install(formula, &scope, &env, &src_root)
        } else {
            debug!(formula = %formula.name, "build only, skipping post-install");
            vec![]
        };

        info!(formula = %formula.name, "installed");
        Outcome::Installed {
            post_install_errors,
            linked: job.link,
        }
    }

    /// Everything up to and including linking. Returns the source root.
    fn install_keg(
        &self,
        job: &Job,
        source: &Path,
        displaced: &mut Displaced,
        scope: &Scope,
        env: &BTreeMap<String, String>,
        workdir: &Path,
    ) -> std::result::Result<PathBuf, BuildStepError> {
        let formula = &job.formula;
        let keg = self.layout.keg_for(formula);
        let prepare = |failure: StepFailure| build_error(formula, 0, failure);
        let prepare_err = |command: &str, e: anyhow::Error| {
            prepare(StepFailure::message(command, format!("{e:#}")))
        };

        displaced.opt = symlink::opt_version(&self.layout, &formula.name);

        if keg.exists() {
            let backup = self.layout.backup_keg(&formula.name, &formula.version);
            debug!(keg = %keg.display(), backup = %backup.display(), "moving previous keg aside");

            let removed = symlink::unlink_keg(&self.layout, &formula.name, &formula.version)
                .map_err(|e| prepare_err("unlink previous keg", e))?;
            if self.has_prefix_links(&formula.name, &removed) {
                displaced.unlinked.push(formula.version.clone());
            }

            // Left behind by an interrupted run
            if backup.exists() {
                fs::remove_dir_all(&backup)
                    .map_err(|e| prepare(StepFailure::message("remove stale backup", e)))?;
            }
            fs::rename(&keg, &backup)
                .map_err(|e| prepare(StepFailure::message("move previous keg aside", e)))?;
            displaced.backup = Some(backup);
        }

        let filename = formula.source_filename();
        let src_root = extract::unpack_source(source, &filename, &workdir.join("src"))
            .map_err(|e| prepare_err(&format!("unpack {filename}"), e))?;

        fs::create_dir_all(&keg).map_err(|e| prepare(StepFailure::message("create keg", e)))?;
        displaced.created = true;

        for (index, step) in formula.install.iter().enumerate() {
            self.run_step(scope, env, &src_root, step)
                .map_err(|failure| build_error(formula, index + 1, failure))?;
        }

        let finalize = formula.install.len() + 1;
        let finish = |command: &str, e: anyhow::Error| {
            build_error(formula, finalize, StepFailure::message(command, format!("{e:#}")))
        };

        let mut receipt =
            InstallReceipt::new(formula, job.runtime_dependencies.clone(), job.on_request);
        receipt.linked = job.link;
        receipt.write(&keg).map_err(|e| finish("write receipt", e))?;

        symlink::link_opt(&self.layout, &formula.name, &formula.version)
            .map_err(|e| finish("link opt", e))?;

        if job.link {
            let others = self
                .unlink_other_versions(formula)
                .map_err(|e| finish("unlink other versions", e))?;
            displaced.unlinked.extend(others);

            let linked = symlink::link_keg(&self.layout, &formula.name, &formula.version)
                .map_err(|e| finish("link", e))?;
            debug!(formula = %formula.name, files = linked.len(), "linked into prefix");
            self.mark_unlinked(formula, &displaced.unlinked);
        }

        if let Some(backup) = displaced.backup.take()
            && let Err(e) = fs::remove_dir_all(&backup)
        {
            warn!(backup = %backup.display(), error = %e, "failed to remove previous keg");
        }

        Ok(src_root)
    }

    /// Link a keg left unlinked by a build-only run.
    fn link_existing(&self, formula: &Formula) -> std::result::Result<(), BuildStepError> {
        let fail = |command: &str, e: anyhow::Error| {
            build_error(formula, 0, StepFailure::message(command, format!("{e:#}")))
        };

        let others = self
            .unlink_other_versions(formula)
            .map_err(|e| fail("unlink other versions", e))?;
        symlink::link_opt(&self.layout, &formula.name, &formula.version)
            .map_err(|e| fail("link opt", e))?;
        let linked = symlink::link_keg(&self.layout, &formula.name, &formula.version)
            .map_err(|e| fail("link", e))?;
        InstallReceipt::set_linked(&self.layout.keg_for(formula), true)
            .map_err(|e| fail("update receipt", e))?;

        debug!(formula = %formula.name, files = linked.len(), "linked existing keg");
        self.mark_unlinked(formula, &others);
        Ok(())
    }

    /// Remove the prefix links of every other installed version of the
    /// formula. Returns the versions that had links.
    fn unlink_other_versions(&self, formula: &Formula) -> anyhow::Result<Vec<String>> {
        let mut unlinked = Vec::new();
        for other in self.layout.installed_versions(&formula.name)? {
            if other.version == formula.version {
                continue;
            }
            let removed = symlink::unlink_keg(&self.layout, &formula.name, &other.version)?;
            if self.has_prefix_links(&formula.name, &removed) {
                debug!(formula = %formula.name, version = %other.version, "unlinked other version");
                unlinked.push(other.version);
            }
        }
        Ok(unlinked)
    }

    /// Whether `removed` holds links other than `opt/<name>`.
    fn has_prefix_links(&self, name: &str, removed: &[PathBuf]) -> bool {
        let opt = self.layout.opt(name);
        removed.iter().any(|path| *path != opt)
    }

    fn mark_unlinked(&self, formula: &Formula, versions: &[String]) {
        for version in versions.iter().filter(|v| **v != formula.version) {
            let keg = self.layout.keg(&formula.name, version);
            if let Err(e) = InstallReceipt::set_linked(&keg, false) {
                warn!(keg = %keg.display(), error = %e, "failed to update receipt");
            }
        }
    }

    fn run_step(
        &self,
        scope: &Scope,
        env: &BTreeMap<String, String>,
        src_root: &Path,
        step: &BuildStep,
    ) -> std::result::Result<(), StepFailure> {
        let cwd = match &step.cwd {
            Some(rel) => src_root.join(rel),
            None => src_root.to_path_buf(),
        };
        fs::create_dir_all(&cwd).map_err(|e| StepFailure::message(step.describe(), e))?;

        match &step.action {
            StepAction::Run { argv } => {
                let mut step_env = env.clone();
                step_env.extend(step.env.clone());
                let spec = CommandSpec::expand(argv, scope, &cwd, step_env)
                    .map_err(|e| StepFailure::message(step.describe(), e))?;
                let command = spec.display();

                debug!(command = %command, cwd = %cwd.display(), "running step");
                let output = self.runner.run(&spec).map_err(|e| {
                    StepFailure::message(command.clone(), format!("failed to start: {e}"))
                })?;

                if output.is_success() {
                    Ok(())
                } else {
                    Err(StepFailure {
                        command,
                        status: output.status,
                        stdout: output.stdout,
                        stderr: output.stderr,
                    })
                }
            }
            StepAction::Symlink { pattern, into } => {
                let command = step.describe();
                let pattern = scope
                    .expand(pattern)
                    .map_err(|e| StepFailure::message(command.clone(), e))?;
                let into = scope
                    .expand(into)
                    .map_err(|e| StepFailure::message(command.clone(), e))?;

                let pattern = if Path::new(&pattern).is_relative() {
                    cwd.join(&pattern).display().to_string()
                } else {
                    pattern
                };
                let into = cwd.join(into);

                debug!(pattern = %pattern, into = %into.display(), "symlinking");
                symlink::symlink_matches(&pattern, &into)
                    .map_err(|e| StepFailure::message(command, format!("{e:#}")))?;
                Ok(())
            }
        }
    }

    fn post_install(
        &self,
        formula: &Formula,
        scope: &Scope,
        env: &BTreeMap<String, String>,
        src_root: &Path,
    ) -> Vec<PostInstallError> {
        formula
            .post_install
            .iter()
            .enumerate()
            .filter_map(|(index, step)| {
                let failure = self.run_step(scope, env, src_root, step).err()?;
                let err = PostInstallError {
                    formula: formula.name.clone(),
                    step: index + 1,
                    command: failure.command,
                    status: failure.status,
                    stderr: failure.stderr,
                };
                warn!(formula = %formula.name, error = %err, "post-install step failed");
                Some(err)
            })
            .collect()
    }

    /// Remove a partially installed keg and any links into it, then put back
    /// the keg and links it displaced.
    fn rollback(&self, formula: &Formula, displaced: Displaced) {
        let name = &formula.name;
        let keg = self.layout.keg_for(formula);

        if displaced.created {
            if let Err(e) = symlink::unlink_keg(&self.layout, name, &formula.version) {
                warn!(formula = %name, error = %e, "failed to unlink during rollback");
            }
            if keg.exists()
                && let Err(e) = fs::remove_dir_all(&keg)
            {
                warn!(keg = %keg.display(), error = %e, "failed to remove keg during rollback");
            }
        }

        if let Some(backup) = &displaced.backup
            && let Err(e) = fs::rename(backup, &keg)
        {
            warn!(backup = %backup.display(), error = %e, "failed to restore previous keg");
        }

        for version in &displaced.unlinked {
            if let Err(e) = symlink::link_keg(&self.layout, name, version) {
                warn!(formula = %name, %version, error = %e, "failed to relink during rollback");
            }
        }
        if let Some(version) = &displaced.opt
            && self.layout.keg(name, version).is_dir()
            && let Err(e) = symlink::link_opt(&self.layout, name, version)
        {
            warn!(formula = %name, %version, error = %e, "failed to restore opt link");
        }

        // Only succeeds when no other version is installed
        if let Some(parent) = keg.parent() {
            let _ = fs::remove_dir(parent);
        }

        info!(formula = %name, "rolled back");
    }
}

fn build_error(formula: &Formula, step: usize, failure: StepFailure) -> BuildStepError {
    BuildStepError {
        formula: formula.name.clone(),
        step,
        command: failure.command,
        status: failure.status,
        stdout: failure.stdout,
        stderr: failure.stderr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(name: &str) -> Outcome {
        Outcome::Failed(BuildStepError {
            formula: name.into(),
            step: 1,
            command: "ninja".into(),
            status: Some(1),
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    fn installed() -> Outcome {
        Outcome::Installed {
            post_install_errors: vec![],
            linked: true,
        }
    }

    #[test]
    fn test_first_failure_follows_build_order() {
        let mut report = RunReport::new(
            Mode::Install,
            vec!["a".into(), "c".into(), "b".into(), "d".into()],
        );
        report.record("a", installed());
        report.record(
            "c",
            Outcome::DependencyFailed {
                dependency: "x".into(),
            },
        );
        report.record("b", failed("b"));
        report.record("d", failed("d"));

        assert!(!report.is_success());
        assert_eq!(report.first_failure(), Some("b"));
        assert_eq!(report.count(Status::Failed), 2);
    }

    #[test]
    fn test_success_includes_skipped() {
        let mut report = RunReport::new(Mode::Install, vec!["a".into(), "b".into()]);
        report.record("a", Outcome::AlreadyInstalled);
        report.record("b", installed());
        assert!(report.is_success());
        assert_eq!(report.first_failure(), None);
        assert_eq!(report.status("a"), Some(Status::Skipped));
    }

    #[test]
    fn test_cancelled_run_blames_first_cancelled() {
        let mut report = RunReport::new(Mode::Build, vec!["a".into(), "b".into()]);
        report.record("a", installed());
        report.record("b", Outcome::Cancelled);
        assert_eq!(report.first_failure(), Some("b"));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::DependencyFailed.to_string(), "dependency-failed");
        assert_eq!(Status::Skipped.to_string(), "skipped");
        assert_eq!(
            serde_json::to_string(&Status::DependencyFailed).unwrap(),
            "\"dependency-failed\""
        );
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_post_install_errors_collected() {
        let mut report = RunReport::new(Mode::Install, vec!["a".into()]);
        report.record(
            "a",
            Outcome::Installed {
                post_install_errors: vec![PostInstallError {
                    formula: "a".into(),
                    step: 1,
                    command: "lpadmin".into(),
                    status: Some(1),
                    stderr: String::new(),
                }],
                linked: true,
            },
        );
        assert!(report.is_success());
        assert_eq!(report.post_install_errors().count(), 1);
    }
}
