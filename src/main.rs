use clap::{CommandFactory, Parser, Subcommand};
use colored::Colorize;
use kegworks::commands::{self, Context, FirstFailure};
use kegworks::config::Overrides;
use kegworks::error::KegError;
use kegworks::report;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, warn};

#[derive(Parser)]
#[command(name = "keg")]
#[command(author, version, about = "Builds and installs formulae from source in dependency order", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory of formula files (repeatable)
    #[arg(long = "formula-dir", short = 'F', global = true)]
    formula_dirs: Vec<PathBuf>,

    /// Settings file to use instead of the default lookup
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Installation prefix
    #[arg(long, global = true)]
    prefix: Option<PathBuf>,

    /// Number of formulae built concurrently
    #[arg(long, short = 'j', global = true)]
    jobs: Option<usize>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build formulae and their dependencies without linking the requested ones
    Build {
        /// Formula names
        #[arg(required = true)]
        formulae: Vec<String>,

        /// Rebuild even if already installed
        #[arg(long)]
        force: bool,
    },

    /// Build, install and link formulae and their dependencies
    Install {
        /// Formula names
        #[arg(required = true)]
        formulae: Vec<String>,

        /// Reinstall even if already installed
        #[arg(long)]
        force: bool,
    },

    /// Run the smoke test of installed formulae
    Test {
        /// Formula names
        #[arg(required = true)]
        formulae: Vec<String>,
    },

    /// Download and verify sources without building
    Fetch {
        /// Formula names
        #[arg(required = true)]
        formulae: Vec<String>,
    },

    /// Show the resolved build order of a formula
    Deps {
        /// Formula name
        formula: String,

        /// Show as tree
        #[arg(long)]
        tree: bool,
    },

    /// Show formulae that depend on a formula
    Uses {
        /// Formula name
        formula: String,

        /// Include indirect dependents
        #[arg(long)]
        recursive: bool,
    },

    /// List installed kegs
    List {
        /// Show all installed versions
        #[arg(long)]
        versions: bool,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    report::init_colors();

    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "keg", &mut std::io::stdout());
        return Ok(ExitCode::SUCCESS);
    }

    let overrides = Overrides {
        config: cli.config.clone(),
        prefix: cli.prefix.clone(),
        jobs: cli.jobs,
        formula_dirs: cli.formula_dirs.clone(),
    };

    match run(cli.command, &overrides, cli.json).await {
        Ok(None) => Ok(ExitCode::SUCCESS),
        Ok(Some(failed)) => {
            eprintln!("{} {} failed", "Error:".red().bold(), failed.bold());
            Ok(ExitCode::FAILURE)
        }
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            if let Some(formula) = e.formula() {
                eprintln!("{} {} failed", "Error:".red().bold(), formula.bold());
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run(
    command: Commands,
    overrides: &Overrides,
    json: bool,
) -> Result<FirstFailure, KegError> {
    let ctx = Context::load(overrides, json)?;

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, waiting for running builds to finish");
            cancel.cancel();
        }
    });

    match command {
        Commands::Build { formulae, force } => commands::build(&ctx, &formulae, force).await,
        Commands::Install { formulae, force } => commands::install(&ctx, &formulae, force).await,
        Commands::Test { formulae } => commands::test(&ctx, &formulae),
        Commands::Fetch { formulae } => commands::fetch(&ctx, &formulae).await,
        Commands::Deps { formula, tree } => commands::deps(&ctx, &formula, tree).map(|_| None),
        Commands::Uses { formula, recursive } => {
            commands::uses(&ctx, &formula, recursive).map(|_| None)
        }
        Commands::List { versions } => commands::list(&ctx, versions).map(|_| None),
        Commands::Completions { .. } => {
            debug!("completions handled before loading context");
            Ok(None)
        }
    }
}
