use crate::commands::{Context, FirstFailure};
use crate::error::Result;
use crate::pipeline::Mode;
use crate::report;
use crate::resolve::resolve;
use colored::Colorize;

/// Build formulae into their kegs without linking the requested ones.
pub async fn build(ctx: &Context, formula_names: &[String], force: bool) -> Result<FirstFailure> {
    run(ctx, formula_names, Mode::Build, force).await
}

/// Build, install and link formulae, then run their post-install steps.
pub async fn install(
    ctx: &Context,
    formula_names: &[String],
    force: bool,
) -> Result<FirstFailure> {
    run(ctx, formula_names, Mode::Install, force).await
}

async fn run(
    ctx: &Context,
    formula_names: &[String],
    mode: Mode,
    force: bool,
) -> Result<FirstFailure> {
    let plan = resolve(&ctx.registry, formula_names)?;

    if !ctx.json {
        let verb = match mode {
            Mode::Build => "Building",
            Mode::Install => "Installing",
        };
        println!(
            "{} {} {} formulae: {}",
            "==>".bold().green(),
            verb,
            plan.len().to_string().bold(),
            plan.order.join(", ").cyan()
        );
    }

    let pipeline = ctx.pipeline(force);
    let report = pipeline.run(&ctx.registry, &plan, mode).await?;

    if ctx.json {
        println!("{}", report::to_json(&report)?);
    } else {
        report::print_report(&report);
        if pipeline.cancel_token().is_cancelled() {
            println!("{} Run interrupted, in-flight builds were completed", "⚠".yellow());
        }
    }

    Ok(report.first_failure().map(str::to_string))
}

/// Fetch and verify sources for formulae and their dependencies.
pub async fn fetch(ctx: &Context, formula_names: &[String]) -> Result<FirstFailure> {
    let plan = resolve(&ctx.registry, formula_names)?;
    let fetched = ctx.pipeline(false).fetch_sources(&ctx.registry, &plan).await?;

    if ctx.json {
        let entries: Vec<serde_json::Value> = fetched
            .iter()
            .map(|(formula, path)| {
                serde_json::json!({
                    "name": formula.name,
                    "version": formula.version,
                    "sha256": formula.sha256,
                    "path": path.display().to_string(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for (formula, path) in &fetched {
            println!(
                "  {} {} {}",
                "✓".green(),
                formula.name.bold(),
                path.display().to_string().dimmed()
            );
        }
        println!(
            "{} Fetched and verified {} sources",
            "==>".bold().green(),
            fetched.len().to_string().bold()
        );
    }

    Ok(None)
}
