use crate::commands::{Context, FirstFailure};
use crate::error::Result;
use crate::runner::base_environment;
use crate::verify::run_smoke_test;
use colored::Colorize;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Serialize)]
struct TestEntry {
    name: String,
    passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Run the smoke test of installed formulae.
pub fn test(ctx: &Context, formula_names: &[String]) -> Result<FirstFailure> {
    let layout = ctx.settings.layout();
    let env = base_environment(layout.root());
    let mut entries = Vec::new();

    for name in formula_names {
        let formula = ctx.registry.lookup(name)?;

        let result = if !layout.is_installed(formula) {
            Err(format!("{} is not installed", formula.name))
        } else {
            let scope = layout.scope(formula, ctx.settings.jobs);
            match run_smoke_test(formula, &scope, &env, ctx.runner.as_ref()) {
                Ok(Some(_)) => Ok(true),
                Ok(None) => Ok(false),
                Err(e) => {
                    warn!(formula = %formula.name, stderr = %e.stderr, "test failed");
                    Err(e.to_string())
                }
            }
        };

        if !ctx.json {
            match &result {
                Ok(true) => println!("  {} {} test passed", "✓".green(), formula.name.bold()),
                Ok(false) => println!(
                    "  {} {} has no test",
                    "•".cyan(),
                    formula.name.bold()
                ),
                Err(e) => println!("  {} {}", "✗".red(), e),
            }
        }

        entries.push(TestEntry {
            name: formula.name.clone(),
            passed: result.is_ok(),
            error: result.err(),
        });
    }

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    }

    Ok(entries
        .into_iter()
        .find(|e| !e.passed)
        .map(|e| e.name))
}
