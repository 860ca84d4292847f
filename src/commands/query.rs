//! Read-only commands over the formula registry and the Cellar.

use crate::cellar::format_size;
use crate::commands::Context;
use crate::error::Result;
use crate::formula::DependencyKind;
use crate::resolve::{DependencyGraph, resolve};
use colored::Colorize;
use std::collections::BTreeSet;

/// Print the resolved build order for a formula, or its dependency tree.
pub fn deps(ctx: &Context, formula: &str, tree: bool) -> Result<()> {
    let plan = resolve(&ctx.registry, &[formula])?;
    let root = ctx.registry.lookup(formula)?.name.clone();

    if ctx.json {
        let value = serde_json::json!({
            "formula": root,
            "order": plan.order,
            "edges": plan.graph().edges(),
            "provided": provided_dependencies(ctx, &plan.order),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    if tree {
        println!("{}", root.bold().green());
        print_tree(ctx, plan.graph(), &root, "");
        return Ok(());
    }

    let deps: Vec<&String> = plan.order.iter().filter(|n| **n != root).collect();
    if deps.is_empty() {
        println!("{} No dependencies", "✓".green());
    }
    for dep in deps {
        println!("{dep}");
    }
    for dep in provided_dependencies(ctx, &plan.order) {
        println!("{} {}", dep, "(provided)".dimmed());
    }
    Ok(())
}

fn provided_dependencies(ctx: &Context, names: &[String]) -> BTreeSet<String> {
    names
        .iter()
        .filter_map(|name| ctx.registry.get(name))
        .flat_map(|f| f.dependencies())
        .map(|(dep, _)| dep)
        .filter(|dep| ctx.registry.get(dep).is_none() && ctx.registry.is_provided(dep))
        .collect()
}

fn print_tree(ctx: &Context, graph: &DependencyGraph, name: &str, indent: &str) {
    let Some(formula) = ctx.registry.get(name) else {
        return;
    };
    let children = formula.dependencies();
    let len = children.len();

    for (i, (dep, kind)) in children.into_iter().enumerate() {
        let last = i == len - 1;
        let branch = if last { "└─" } else { "├─" };
        let mut label = dep.clone();
        if kind == DependencyKind::Build {
            label.push_str(&format!(" {}", "[build]".dimmed()));
        }
        if !graph.contains(&dep) {
            label.push_str(&format!(" {}", "(provided)".dimmed()));
        }
        println!("{indent}{branch} {label}");

        let next = format!("{indent}{}", if last { "   " } else { "│  " });
        print_tree(ctx, graph, &dep, &next);
    }
}

/// Print the formulae that depend on `formula`, directly or transitively.
pub fn uses(ctx: &Context, formula: &str, recursive: bool) -> Result<()> {
    let name = ctx.registry.lookup(formula)?.name.clone();
    let graph = DependencyGraph::from_registry(&ctx.registry)?;

    let dependents: Vec<String> = if recursive {
        graph.transitive_dependents(&name).into_iter().collect()
    } else {
        graph.dependents_of(&name)
    };

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&dependents)?);
    } else if dependents.is_empty() {
        println!("{} No formulae depend on {}", "✓".green(), name.bold());
    } else {
        for dependent in dependents {
            match graph.edge_kind(&dependent, &name) {
                Some(DependencyKind::Build) => {
                    println!("{} {}", dependent, "[build]".dimmed())
                }
                _ => println!("{dependent}"),
            }
        }
    }
    Ok(())
}

/// List installed kegs.
pub fn list(ctx: &Context, versions: bool) -> Result<()> {
    let layout = ctx.settings.layout();
    let mut kegs = layout.list_installed()?;

    if !versions {
        // Newest version per formula comes first
        let mut seen = BTreeSet::new();
        kegs.retain(|k| seen.insert(k.name.clone()));
    }

    if ctx.json {
        let entries: Vec<serde_json::Value> = kegs
            .iter()
            .map(|k| {
                serde_json::json!({
                    "name": k.name,
                    "version": k.version,
                    "complete": k.receipt.is_some(),
                    "installed_on_request": k.installed_on_request(),
                    "size": k.disk_usage(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if kegs.is_empty() {
        println!("No formulae installed in {}", layout.root().display());
        return Ok(());
    }

    for keg in &kegs {
        let mut line = format!("{} {}", keg.name.bold(), keg.version.dimmed());
        if versions {
            line.push_str(&format!(" {}", format_size(keg.disk_usage()).dimmed()));
        }
        if keg.receipt.is_none() {
            line.push_str(&format!(" {}", "(incomplete)".red()));
        } else if !keg.installed_on_request() {
            line.push_str(&format!(" {}", "(dependency)".dimmed()));
        }
        println!("{line}");
    }
    Ok(())
}
