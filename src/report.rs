//! Terminal and JSON rendering of run results.

use crate::pipeline::{Outcome, RunReport, Status};
use colored::{Colorize, control};
use serde::Serialize;

/// Configure `colored` from `NO_COLOR`, `CLICOLOR_FORCE`, `CLICOLOR` and
/// whether stdout is a terminal, in that order of precedence.
pub fn init_colors() {
    if std::env::var_os("NO_COLOR").is_some() {
        control::set_override(false);
        return;
    }

    if std::env::var("CLICOLOR_FORCE").is_ok_and(|v| v != "0") {
        control::set_override(true);
        return;
    }

    if std::env::var("CLICOLOR").is_ok_and(|v| v == "0") {
        control::set_override(false);
        return;
    }

    let is_tty = std::io::IsTerminal::is_terminal(&std::io::stdout());
    control::set_override(is_tty);
}

/// Lines of captured output shown under a failure.
const OUTPUT_TAIL: usize = 20;

#[derive(Debug, Serialize)]
pub struct JsonReport<'a> {
    pub mode: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_failure: Option<&'a str>,
    pub formulae: Vec<JsonEntry<'a>>,
}

#[derive(Debug, Serialize)]
pub struct JsonEntry<'a> {
    pub name: &'a str,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependency: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub post_install_errors: Vec<String>,
}

impl<'a> JsonReport<'a> {
    pub fn new(report: &'a RunReport) -> Self {
        let formulae = report
            .iter()
            .map(|(name, outcome)| {
                let mut entry = JsonEntry {
                    name,
                    status: outcome.status(),
                    step: None,
                    command: None,
                    exit_code: None,
                    stderr: None,
                    dependency: None,
                    post_install_errors: vec![],
                };
                match outcome {
                    Outcome::Failed(err) => {
                        entry.step = Some(err.step);
                        entry.command = Some(&err.command);
                        entry.exit_code = err.status;
                        entry.stderr = Some(&err.stderr);
                    }
                    Outcome::DependencyFailed { dependency } => {
                        entry.dependency = Some(dependency);
                    }
                    Outcome::Installed {
                        post_install_errors,
                        ..
                    } => {
                        entry.post_install_errors =
                            post_install_errors.iter().map(|e| e.to_string()).collect();
                    }
                    Outcome::AlreadyInstalled | Outcome::Cancelled => {}
                }
                entry
            })
            .collect();

        Self {
            mode: report.mode.to_string(),
            success: report.is_success(),
            first_failure: report.first_failure(),
            formulae,
        }
    }
}

pub fn to_json(report: &RunReport) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&JsonReport::new(report))
}

fn marker(status: Status) -> colored::ColoredString {
    match status {
        Status::Installed => "✓".green(),
        Status::Skipped => "•".cyan(),
        Status::Failed => "✗".red(),
        Status::DependencyFailed => "↷".yellow(),
        Status::Cancelled => "-".dimmed(),
    }
}

/// One line per formula plus failure details and a summary.
pub fn print_report(report: &RunReport) {
    for (name, outcome) in report.iter() {
        let status = outcome.status();
        match outcome {
            Outcome::Installed {
                post_install_errors,
                linked,
            } => {
                let note = if *linked { "installed" } else { "built (not linked)" };
                println!("  {} {} {}", marker(status), name.bold(), note);
                for err in post_install_errors {
                    println!("    {} {}", "⚠".yellow(), err);
                }
            }
            Outcome::AlreadyInstalled => {
                println!("  {} {} already installed, skipped", marker(status), name.bold());
            }
            Outcome::Failed(err) => {
                println!("  {} {} {}", marker(status), name.bold(), err);
                for line in tail(&err.stderr, OUTPUT_TAIL) {
                    println!("    {}", line.dimmed());
                }
            }
            Outcome::DependencyFailed { dependency } => {
                println!(
                    "  {} {} skipped, dependency {} did not succeed",
                    marker(status),
                    name.bold(),
                    dependency.cyan()
                );
            }
            Outcome::Cancelled => {
                println!("  {} {} cancelled", marker(status), name.bold());
            }
        }
    }

    println!();
    println!("{}", summary(report));
}

pub fn summary(report: &RunReport) -> String {
    let mut parts = Vec::new();
    for status in [
        Status::Installed,
        Status::Skipped,
        Status::Failed,
        Status::DependencyFailed,
        Status::Cancelled,
    ] {
        let count = report.count(status);
        if count > 0 {
            parts.push(format!("{count} {status}"));
        }
    }
    if parts.is_empty() {
        parts.push("nothing to do".to_string());
    }

    let line = parts.join(", ");
    if report.is_success() {
        format!("{} {}", "==>".green().bold(), line)
    } else {
        format!("{} {}", "==>".red().bold(), line)
    }
}

fn tail(text: &str, lines: usize) -> Vec<&str> {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].to_vec()
}
