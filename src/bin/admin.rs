//! Process Runtime Admin CLI
//!
//! Replays JSON scenario scripts against an in-memory runtime and prints the
//! resulting activity instance tree, and shows the effective configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use process_runtime::engine::{ReplayReport, ReplayScript, ScriptRunner};
use process_runtime::{ActivityInstance, ActivityInstanceTree, EngineConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "process-admin")]
#[command(about = "Process Runtime Admin CLI - replay execution scenarios and inspect configuration")]
#[command(version = "0.1")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, env = "PROCESS_RUNTIME_CONFIG")]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scenario script and print the resulting instance tree
    Replay {
        /// Path to the JSON script
        script: PathBuf,

        /// Print the report as JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let _ = dotenv::dotenv();

    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref()).context("loading configuration")?;

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Replay { script, json } => replay(config, &script, json).await?,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn replay(config: EngineConfig, path: &Path, json: bool) -> Result<()> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let script = ReplayScript::from_json(&raw)?;
    info!(script = %path.display(), steps = script.steps.len(), "replaying script");

    let runner = ScriptRunner::new(config);
    let report = runner.replay(&script).await?;
    if report.failed_steps() > 0 {
        warn!(failed = report.failed_steps(), "some steps were rejected");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &ReplayReport) {
    println!("{} {}", "Process instance".bold(), report.process_instance_id);
    println!();

    for step in &report.steps {
        let marker = match &step.error {
            None => "✓".green(),
            Some(_) => "✗".red(),
        };
        print!("  {} {:>2}. {}", marker, step.index + 1, step.description);
        if let Some(detail) = &step.detail {
            print!(" {}", format!("[{}]", detail).dimmed());
        }
        println!();
        if let Some(error) = &step.error {
            println!("        {}", error.red());
        }
    }
    println!();

    let state = report.suspension.to_string();
    let state = if report.suspension.is_suspended() { state.yellow() } else { state.green() };
    println!("{} {}", "State:".bold(), state);

    if !report.variables.is_empty() {
        println!("{}", "Variables:".bold());
        for (name, value) in &report.variables {
            println!("  {} = {}", name.cyan(), value);
        }
    }

    match &report.activity_instances {
        Some(tree) => {
            println!("{}", "Activity instances:".bold());
            print_instance(tree, tree.root(), 1);
        }
        None => println!("{}", "Process instance has ended".dimmed()),
    }
}

fn print_instance(tree: &ActivityInstanceTree, instance: &ActivityInstance, depth: usize) {
    let indent = "  ".repeat(depth);
    println!(
        "{}{} {}",
        indent,
        instance.activity_id.as_str().cyan(),
        format!("({} execution(s))", instance.execution_ids.len()).dimmed()
    );
    for transition in tree.child_transition_instances(instance) {
        println!(
            "{}  {} {} {}",
            indent,
            "↷".yellow(),
            transition.activity_id.as_ref().map(|a| a.as_str()).unwrap_or("?"),
            format!("async {:?}", transition.async_marker).dimmed()
        );
    }
    for child in tree.child_activity_instances(instance) {
        print_instance(tree, child, depth + 1);
    }
}
