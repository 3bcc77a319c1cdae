//! `rust_scope` command-line entry point.
//!
//! Works on a model file with the simulated driver catalog:
//!
//! ```text
//! rust_scope check models/widefield.yaml
//! rust_scope order models/widefield.yaml
//! rust_scope affects models/widefield.yaml Camera
//! rust_scope up models/widefield.yaml --hold
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use rust_scope::prelude::*;
use rust_scope::logging;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Microscope hardware composition and lifecycle engine
#[derive(Debug, Parser)]
#[command(name = "rust_scope")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Override the configured log level (trace, debug, info, warn, error).
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Emit logs and reports as JSON.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate a model file without touching hardware.
    Check {
        /// Model file (YAML or TOML).
        model: PathBuf,
    },
    /// Print the initialization order.
    Order { model: PathBuf },
    /// Show the affects relationships of one component.
    Affects { model: PathBuf, name: String },
    /// Bring the system up with simulated drivers, report, and shut it down.
    Up {
        model: PathBuf,
        /// Keep the system up until Ctrl-C.
        #[arg(long)]
        hold: bool,
    },
}

impl Command {
    fn model(&self) -> &PathBuf {
        match self {
            Command::Check { model }
            | Command::Order { model }
            | Command::Affects { model, .. }
            | Command::Up { model, .. } => model,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let model = ModelConfig::load_from(cli.command.model())
        .with_context(|| format!("loading {}", cli.command.model().display()))?;
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| model.engine.log_level.clone());
    logging::init(&level, cli.json)?;

    match cli.command {
        Command::Check { .. } => {
            let graph = ComponentGraph::build(model.components)?;
            println!("ok: {} components", graph.len());
            Ok(ExitCode::SUCCESS)
        }
        Command::Order { .. } => {
            let graph = ComponentGraph::build(model.components)?;
            for (i, name) in graph.init_order().iter().enumerate() {
                println!("{:>3}. {}", i + 1, name);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Affects { name, .. } => {
            let system = MicroscopeSystem::from_config(model, DriverCatalog::with_simulated())?;
            println!("{} affects: {:?}", name, system.affects(&name)?);
            println!("{} is affected by: {:?}", name, system.affected_by(&name)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Up { hold, .. } => up(model, hold, cli.json).await,
    }
}

async fn up(model: ModelConfig, hold: bool, json: bool) -> Result<ExitCode> {
    let system = MicroscopeSystem::from_config(model, DriverCatalog::with_simulated())?;

    let cancel = system.cancel_handle();
    let abort = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let report = system.start().await?;
    abort.abort();
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("live:      {}", report.live.join(", "));
        for failed in &report.failed {
            println!("failed:    {} ({})", failed.name, failed.cause);
        }
        for warning in &report.warnings {
            println!("warning:   {}", warning);
        }
        if !report.cancelled.is_empty() {
            println!("cancelled: {}", report.cancelled.join(", "));
        }
    }

    if hold && !system.cancel_handle().is_cancelled() {
        info!("system up, press Ctrl-C to shut down");
        tokio::signal::ctrl_c().await?;
    }

    let shutdown = system.stop().await;
    for err in &shutdown.errors {
        warn!(error = %err, "shutdown error");
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&shutdown)?);
    }
    shutdown.into_result()?;

    Ok(if report.is_complete() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}
