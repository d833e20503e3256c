//! Vesta CLI - inspect reactive notebook descriptions.

mod colors;
mod inspect;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use vesta_core::RuntimeConfig;

use crate::inspect::Inspection;

#[derive(Parser)]
#[command(name = "vesta")]
#[command(about = "Inspect reactive notebook descriptions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Runtime configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the dependency graph of a notebook
    Check {
        /// Path to the notebook description (JSON list of cell records)
        notebook: PathBuf,
    },

    /// Print cells in execution order
    Order {
        /// Path to the notebook description
        notebook: PathBuf,
    },

    /// Print groups of cells that can run in parallel
    Levels {
        /// Path to the notebook description
        notebook: PathBuf,
    },

    /// Print producer -> consumer edges
    Edges {
        /// Path to the notebook description
        notebook: PathBuf,

        /// Print order, levels and edges as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };
    tracing::debug!(?config, "runtime configuration");

    match cli.command {
        Commands::Check { notebook } => check(&notebook, &config).await?,

        Commands::Order { notebook } => {
            let inspection = Inspection::load(&notebook).await?;
            for name in inspection.order() {
                println!("{}", name);
            }
        }

        Commands::Levels { notebook } => {
            let inspection = Inspection::load(&notebook).await?;
            for (i, level) in inspection.levels().iter().enumerate() {
                println!("{}: {}", i, level.join(", "));
            }
        }

        Commands::Edges { notebook, json } => {
            let inspection = Inspection::load(&notebook).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&inspection.summary())?);
            } else {
                for (from, to) in inspection.edges() {
                    println!("{} -> {}", from, to);
                }
            }
        }
    }

    Ok(())
}

async fn check(notebook: &std::path::Path, config: &RuntimeConfig) -> anyhow::Result<()> {
    let inspection = match Inspection::load(notebook).await {
        Ok(inspection) => inspection,
        Err(e) => {
            println!("{}✗{} {}", colors::RED, colors::RESET, e);
            return Err(e);
        }
    };

    for (name, reason) in &inspection.rejected {
        println!(
            "{}!{} {} excluded: {}",
            colors::YELLOW,
            colors::RESET,
            name,
            reason
        );
    }

    let levels = inspection.levels();
    let widest = levels.iter().map(Vec::len).max().unwrap_or(0);
    println!(
        "{}✓{} {}{} cells{}, {} edges, {} levels",
        colors::GREEN,
        colors::RESET,
        colors::BOLD,
        inspection.records.len(),
        colors::RESET,
        inspection.edges().len(),
        levels.len()
    );
    println!(
        "{}widest level {} / max parallelism {}{}",
        colors::DIM,
        widest,
        config.max_parallelism,
        colors::RESET
    );
    Ok(())
}
