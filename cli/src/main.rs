//! CLI for rtprof
//!
//! Reads the trace log an agent wrote and turns it into something readable:
//! - summary: totals, hottest functions, threads and allocations
//! - fold: folded stacks, optionally rendered as an SVG flamegraph

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod output;

#[derive(Parser)]
#[command(name = "rtprof")]
#[command(about = "rtprof - trace log reader for the in-process sampling agent", long_about = None)]
#[command(version)]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print totals, top functions, threads and allocations of a trace
    Summary(commands::summary::SummaryArgs),

    /// Print folded stacks or render them as a flamegraph
    Fold(commands::fold::FoldArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Summary(args) => commands::summary::run(args),
        Commands::Fold(args) => commands::fold::run(args),
    };
    if let Err(e) = &result {
        output::error(&format!("{:#}", e));
    }
    result
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}
