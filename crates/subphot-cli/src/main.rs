mod commands;
mod progress;
mod summary;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "subphot",
    about = "Frame-lineage orchestrator for image-subtraction photometry"
)]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process the frames of a project/sector/camera/ccd through every stage
    Run(commands::run::RunArgs),
    /// Show per-stage record counts and current references of a scope
    Status(commands::status::StatusArgs),
    /// Report stage records whose upstream record is missing
    Verify(commands::verify::VerifyArgs),
    /// Drop derived layers of a scope (requires exclusive access)
    Invalidate(commands::invalidate::InvalidateArgs),
    /// Show or install reference frames
    Reference(commands::reference::ReferenceArgs),
    /// Print or save the default run parameters as TOML
    Config(commands::config::ConfigArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match &cli.command {
        Commands::Run(args) => commands::run::run(args),
        Commands::Status(args) => commands::status::run(args),
        Commands::Verify(args) => commands::verify::run(args),
        Commands::Invalidate(args) => commands::invalidate::run(args),
        Commands::Reference(args) => commands::reference::run(args),
        Commands::Config(args) => commands::config::run(args),
    }
}
