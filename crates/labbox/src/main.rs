//! labbox - sandboxed execution of Python and R analysis scripts.
//!
//! Main entry point for the labbox CLI.

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::Style;

mod commands;

use commands::{check, config, run, status, upload};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// labbox - run untrusted Python and R analysis scripts in a sandbox
#[derive(Parser)]
#[command(name = "labbox")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a script in the sandbox
    Run(run::RunArgs),

    /// Run the static checks without executing
    Check(check::CheckArgs),

    /// Show interpreter availability and effective limits
    Status(status::StatusArgs),

    /// Add data files to the upload store
    Upload(upload::UploadArgs),

    /// Configuration management
    Config(config::ConfigArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let loaded = labbox_config::load_config(None)?;
    let logging = loaded.config.logging();

    // Initialize tracing: console (stderr) + rotating JSON file
    let console_filter = if cli.verbose {
        tracing_subscriber::EnvFilter::new(
            "labbox=debug,labbox_sandbox=debug,labbox_config=debug,info",
        )
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level))
    };

    let log_dir = logging.dir.clone().unwrap_or_else(|| {
        labbox_config::user_config_dir()
            .map(|d| d.join("logs"))
            .unwrap_or_else(|| std::path::PathBuf::from("logs"))
    });
    let file_appender = if logging.file {
        tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("labbox")
            .filename_suffix("log")
            .max_log_files(logging.retention_days.max(1))
            .build(&log_dir)
            .ok()
    } else {
        None
    };
    let (file_writer, _guard) = match file_appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .with(file_writer.map(|writer| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "labbox=trace,labbox_sandbox=trace,labbox_config=trace,info",
                ))
        }))
        .init();

    if !cli.json {
        let yellow = Style::new().yellow();
        for warning in &loaded.warnings {
            eprintln!("{} {}", yellow.apply_to("warning:"), warning);
        }
    }

    // Create context for commands
    let ctx = commands::Context {
        json_output: cli.json,
        verbose: cli.verbose,
        loaded,
    };

    // Dispatch to command handlers
    match cli.command {
        Commands::Run(args) => run::run(args, &ctx).await,
        Commands::Check(args) => check::run(args, &ctx).await,
        Commands::Status(args) => status::run(args, &ctx).await,
        Commands::Upload(args) => upload::run(args, &ctx).await,
        Commands::Config(args) => config::run(args, &ctx).await,
    }
}
