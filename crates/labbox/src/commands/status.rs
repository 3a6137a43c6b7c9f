//! Status command - interpreter availability and effective limits.

use std::process::ExitCode;

use anyhow::{Context as _, Result};
use clap::Args;
use console::{Style, style};
use labbox_sandbox::{InterpreterStatus, Language, Platform};
use serde::Serialize;

use super::Context;

/// Arguments for the status command.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Show install hints for missing interpreters
    #[arg(short, long)]
    pub detailed: bool,
}

#[derive(Debug, Serialize)]
struct InterpreterOutput {
    language: Language,
    available: bool,
    program: String,
    version: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusOutput {
    platform: &'static str,
    memory_limit_enforced: bool,
    interpreters: Vec<InterpreterOutput>,
    work_root: String,
    default_timeout_secs: u64,
    max_timeout_secs: u64,
    memory_limit_bytes: u64,
    output_limit_bytes: usize,
}

/// Run the status command.
pub async fn run(args: StatusArgs, ctx: &Context) -> Result<ExitCode> {
    let config = ctx
        .loaded
        .config
        .sandbox_config()
        .context("invalid sandbox configuration")?;
    let platform = Platform::detect();
    let statuses: Vec<InterpreterStatus> = [Language::Python, Language::R]
        .into_iter()
        .map(|language| InterpreterStatus::detect(language, config.interpreter(language)))
        .collect();

    if ctx.json_output {
        let output = StatusOutput {
            platform: platform.name(),
            memory_limit_enforced: platform.enforces_memory_limit(),
            interpreters: statuses.iter().map(interpreter_output).collect(),
            work_root: config.work_root.display().to_string(),
            default_timeout_secs: config.default_timeout.as_secs(),
            max_timeout_secs: config.max_timeout.as_secs(),
            memory_limit_bytes: config.memory_limit_bytes,
            output_limit_bytes: config.output_limit_bytes,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(ExitCode::SUCCESS);
    }

    let green = Style::new().green();
    let red = Style::new().red();
    let dim = Style::new().dim();

    println!();
    println!("{}", style("labbox Status").bold());
    println!("{}", dim.apply_to("─".repeat(40)));
    println!();
    println!("  {} {}", dim.apply_to("Platform:"), platform);

    for status in &statuses {
        let label = format!("{}:", status.language());
        match status {
            InterpreterStatus::Available {
                program, version, ..
            } => println!(
                "  {} {} {} {}",
                dim.apply_to(label),
                green.apply_to("● available"),
                program.display(),
                dim.apply_to(version.as_deref().unwrap_or(""))
            ),
            InterpreterStatus::Missing {
                program,
                install_hint,
                ..
            } => {
                println!(
                    "  {} {} {}",
                    dim.apply_to(label),
                    red.apply_to("● missing"),
                    program.display()
                );
                if args.detailed {
                    for line in install_hint.lines() {
                        println!("      {}", dim.apply_to(line));
                    }
                }
            }
        }
    }

    println!();
    println!("{}", dim.apply_to("─".repeat(40)));
    println!();
    println!("  {} {}", dim.apply_to("Work root:"), config.work_root.display());
    println!(
        "  {} {}s (max {}s)",
        dim.apply_to("Timeout:"),
        config.default_timeout.as_secs(),
        config.max_timeout.as_secs()
    );
    let memory = if config.memory_limit_bytes == 0 {
        "unlimited".to_string()
    } else {
        format!("{} MiB", config.memory_limit_bytes / (1024 * 1024))
    };
    let note = if platform.enforces_memory_limit() {
        ""
    } else {
        " (not enforced on this platform)"
    };
    println!("  {} {}{}", dim.apply_to("Memory:"), memory, dim.apply_to(note));
    println!(
        "  {} {} MiB",
        dim.apply_to("Output:"),
        config.output_limit_bytes / (1024 * 1024)
    );
    println!();

    Ok(ExitCode::SUCCESS)
}

fn interpreter_output(status: &InterpreterStatus) -> InterpreterOutput {
    match status {
        InterpreterStatus::Available {
            language,
            program,
            version,
        } => InterpreterOutput {
            language: *language,
            available: true,
            program: program.display().to_string(),
            version: version.clone(),
        },
        InterpreterStatus::Missing {
            language, program, ..
        } => InterpreterOutput {
            language: *language,
            available: false,
            program: program.display().to_string(),
            version: None,
        },
    }
}
