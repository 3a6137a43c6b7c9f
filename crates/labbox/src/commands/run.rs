//! Run command - execute a script and report its output.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use base64::Engine;
use clap::Args;
use console::{Style, style};
use labbox_sandbox::{ExecutionRequest, LocalArtifactStore, Outcome, SandboxResponse};
use tokio_util::sync::CancellationToken;

use super::{Context, ScriptSource};

/// Arguments for the run command.
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub source: ScriptSource,

    /// Bind an uploaded file to a variable: NAME=REFERENCE (repeatable)
    #[arg(short, long = "data", value_name = "NAME=REF", value_parser = parse_binding)]
    pub data: Vec<(String, String)>,

    /// Timeout in seconds (clamped to the configured maximum)
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Request id used for the working directory and logs
    #[arg(long)]
    pub request_id: Option<String>,

    /// Write the inline image to this path
    #[arg(long, value_name = "PATH")]
    pub save_image: Option<PathBuf>,
}

fn parse_binding(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, reference)) if !name.is_empty() && !reference.is_empty() => {
            Ok((name.to_string(), reference.to_string()))
        }
        _ => Err(format!("expected NAME=REFERENCE, got '{s}'")),
    }
}

/// Run the run command.
pub async fn run(args: RunArgs, ctx: &Context) -> Result<ExitCode> {
    let (language, code) = args.source.load()?;

    let mut request = ExecutionRequest::new(language, code);
    for (name, reference) in args.data {
        request = request.with_data_file(name, reference);
    }
    if let Some(timeout) = args.timeout {
        request = request.with_timeout(timeout);
    }
    if let Some(id) = args.request_id {
        request = request.with_request_id(id);
    }

    let artifacts = Arc::new(ctx.artifact_store());
    let manager = ctx.manager(artifacts.clone())?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling execution");
            on_interrupt.cancel();
        }
    });

    let response = manager.execute_and_assemble(request, cancel).await?;

    if let (Some(path), Some(artifact)) = (&args.save_image, &response.artifact) {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&artifact.data)
            .context("inline image is not valid base64")?;
        std::fs::write(path, bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print_human(&response, &artifacts, args.save_image.as_deref(), ctx.verbose);
    }

    Ok(exit_code(response.metadata.outcome))
}

/// 0 on success, 2 when rejected, 1 for every other failure.
fn exit_code(outcome: Outcome) -> ExitCode {
    match outcome {
        Outcome::Completed => ExitCode::SUCCESS,
        Outcome::Rejected => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    }
}

fn print_human(
    response: &SandboxResponse,
    artifacts: &LocalArtifactStore,
    saved_image: Option<&std::path::Path>,
    verbose: bool,
) {
    let dim = Style::new().dim();

    println!("{}", response.text);

    if let Some(ref artifact) = response.artifact {
        println!();
        let dims = artifact
            .dimensions
            .map(|d| format!(", {d}"))
            .unwrap_or_default();
        println!(
            "  {} {} ({}{}, {} bytes)",
            dim.apply_to("Image:"),
            artifact.name,
            artifact.mime_type,
            dims,
            artifact.size_bytes
        );
        if let Some(path) = saved_image {
            println!("  {} {}", dim.apply_to("Saved:"), path.display());
        }
    }

    if !response.files.is_empty() {
        println!();
        println!("  {}", dim.apply_to("Files:"));
        for file in &response.files {
            println!(
                "    {} {} ({}, {} bytes)",
                file.original_name,
                dim.apply_to(artifacts.path_of(file).display()),
                file.mime_type,
                file.size_bytes
            );
        }
    }

    let meta = &response.metadata;
    let status = match meta.outcome {
        Outcome::Completed => Style::new().green().apply_to("● completed"),
        Outcome::Rejected => Style::new().yellow().apply_to("● rejected"),
        Outcome::Cancelled => Style::new().yellow().apply_to("● cancelled"),
        Outcome::TimedOut => Style::new().red().apply_to("● timed out"),
        Outcome::Crashed => Style::new().red().apply_to("● crashed"),
        Outcome::InfrastructureError => Style::new().red().apply_to("● internal error"),
    };

    eprintln!();
    eprintln!(
        "{} {} {}",
        status,
        dim.apply_to(format!("{} ms", meta.elapsed_ms)),
        if meta.output_truncated {
            style("(output truncated)").yellow().to_string()
        } else {
            String::new()
        }
    );
    if verbose {
        eprintln!("  {} {}", dim.apply_to("Request:"), meta.request_id);
        if let Some(code) = meta.exit_code {
            eprintln!("  {} {}", dim.apply_to("Exit code:"), code);
        }
    }
}
