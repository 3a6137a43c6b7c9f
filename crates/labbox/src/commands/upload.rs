//! Upload command - copy data files into the upload store.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context as _, Result, anyhow};
use clap::Args;
use console::Style;
use serde::Serialize;

use super::Context;

/// Arguments for the upload command.
#[derive(Args, Debug)]
pub struct UploadArgs {
    /// Files to upload
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Serialize)]
struct UploadOutput {
    id: String,
    name: String,
    size_bytes: usize,
}

/// Run the upload command.
pub async fn run(args: UploadArgs, ctx: &Context) -> Result<ExitCode> {
    let store = ctx.upload_store();
    let mut uploaded = Vec::with_capacity(args.files.len());

    for path in &args.files {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("'{}' has no usable file name", path.display()))?;
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let id = store.put(name, &bytes).await?;
        uploaded.push(UploadOutput {
            id,
            name: name.to_string(),
            size_bytes: bytes.len(),
        });
    }

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&uploaded)?);
    } else {
        let dim = Style::new().dim();
        for upload in &uploaded {
            println!(
                "{}  {} {}",
                upload.id,
                upload.name,
                dim.apply_to(format!("({} bytes)", upload.size_bytes))
            );
        }
        if ctx.verbose {
            println!("{}", dim.apply_to(format!("store: {}", store.root().display())));
        }
    }

    Ok(ExitCode::SUCCESS)
}
