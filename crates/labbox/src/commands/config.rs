//! Config command - configuration management.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use console::Style;
use labbox_config::{LabboxConfig, SandboxSection, ValidatorSection};
use serde::Serialize;

use super::Context;

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the merged configuration and where it was loaded from
    Show,

    /// Show configuration file paths and which exist
    Path,

    /// Initialize a config file with defaults
    Init {
        /// Create project-local config (./labbox.toml) instead of user config
        #[arg(long)]
        local: bool,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<ExitCode> {
    match args.command {
        ConfigCommand::Show => cmd_show(ctx),
        ConfigCommand::Path => cmd_path(ctx),
        ConfigCommand::Init { local, force } => cmd_init(local, force),
    }?;
    Ok(ExitCode::SUCCESS)
}

fn cmd_show(ctx: &Context) -> Result<()> {
    let loaded = &ctx.loaded;

    if ctx.json_output {
        #[derive(Serialize)]
        struct ShowOutput<'a> {
            sources: Vec<String>,
            warnings: &'a [String],
            config: &'a LabboxConfig,
        }
        let output = ShowOutput {
            sources: loaded
                .loaded_from()
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
            warnings: &loaded.warnings,
            config: &loaded.config,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("# labbox configuration\n");

    let sources = loaded.loaded_from();
    if sources.is_empty() {
        println!("# No config files loaded (using defaults)\n");
    } else {
        for source in &sources {
            println!("# from {}", source.display());
        }
        println!();
    }

    print!("{}", loaded.config.to_toml()?);
    Ok(())
}

fn cmd_path(ctx: &Context) -> Result<()> {
    let user = labbox_config::user_config_path();
    let project = PathBuf::from(labbox_config::PROJECT_CONFIG_FILE);

    if ctx.json_output {
        let output = serde_json::json!({
            "user": user.as_ref().map(|p| p.display().to_string()),
            "project": project.display().to_string(),
            "loaded": ctx
                .loaded
                .loaded_from()
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let green = Style::new().green();
    let dim = Style::new().dim();
    let marker = |exists: bool| {
        if exists {
            green.apply_to("(loaded)").to_string()
        } else {
            dim.apply_to("(not found)").to_string()
        }
    };
    let loaded = ctx.loaded.loaded_from();

    match user {
        Some(path) => println!(
            "user:    {} {}",
            path.display(),
            marker(loaded.contains(&path.as_path()))
        ),
        None => println!("user:    {}", dim.apply_to("(no config directory)")),
    }
    println!(
        "project: {} {}",
        project.display(),
        marker(loaded.contains(&project.as_path()))
    );
    Ok(())
}

fn cmd_init(local: bool, force: bool) -> Result<()> {
    let path = if local {
        PathBuf::from(labbox_config::PROJECT_CONFIG_FILE)
    } else {
        match labbox_config::user_config_path() {
            Some(path) => path,
            None => bail!("no user config directory on this platform; use --local"),
        }
    };

    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    labbox_config::save_config(&starter_config(), &path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

/// Defaults spelled out so they are easy to edit.
fn starter_config() -> LabboxConfig {
    LabboxConfig {
        sandbox: Some(SandboxSection {
            default_timeout_secs: Some(30),
            max_timeout_secs: Some(30),
            memory_limit_mb: Some(256),
            output_limit_mb: Some(50),
            max_inline_mb: Some(10),
            inherit_env: Some(vec!["PATH".to_string()]),
            ..Default::default()
        }),
        validator: Some(ValidatorSection::default()),
        ..Default::default()
    }
}
