//! Check command - static checks without execution.

use std::process::ExitCode;

use anyhow::Result;
use clap::Args;
use console::Style;
use labbox_sandbox::ValidationViolation;
use serde::Serialize;

use super::{Context, ScriptSource};

/// Arguments for the check command.
#[derive(Args, Debug)]
pub struct CheckArgs {
    #[command(flatten)]
    pub source: ScriptSource,

    /// Data variable names the script may reference (repeatable)
    #[arg(long = "var", value_name = "NAME")]
    pub vars: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CheckOutput {
    language: String,
    valid: bool,
    violations: Vec<ValidationViolation>,
}

/// Run the check command.
pub async fn run(args: CheckArgs, ctx: &Context) -> Result<ExitCode> {
    let (language, code) = args.source.load()?;

    let artifacts = std::sync::Arc::new(ctx.artifact_store());
    let manager = ctx.manager(artifacts)?;
    let violations = match manager.validate_only(language, &code, &args.vars) {
        Ok(()) => Vec::new(),
        Err(violations) => violations,
    };

    if ctx.json_output {
        let output = CheckOutput {
            language: language.to_string(),
            valid: violations.is_empty(),
            violations,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(if output.valid {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(2)
        });
    }

    if violations.is_empty() {
        println!("{} {language} script passed", Style::new().green().apply_to("✓"));
        return Ok(ExitCode::SUCCESS);
    }

    let red = Style::new().red();
    println!("{} {} violation(s):", red.apply_to("✗"), violations.len());
    for violation in &violations {
        println!("  - {violation}");
    }
    Ok(ExitCode::from(2))
}
