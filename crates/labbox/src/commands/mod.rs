//! CLI command handlers.

pub mod check;
pub mod config;
pub mod run;
pub mod status;
pub mod upload;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use clap::Args;
use labbox_config::LoadedConfig;
use labbox_sandbox::{Language, LocalArtifactStore, LocalUploadStore, SandboxManager};

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
    /// Merged configuration and where it came from.
    pub loaded: LoadedConfig,
}

impl Context {
    pub fn upload_store(&self) -> LocalUploadStore {
        let paths = self.loaded.config.paths();
        LocalUploadStore::new(paths.effective_uploads_dir())
            .with_direct_paths(paths.allow_direct_paths)
    }

    pub fn artifact_store(&self) -> LocalArtifactStore {
        LocalArtifactStore::new(self.loaded.config.paths().effective_artifacts_dir())
    }

    /// Build a manager over the configured local stores.
    pub fn manager(&self, artifacts: Arc<LocalArtifactStore>) -> Result<SandboxManager> {
        let config = self
            .loaded
            .config
            .sandbox_config()
            .context("invalid sandbox configuration")?;
        Ok(SandboxManager::new(
            config,
            Arc::new(self.upload_store()),
            artifacts,
        )?)
    }
}

/// Where the script comes from. Shared by `run` and `check`.
#[derive(Args, Debug)]
pub struct ScriptSource {
    /// Script file to read ("-" or omitted reads stdin)
    pub script: Option<PathBuf>,

    /// Inline code instead of a file
    #[arg(short = 'c', long = "code", conflicts_with = "script")]
    pub code: Option<String>,

    /// Script language: python or r (inferred from the file extension)
    #[arg(short, long)]
    pub language: Option<Language>,
}

impl ScriptSource {
    /// Read the code and settle its language.
    pub fn load(&self) -> Result<(Language, String)> {
        let code = match (&self.code, &self.script) {
            (Some(code), _) => code.clone(),
            (None, Some(path)) if path != Path::new("-") => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?,
            _ => {
                let mut buf = String::new();
                std::io::stdin()
                    .read_to_string(&mut buf)
                    .context("failed to read script from stdin")?;
                buf
            }
        };

        if code.trim().is_empty() {
            bail!("script is empty");
        }

        let language = self
            .language
            .or_else(|| self.script.as_deref().and_then(language_for_path))
            .unwrap_or_default();
        Ok((language, code))
    }
}

fn language_for_path(path: &Path) -> Option<Language> {
    match path.extension()?.to_str()? {
        "py" => Some(Language::Python),
        "R" | "r" => Some(Language::R),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_for_path() {
        assert_eq!(language_for_path(Path::new("a.py")), Some(Language::Python));
        assert_eq!(language_for_path(Path::new("plot.R")), Some(Language::R));
        assert_eq!(language_for_path(Path::new("notes.txt")), None);
        assert_eq!(language_for_path(Path::new("Makefile")), None);
    }

    #[test]
    fn test_inline_code_wins() {
        let source = ScriptSource {
            script: None,
            code: Some("print(1)".to_string()),
            language: Some(Language::R),
        };
        let (language, code) = source.load().unwrap();
        assert_eq!(language, Language::R);
        assert_eq!(code, "print(1)");
    }

    #[test]
    fn test_empty_inline_code_rejected() {
        let source = ScriptSource {
            script: None,
            code: Some("  \n".to_string()),
            language: None,
        };
        assert!(source.load().is_err());
    }
}
