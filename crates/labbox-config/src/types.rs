//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [sandbox]                # limits, environment, work root
//! [validator]              # allow-list extensions
//! [interpreters.python]    # guest interpreter overrides
//! [interpreters.r]
//! [paths]                  # upload and artifact stores
//! [logging]                # console level and JSON log files
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use labbox_sandbox::{InterpreterConfig, Language, SandboxConfig};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const MIB: u64 = 1024 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., a project-local
/// `labbox.toml`) can be loaded and merged over the user config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabboxConfig {
    /// Execution limits and guest environment.
    pub sandbox: Option<SandboxSection>,

    /// Static check settings.
    pub validator: Option<ValidatorSection>,

    /// Guest interpreter overrides.
    pub interpreters: Option<InterpretersSection>,

    /// Upload and artifact store locations.
    pub paths: Option<PathsSection>,

    /// Logging configuration.
    pub logging: Option<LoggingConfig>,
}

impl LabboxConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> crate::Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Sections are replaced whole. Interpreters merge per language.
    pub fn merge(&mut self, other: LabboxConfig) {
        if other.sandbox.is_some() {
            self.sandbox = other.sandbox;
        }

        if other.validator.is_some() {
            self.validator = other.validator;
        }

        if let Some(theirs) = other.interpreters {
            let ours = self.interpreters.get_or_insert_with(Default::default);
            if theirs.python.is_some() {
                ours.python = theirs.python;
            }
            if theirs.r.is_some() {
                ours.r = theirs.r;
            }
        }

        if other.paths.is_some() {
            self.paths = other.paths;
        }

        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    /// Build the runtime sandbox configuration.
    ///
    /// Unset values keep the sandbox defaults.
    pub fn sandbox_config(&self) -> crate::Result<SandboxConfig> {
        let mut config = SandboxConfig::default();

        if let Some(ref sandbox) = self.sandbox {
            sandbox.apply(&mut config)?;
        }

        if let Some(ref validator) = self.validator {
            config.allow_scoped_reads = validator.allow_scoped_reads;
            config.extra_python_modules = validator.extra_python_modules.clone();
            config.extra_r_packages = validator.extra_r_packages.clone();
        }

        if let Some(ref interpreters) = self.interpreters {
            for language in [Language::Python, Language::R] {
                if let Some(section) = interpreters.get(language) {
                    let merged = section.apply(config.interpreter(language));
                    config = config.with_interpreter(language, merged);
                }
            }
        }

        config
            .validate()
            .map_err(|e| ConfigError::Other(e.to_string()))?;
        Ok(config)
    }

    /// Get the sandbox section or defaults.
    pub fn sandbox(&self) -> SandboxSection {
        self.sandbox.clone().unwrap_or_default()
    }

    /// Get the paths section or defaults.
    pub fn paths(&self) -> PathsSection {
        self.paths.clone().unwrap_or_default()
    }

    /// Get the logging section or defaults.
    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sandbox Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Execution limits and guest environment.
///
/// ```toml
/// [sandbox]
/// work_root = "/var/tmp/labbox"
/// default_timeout_secs = 30
/// max_timeout_secs = 120
/// memory_limit_mb = 512
/// output_limit_mb = 50
/// max_inline_mb = 10
/// inherit_env = ["PATH", "LANG"]
///
/// [sandbox.env]
/// OMP_NUM_THREADS = "1"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    /// Parent directory for per-request working directories.
    pub work_root: Option<PathBuf>,
    /// Timeout when a request gives none.
    pub default_timeout_secs: Option<u64>,
    /// Ceiling for requested timeouts.
    pub max_timeout_secs: Option<u64>,
    /// Address-space ceiling in MiB (0 disables it).
    pub memory_limit_mb: Option<u64>,
    /// Combined stdout/stderr ceiling in MiB.
    pub output_limit_mb: Option<u64>,
    /// Largest image inlined as base64, in MiB.
    pub max_inline_mb: Option<u64>,
    /// Name of the output directory variable.
    pub output_dir_var: Option<String>,
    /// Host variables passed through. Replaces the default list.
    pub inherit_env: Option<Vec<String>>,
    /// Extra variables set for every guest.
    pub env: BTreeMap<String, String>,
    /// Save open figures when the script saved none.
    pub autosave_figures: Option<bool>,
    /// Grace period for pipes to drain after a kill, in milliseconds.
    pub kill_grace_ms: Option<u64>,
}

impl SandboxSection {
    fn apply(&self, config: &mut SandboxConfig) -> crate::Result<()> {
        if let Some(ref root) = self.work_root {
            config.work_root = root.clone();
        }
        if let Some(secs) = self.default_timeout_secs {
            if secs == 0 {
                return Err(ConfigError::invalid(
                    "sandbox.default_timeout_secs",
                    "must be at least 1",
                ));
            }
            config.default_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.max_timeout_secs {
            if secs == 0 {
                return Err(ConfigError::invalid(
                    "sandbox.max_timeout_secs",
                    "must be at least 1",
                ));
            }
            config.max_timeout = Duration::from_secs(secs);
        }
        if let Some(mb) = self.memory_limit_mb {
            config.memory_limit_bytes = mb.saturating_mul(MIB);
        }
        if let Some(mb) = self.output_limit_mb {
            config.output_limit_bytes = usize::try_from(mb.saturating_mul(MIB)).map_err(|_| {
                ConfigError::invalid("sandbox.output_limit_mb", "too large for this platform")
            })?;
        }
        if let Some(mb) = self.max_inline_mb {
            config.max_inline_bytes = mb.saturating_mul(MIB);
        }
        if let Some(ref var) = self.output_dir_var {
            config.output_dir_var = var.clone();
        }
        if let Some(ref inherit) = self.inherit_env {
            config.inherit_env = inherit.clone();
        }
        config
            .env_vars
            .extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(autosave) = self.autosave_figures {
            config.autosave_figures = autosave;
        }
        if let Some(ms) = self.kill_grace_ms {
            config.kill_grace = Duration::from_millis(ms);
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Validator Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Static check settings.
///
/// ```toml
/// [validator]
/// allow_scoped_reads = true
/// extra_python_modules = ["sklearn", "statsmodels"]
/// extra_r_packages = ["data.table"]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorSection {
    /// Permit read-only `open()` of staged inputs.
    pub allow_scoped_reads: bool,
    /// Python modules added to the import allow-list.
    pub extra_python_modules: Vec<String>,
    /// R packages added to the library allow-list.
    pub extra_r_packages: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Interpreter Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Per-language interpreter overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpretersSection {
    pub python: Option<InterpreterSection>,
    pub r: Option<InterpreterSection>,
}

impl InterpretersSection {
    pub fn get(&self, language: Language) -> Option<&InterpreterSection> {
        match language {
            Language::Python => self.python.as_ref(),
            Language::R => self.r.as_ref(),
        }
    }
}

/// One interpreter override.
///
/// ```toml
/// [interpreters.python]
/// program = "/opt/conda/bin/python"
/// args = ["-B"]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterSection {
    /// Program name or absolute path.
    pub program: Option<PathBuf>,
    /// Arguments placed before the launcher. Replaces the defaults.
    pub args: Option<Vec<String>>,
}

impl InterpreterSection {
    fn apply(&self, base: &InterpreterConfig) -> InterpreterConfig {
        let mut merged = base.clone();
        if let Some(ref program) = self.program {
            merged.program = program.clone();
        }
        if let Some(ref args) = self.args {
            merged.args = args.clone();
        }
        merged
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Paths Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "LABBOX_DATA_DIR";

/// Store locations.
///
/// ```toml
/// [paths]
/// uploads_dir = "~/labbox/uploads"
/// artifacts_dir = "~/labbox/artifacts"
/// allow_direct_paths = false
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    /// Where uploaded data files live.
    pub uploads_dir: Option<PathBuf>,
    /// Where registered output files are kept.
    pub artifacts_dir: Option<PathBuf>,
    /// Let `--data` refer to host paths as well as upload ids.
    pub allow_direct_paths: bool,
}

impl PathsSection {
    /// Base directory for store data.
    ///
    /// Resolution order:
    /// 1. `LABBOX_DATA_DIR` environment variable
    /// 2. Platform data directory + `labbox`
    /// 3. `./.labbox`
    pub fn data_dir() -> PathBuf {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV)
            && !dir.is_empty()
        {
            return PathBuf::from(dir);
        }
        dirs::data_local_dir()
            .map(|d| d.join(crate::APP_NAME))
            .unwrap_or_else(|| PathBuf::from(".labbox"))
    }

    pub fn effective_uploads_dir(&self) -> PathBuf {
        self.uploads_dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("uploads"))
    }

    pub fn effective_artifacts_dir(&self) -> PathBuf {
        self.artifacts_dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("artifacts"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Logging configuration section.
///
/// ```toml
/// [logging]
/// level = "labbox=debug"
/// file = true
/// retention_days = 14
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Console filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Write JSON log files.
    pub file: bool,
    /// Directory for log files. Defaults to `<config dir>/logs`.
    pub dir: Option<PathBuf>,
    /// Rotated files to keep.
    pub retention_days: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            file: true,
            dir: None,
            retention_days: 7,
        }
    }
}
