//! Sandbox configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SandboxError, SandboxResult};
use crate::language::{InterpreterConfig, Language};

/// Default name of the output directory variable exposed to guests.
pub const DEFAULT_OUTPUT_DIR_VAR: &str = "OUTPUT_DIR";

/// Resource ceilings for a single execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Wall-clock limit.
    pub timeout: Duration,
    /// Address-space ceiling in bytes (0 = unlimited).
    pub memory_bytes: u64,
    /// Combined stdout + stderr ceiling in bytes.
    pub output_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            memory_bytes: 256 * 1024 * 1024,
            output_bytes: 50 * 1024 * 1024,
        }
    }
}

/// Configuration shared by every execution.
///
/// Read-only once the [`crate::SandboxManager`] is built.
///
/// # Security Model
///
/// - **Environment**: cleared, then rebuilt from the variables listed in
///   `inherit_env` plus the provisioned ones. Nothing else leaks in.
/// - **Filesystem**: each run gets its own directory under `work_root`;
///   scripts are told to write only to the output directory variable.
/// - **Resources**: wall-clock timeout, address-space limit and output cap.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Parent directory for per-request working directories.
    pub work_root: PathBuf,

    /// Python interpreter invocation.
    pub python: InterpreterConfig,

    /// R interpreter invocation.
    pub r: InterpreterConfig,

    /// Timeout when a request does not specify one.
    pub default_timeout: Duration,

    /// Upper bound for requested timeouts.
    pub max_timeout: Duration,

    /// Address-space ceiling for the guest (0 disables it).
    pub memory_limit_bytes: u64,

    /// Combined stdout/stderr ceiling.
    pub output_limit_bytes: usize,

    /// Largest image that is inlined as base64.
    pub max_inline_bytes: u64,

    /// Name of the output directory variable.
    pub output_dir_var: String,

    /// Host environment variables passed through to the guest.
    pub inherit_env: Vec<String>,

    /// Extra environment variables for the guest.
    pub env_vars: Vec<(String, String)>,

    /// Allow read-only opens of paths under the sandbox.
    pub allow_scoped_reads: bool,

    /// Save open matplotlib figures / R plots when the script saved none.
    pub autosave_figures: bool,

    /// Additional Python modules on the import allow-list.
    pub extra_python_modules: Vec<String>,

    /// Additional R packages on the import allow-list.
    pub extra_r_packages: Vec<String>,

    /// How long to wait for output pipes to drain after a kill.
    pub kill_grace: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let limits = ResourceLimits::default();
        Self {
            work_root: std::env::temp_dir().join("labbox"),
            python: Language::Python.default_interpreter(),
            r: Language::R.default_interpreter(),
            default_timeout: limits.timeout,
            max_timeout: limits.timeout,
            memory_limit_bytes: limits.memory_bytes,
            output_limit_bytes: limits.output_bytes,
            max_inline_bytes: 10 * 1024 * 1024,
            output_dir_var: DEFAULT_OUTPUT_DIR_VAR.to_string(),
            inherit_env: vec!["PATH".to_string()],
            env_vars: Vec::new(),
            allow_scoped_reads: false,
            autosave_figures: true,
            extra_python_modules: Vec::new(),
            extra_r_packages: Vec::new(),
            kill_grace: Duration::from_secs(2),
        }
    }
}

impl SandboxConfig {
    /// Create a new sandbox configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the work root.
    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = root.into();
        self
    }

    /// Set the interpreter for a language.
    pub fn with_interpreter(mut self, language: Language, interpreter: InterpreterConfig) -> Self {
        match language {
            Language::Python => self.python = interpreter,
            Language::R => self.r = interpreter,
        }
        self
    }

    /// Set the default timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the maximum timeout.
    pub fn with_max_timeout(mut self, timeout: Duration) -> Self {
        self.max_timeout = timeout;
        self
    }

    /// Set the memory ceiling.
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    /// Set the output ceiling.
    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }

    /// Set the largest inlined image.
    pub fn with_max_inline_bytes(mut self, bytes: u64) -> Self {
        self.max_inline_bytes = bytes;
        self
    }

    /// Pass a host environment variable through.
    pub fn inherit_env_var(mut self, name: impl Into<String>) -> Self {
        self.inherit_env.push(name.into());
        self
    }

    /// Add an environment variable.
    pub fn add_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Enable the scoped-read relaxation.
    pub fn with_scoped_reads(mut self, allow: bool) -> Self {
        self.allow_scoped_reads = allow;
        self
    }

    /// Enable or disable figure autosave.
    pub fn with_autosave_figures(mut self, autosave: bool) -> Self {
        self.autosave_figures = autosave;
        self
    }

    /// Interpreter for a language.
    pub fn interpreter(&self, language: Language) -> &InterpreterConfig {
        match language {
            Language::Python => &self.python,
            Language::R => &self.r,
        }
    }

    /// Clamp a requested timeout (seconds) to `[1, max_timeout]`.
    pub fn resolve_timeout(&self, requested_secs: Option<u64>) -> Duration {
        let max = self.max_timeout.max(Duration::from_secs(1));
        let requested = requested_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        requested.clamp(Duration::from_secs(1), max)
    }

    /// Resource limits for a request.
    pub fn limits_for(&self, requested_timeout_secs: Option<u64>) -> ResourceLimits {
        ResourceLimits {
            timeout: self.resolve_timeout(requested_timeout_secs),
            memory_bytes: self.memory_limit_bytes,
            output_bytes: self.output_limit_bytes,
        }
    }

    /// Check the configuration for values that would make every run fail.
    pub fn validate(&self) -> SandboxResult<()> {
        if !is_identifier(&self.output_dir_var) {
            return Err(SandboxError::ConfigError(format!(
                "output_dir_var '{}' is not a valid identifier",
                self.output_dir_var
            )));
        }
        if self.output_limit_bytes == 0 {
            return Err(SandboxError::ConfigError(
                "output_limit_bytes must be greater than zero".to_string(),
            ));
        }
        if self.max_timeout < self.default_timeout {
            tracing::warn!(
                default = ?self.default_timeout,
                max = ?self.max_timeout,
                "Default timeout exceeds max timeout; requests will be clamped"
            );
        }
        Ok(())
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SandboxConfig::default();
        assert_eq!(config.default_timeout, Duration::from_secs(30));
        assert_eq!(config.max_timeout, Duration::from_secs(30));
        assert_eq!(config.memory_limit_bytes, 256 * 1024 * 1024);
        assert_eq!(config.output_limit_bytes, 50 * 1024 * 1024);
        assert_eq!(config.output_dir_var, "OUTPUT_DIR");
        assert_eq!(config.inherit_env, vec!["PATH"]);
        assert!(!config.allow_scoped_reads);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = SandboxConfig::new()
            .with_work_root("/srv/labbox")
            .with_max_timeout(Duration::from_secs(120))
            .with_memory_limit(1024)
            .add_env("OMP_NUM_THREADS", "1")
            .with_interpreter(Language::Python, InterpreterConfig::new("/opt/py/bin/python"));

        assert_eq!(config.work_root, PathBuf::from("/srv/labbox"));
        assert_eq!(config.max_timeout, Duration::from_secs(120));
        assert_eq!(config.memory_limit_bytes, 1024);
        assert_eq!(config.env_vars.len(), 1);
        assert_eq!(
            config.interpreter(Language::Python).program,
            PathBuf::from("/opt/py/bin/python")
        );
    }

    #[test]
    fn test_timeout_clamping() {
        let config = SandboxConfig::default();
        assert_eq!(config.resolve_timeout(None), Duration::from_secs(30));
        assert_eq!(config.resolve_timeout(Some(5)), Duration::from_secs(5));
        assert_eq!(config.resolve_timeout(Some(0)), Duration::from_secs(1));
        assert_eq!(config.resolve_timeout(Some(600)), Duration::from_secs(30));

        let relaxed = SandboxConfig::default().with_max_timeout(Duration::from_secs(300));
        assert_eq!(relaxed.resolve_timeout(Some(600)), Duration::from_secs(300));
        assert_eq!(relaxed.resolve_timeout(Some(120)), Duration::from_secs(120));
    }

    #[test]
    fn test_limits_for() {
        let limits = SandboxConfig::default().limits_for(Some(10));
        assert_eq!(limits.timeout, Duration::from_secs(10));
        assert_eq!(limits.memory_bytes, 256 * 1024 * 1024);
    }

    #[test]
    fn test_validate_rejects_bad_output_var() {
        let mut config = SandboxConfig::default();
        config.output_dir_var = "OUT-DIR".to_string();
        assert!(matches!(config.validate(), Err(SandboxError::ConfigError(_))));
    }

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("df"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1x"));
        assert!(!is_identifier("a-b"));
        assert!(!is_identifier(""));
    }
}
