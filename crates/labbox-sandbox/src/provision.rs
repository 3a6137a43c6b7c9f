//! Execution requests and per-request working directories.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{ResourceLimits, SandboxConfig, is_identifier};
use crate::error::{SandboxError, SandboxResult};
use crate::language::Language;
use crate::store::UploadStore;

/// Prefix of the per-file environment variables.
pub const DATA_ENV_PREFIX: &str = "LABBOX_DATA_";

/// A request to run one script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    #[serde(default)]
    pub language: Language,
    pub code: String,
    /// Variable name -> upload reference.
    #[serde(default)]
    pub data_files: BTreeMap<String, String>,
    /// Requested wall-clock limit in seconds.
    #[serde(default, rename = "timeout")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub request_id: Option<String>,
}

impl ExecutionRequest {
    pub fn new(language: Language, code: impl Into<String>) -> Self {
        Self {
            language,
            code: code.into(),
            ..Default::default()
        }
    }

    pub fn python(code: impl Into<String>) -> Self {
        Self::new(Language::Python, code)
    }

    pub fn r(code: impl Into<String>) -> Self {
        Self::new(Language::R, code)
    }

    /// Bind an upload to a variable inside the script.
    pub fn with_data_file(mut self, variable: impl Into<String>, reference: impl Into<String>) -> Self {
        self.data_files.insert(variable.into(), reference.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Variable names the staged files are bound to.
    pub fn data_variables(&self) -> Vec<String> {
        self.data_files.keys().cloned().collect()
    }

    /// Reject requests that cannot be executed as written.
    pub fn check(&self, output_dir_var: &str) -> SandboxResult<()> {
        for variable in self.data_files.keys() {
            if !is_identifier(variable) {
                return Err(SandboxError::InvalidRequest(format!(
                    "data file variable '{variable}' is not a valid identifier"
                )));
            }
            if variable == output_dir_var {
                return Err(SandboxError::InvalidRequest(format!(
                    "data file variable '{variable}' shadows the output directory variable"
                )));
            }
        }
        if let Some(id) = &self.request_id {
            let valid = !id.is_empty()
                && id.len() <= 64
                && id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if !valid {
                return Err(SandboxError::InvalidRequest(format!(
                    "request id '{id}' must be 1-64 characters of [A-Za-z0-9_-]"
                )));
            }
        }
        Ok(())
    }
}

/// Generate a unique execution id.
///
/// Uses the caller-supplied request id when present, otherwise a UTC
/// timestamp; either way a fresh uuid is appended.
pub fn execution_id(request: &ExecutionRequest) -> String {
    let prefix = request
        .request_id
        .clone()
        .unwrap_or_else(|| chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string());
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

/// An ephemeral directory owned by exactly one execution.
///
/// ```text
/// <work_root>/<execution id>/
///   input/    staged data files
///   output/   the guest's output directory
///   tmp/      the guest's TMPDIR
///   script.py, _labbox_launcher.py
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingDirectory {
    id: String,
    path: PathBuf,
}

impl WorkingDirectory {
    /// Create the directory and its layout.
    ///
    /// Fails if the directory already exists.
    pub async fn create(work_root: &Path, id: &str) -> SandboxResult<Self> {
        let wrap = |path: &Path| {
            let path = path.to_path_buf();
            move |source| SandboxError::WorkDir { path, source }
        };

        tokio::fs::create_dir_all(work_root)
            .await
            .map_err(wrap(work_root))?;
        let path = work_root.join(id);
        tokio::fs::create_dir(&path).await.map_err(wrap(&path))?;

        let dir = Self {
            id: id.to_string(),
            path,
        };
        for sub in [dir.input_dir(), dir.output_dir(), dir.tmp_dir()] {
            tokio::fs::create_dir(&sub).await.map_err(wrap(&sub))?;
        }
        Ok(dir)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn input_dir(&self) -> PathBuf {
        self.path.join("input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.path.join("output")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.path.join("tmp")
    }
}

/// Everything the runner needs besides the working directory.
#[derive(Debug, Clone)]
pub struct Provisioned {
    /// The complete guest environment.
    pub env: BTreeMap<String, String>,
    pub limits: ResourceLimits,
    /// Variable name -> staged absolute path.
    pub data_files: Vec<(String, PathBuf)>,
}

/// Builds working directories and guest environments.
pub struct EnvironmentProvisioner {
    config: Arc<SandboxConfig>,
    uploads: Arc<dyn UploadStore>,
}

impl EnvironmentProvisioner {
    pub fn new(config: Arc<SandboxConfig>, uploads: Arc<dyn UploadStore>) -> Self {
        Self { config, uploads }
    }

    /// Create the working directory for an execution.
    pub async fn create_workdir(&self, id: &str) -> SandboxResult<WorkingDirectory> {
        let dir = WorkingDirectory::create(&self.config.work_root, id).await?;
        tracing::debug!(path = %dir.path().display(), "Created working directory");
        Ok(dir)
    }

    /// Stage inputs into `workdir` and build the guest environment.
    ///
    /// On failure the directory is left for the caller to remove.
    pub async fn prepare(
        &self,
        workdir: &WorkingDirectory,
        request: &ExecutionRequest,
    ) -> SandboxResult<Provisioned> {
        let mut data_files = Vec::with_capacity(request.data_files.len());
        for (variable, reference) in &request.data_files {
            let staged = self.stage(workdir, variable, reference).await?;
            data_files.push((variable.clone(), staged));
        }

        let limits = self.config.limits_for(request.timeout_secs);
        let env = self.environment(workdir, &data_files, &limits);

        Ok(Provisioned {
            env,
            limits,
            data_files,
        })
    }

    /// Create and prepare in one step, removing the directory on failure.
    pub async fn provision(
        &self,
        request: &ExecutionRequest,
    ) -> SandboxResult<(WorkingDirectory, Provisioned)> {
        request.check(&self.config.output_dir_var)?;
        let workdir = self.create_workdir(&execution_id(request)).await?;
        match self.prepare(&workdir, request).await {
            Ok(provisioned) => Ok((workdir, provisioned)),
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_dir_all(workdir.path()).await {
                    tracing::warn!(path = %workdir.path().display(), error = %rm, "Failed to remove working directory");
                }
                Err(e)
            }
        }
    }

    async fn stage(
        &self,
        workdir: &WorkingDirectory,
        variable: &str,
        reference: &str,
    ) -> SandboxResult<PathBuf> {
        let upload = self
            .uploads
            .resolve(reference)
            .await
            .map_err(|e| SandboxError::staging(variable, reference, e.to_string()))?;

        let dest = workdir
            .input_dir()
            .join(format!("{variable}_{}", sanitize_file_name(&upload.name)));
        tokio::fs::copy(&upload.path, &dest)
            .await
            .map_err(|e| SandboxError::staging(variable, reference, e.to_string()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o644))
                .await
                .map_err(|e| SandboxError::staging(variable, reference, e.to_string()))?;
        }

        tracing::debug!(variable = %variable, reference = %reference, dest = %dest.display(), "Staged data file");
        Ok(dest)
    }

    fn environment(
        &self,
        workdir: &WorkingDirectory,
        data_files: &[(String, PathBuf)],
        limits: &ResourceLimits,
    ) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();

        for name in &self.config.inherit_env {
            if let Ok(value) = std::env::var(name) {
                env.insert(name.clone(), value);
            }
        }
        for (key, value) in &self.config.env_vars {
            env.insert(key.clone(), value.clone());
        }

        let display = |p: &Path| p.to_string_lossy().into_owned();
        let fixed = [
            (self.config.output_dir_var.clone(), display(&workdir.output_dir())),
            ("MPLBACKEND".to_string(), "Agg".to_string()),
            ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
            ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
            ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
            ("LANG".to_string(), "C.UTF-8".to_string()),
            ("LC_ALL".to_string(), "C.UTF-8".to_string()),
            ("HOME".to_string(), display(workdir.path())),
            ("TMPDIR".to_string(), display(&workdir.tmp_dir())),
            (
                "LABBOX_TIMEOUT_SECS".to_string(),
                limits.timeout.as_secs().to_string(),
            ),
            (
                "LABBOX_MEMORY_LIMIT_BYTES".to_string(),
                limits.memory_bytes.to_string(),
            ),
        ];
        env.extend(fixed);

        for (variable, path) in data_files {
            env.insert(
                format!("{DATA_ENV_PREFIX}{}", variable.to_ascii_uppercase()),
                display(path),
            );
        }
        env
    }
}

/// Keep `[A-Za-z0-9._-]`, replace everything else with `_`.
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_start_matches('.') {
        "" => "data".to_string(),
        rest => rest.to_string(),
    }
}
