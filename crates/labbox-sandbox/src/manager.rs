//! Execution orchestration.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cleanup::CleanupGuard;
use crate::collector::{Collection, OutputCollector, Snapshot};
use crate::config::SandboxConfig;
use crate::error::SandboxResult;
use crate::language::{self, Language, LaunchContext};
use crate::platform::InterpreterStatus;
use crate::provision::{EnvironmentProvisioner, ExecutionRequest, execution_id};
use crate::result::{ExecutionResult, ExecutionState, Outcome, ResultAssembler, SandboxResponse};
use crate::runner::{Invocation, ProcessOutput, ProcessRunner};
use crate::store::{ArtifactStore, LocalArtifactStore, LocalUploadStore, UploadStore};
use crate::validator::{CodeValidator, LanguagePolicy, ValidationViolation};

/// Records the state-machine path of one execution.
struct StateTrail {
    request_id: String,
    path: Vec<ExecutionState>,
}

impl StateTrail {
    fn new(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            path: vec![ExecutionState::Idle],
        }
    }

    fn current(&self) -> ExecutionState {
        self.path.last().copied().unwrap_or(ExecutionState::Idle)
    }

    fn advance(&mut self, next: ExecutionState) {
        let from = self.current();
        if !from.can_transition_to(next) {
            warn!(request_id = %self.request_id, from = %from, to = %next, "Unexpected state transition");
        }
        debug!(request_id = %self.request_id, from = %from, to = %next, "State transition");
        self.path.push(next);
    }
}

/// What a provisioned run produced.
struct Ran {
    output: ProcessOutput,
    collection: Collection,
    outcome: Outcome,
}

/// Runs untrusted scripts.
///
/// Each call to [`SandboxManager::execute`] walks
/// `Idle → Validating → {Rejected | Provisioning → Running → {Completed |
/// Crashed | TimedOut | Cancelled} → CollectingOutput} → CleaningUp → Done`.
/// Rejected scripts never reach the runner. Cleanup runs on every path.
///
/// The manager is shared across concurrent executions; only configuration
/// and the spawn counter are shared between them.
pub struct SandboxManager {
    config: Arc<SandboxConfig>,
    validator: CodeValidator,
    provisioner: EnvironmentProvisioner,
    runner: ProcessRunner,
    collector: OutputCollector,
}

impl SandboxManager {
    /// Create a manager with explicit stores.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(
        config: SandboxConfig,
        uploads: Arc<dyn UploadStore>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> SandboxResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let validator = CodeValidator::new(
            LanguagePolicy::python().with_extra_modules(config.extra_python_modules.iter().cloned()),
            LanguagePolicy::r().with_extra_modules(config.extra_r_packages.iter().cloned()),
        )
        .with_scoped_reads(config.allow_scoped_reads)
        .with_output_dir_var(config.output_dir_var.clone());

        Ok(Self {
            validator,
            provisioner: EnvironmentProvisioner::new(config.clone(), uploads),
            runner: ProcessRunner::new(config.kill_grace),
            collector: OutputCollector::new(artifacts, config.max_inline_bytes),
            config,
        })
    }

    /// Create a manager backed by local upload and artifact directories.
    pub fn with_local_stores(
        config: SandboxConfig,
        uploads_dir: impl Into<std::path::PathBuf>,
        artifacts_dir: impl Into<std::path::PathBuf>,
    ) -> SandboxResult<Self> {
        Self::new(
            config,
            Arc::new(LocalUploadStore::new(uploads_dir)),
            Arc::new(LocalArtifactStore::new(artifacts_dir)),
        )
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn validator(&self) -> &CodeValidator {
        &self.validator
    }

    /// Processes spawned so far.
    pub fn spawn_count(&self) -> usize {
        self.runner.spawn_count()
    }

    /// Check whether the interpreter for `language` can be found.
    pub fn check_availability(&self, language: Language) -> InterpreterStatus {
        InterpreterStatus::detect(language, self.config.interpreter(language))
    }

    /// Run only the static checks.
    pub fn validate_only(
        &self,
        language: Language,
        code: &str,
        data_variables: &[String],
    ) -> Result<(), Vec<ValidationViolation>> {
        self.validator.validate(language, code, data_variables)
    }

    /// Execute a request.
    ///
    /// Script failures are reported through [`ExecutionResult::outcome`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::SandboxError::InvalidRequest`] for malformed requests, before
    /// any state is created.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> SandboxResult<ExecutionResult> {
        request.check(&self.config.output_dir_var)?;

        let started = Instant::now();
        let exec_id = execution_id(&request);
        let request_id = request.request_id.clone().unwrap_or_else(|| exec_id.clone());
        let timeout_secs = self.config.resolve_timeout(request.timeout_secs).as_secs();
        let mut trail = StateTrail::new(&request_id);

        info!(
            request_id = %request_id,
            language = %request.language,
            data_files = request.data_files.len(),
            "Executing request"
        );

        let mut result = ExecutionResult {
            request_id: request_id.clone(),
            language: request.language,
            text_output: String::new(),
            produced_files: Vec::new(),
            outcome: Outcome::Completed,
            violations: Vec::new(),
            exit_code: None,
            signal: None,
            output_truncated: false,
            timeout_secs,
            elapsed_ms: 0,
            error: None,
            transitions: Vec::new(),
        };

        let mut guard = CleanupGuard::new(&request_id, Default::default());

        trail.advance(ExecutionState::Validating);
        let data_variables = request.data_variables();
        match self
            .validator
            .validate(request.language, &request.code, &data_variables)
        {
            Err(violations) => {
                info!(request_id = %request_id, count = violations.len(), "Rejected by validator");
                trail.advance(ExecutionState::Rejected);
                result.outcome = Outcome::Rejected;
                result.violations = violations;
            }
            Ok(()) => match self
                .run_provisioned(&request, &exec_id, &mut guard, &mut trail, &cancel)
                .await
            {
                Ok(ran) => {
                    result.text_output = merge_text(&ran.output, &ran.collection.notes);
                    result.exit_code = ran.output.exit_code;
                    result.signal = ran.output.signal;
                    result.output_truncated = ran.output.truncated;
                    result.produced_files = ran.collection.files;
                    result.outcome = ran.outcome;
                }
                Err(e) => {
                    warn!(request_id = %request_id, error = %e, state = %trail.current(), "Infrastructure failure");
                    result.outcome = Outcome::InfrastructureError;
                    result.error = Some(e.to_string());
                }
            },
        }

        trail.advance(ExecutionState::CleaningUp);
        guard.finish().await;
        trail.advance(ExecutionState::Done);

        result.elapsed_ms = started.elapsed().as_millis() as u64;
        result.transitions = trail.path;

        info!(
            request_id = %request_id,
            outcome = %result.outcome,
            files = result.produced_files.len(),
            elapsed_ms = result.elapsed_ms,
            "Execution finished"
        );
        Ok(result)
    }

    /// Execute and map the result into a caller-facing response.
    pub async fn execute_and_assemble(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> SandboxResult<SandboxResponse> {
        let result = self.execute(request, cancel).await?;
        Ok(ResultAssembler::assemble(&result))
    }

    async fn run_provisioned(
        &self,
        request: &ExecutionRequest,
        exec_id: &str,
        guard: &mut CleanupGuard,
        trail: &mut StateTrail,
        cancel: &CancellationToken,
    ) -> SandboxResult<Ran> {
        trail.advance(ExecutionState::Provisioning);
        let workdir = self.provisioner.create_workdir(exec_id).await?;
        guard.adopt(workdir.path());
        let provisioned = self.provisioner.prepare(&workdir, request).await?;

        let output_dir = workdir.output_dir();
        let bundle = language::bundle(
            request.language,
            &request.code,
            &LaunchContext {
                output_dir_var: &self.config.output_dir_var,
                output_dir: &output_dir,
                working_dir: workdir.path(),
                data_files: &provisioned.data_files,
                autosave_figures: self.config.autosave_figures,
            },
        );
        let snapshot = Snapshot::capture(workdir.path());

        trail.advance(ExecutionState::Running);
        let invocation = Invocation {
            interpreter: self.config.interpreter(request.language),
            bundle: &bundle,
            working_dir: workdir.path(),
            env: &provisioned.env,
        };
        let output = self
            .runner
            .run(&invocation, &provisioned.limits, guard.tracker(), cancel)
            .await?;

        let (outcome, state) = if output.cancelled {
            (Outcome::Cancelled, ExecutionState::Cancelled)
        } else if output.timed_out {
            (Outcome::TimedOut, ExecutionState::TimedOut)
        } else if output.success() {
            (Outcome::Completed, ExecutionState::Completed)
        } else {
            (Outcome::Crashed, ExecutionState::Crashed)
        };
        trail.advance(state);

        trail.advance(ExecutionState::CollectingOutput);
        let mut skip: Vec<String> = bundle.file_names().map(str::to_string).collect();
        skip.push("tmp".to_string());
        let collection = self
            .collector
            .collect(workdir.path(), &snapshot, &skip)
            .await;

        Ok(Ran {
            output,
            collection,
            outcome,
        })
    }
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxManager")
            .field("work_root", &self.config.work_root)
            .field("spawns", &self.runner.spawn_count())
            .finish()
    }
}

fn merge_text(output: &ProcessOutput, notes: &[String]) -> String {
    let mut text = output.combined_output();
    for note in notes {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(note);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SandboxError;
    use crate::language::InterpreterConfig;
    use tempfile::TempDir;

    fn manager(tmp: &TempDir, config: SandboxConfig) -> SandboxManager {
        SandboxManager::with_local_stores(
            config.with_work_root(tmp.path().join("work")),
            tmp.path().join("uploads"),
            tmp.path().join("artifacts"),
        )
        .unwrap()
    }

    fn work_entries(tmp: &TempDir) -> usize {
        std::fs::read_dir(tmp.path().join("work"))
            .map(|d| d.count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_rejected_request_never_spawns() {
        let tmp = TempDir::new().unwrap();
        let manager = manager(&tmp, SandboxConfig::default());

        let result = manager
            .execute(
                ExecutionRequest::python("import subprocess\nsubprocess.run(['ls'])"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.outcome, Outcome::Rejected);
        assert_eq!(manager.spawn_count(), 0);
        assert_eq!(work_entries(&tmp), 0);
        assert_eq!(
            result.transitions,
            vec![
                ExecutionState::Idle,
                ExecutionState::Validating,
                ExecutionState::Rejected,
                ExecutionState::CleaningUp,
                ExecutionState::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_request_is_error() {
        let tmp = TempDir::new().unwrap();
        let manager = manager(&tmp, SandboxConfig::default());
        let err = manager
            .execute(
                ExecutionRequest::python("print(1)").with_data_file("not-valid", "x"),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_staging_failure_is_infrastructure_error() {
        let tmp = TempDir::new().unwrap();
        let manager = manager(&tmp, SandboxConfig::default());
        let result = manager
            .execute(
                ExecutionRequest::python("print(df)").with_data_file("df", "missing.csv"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.outcome, Outcome::InfrastructureError);
        assert!(result.error.as_deref().unwrap().contains("missing.csv"));
        assert_eq!(manager.spawn_count(), 0);
        assert_eq!(work_entries(&tmp), 0);
        assert_eq!(
            &result.transitions[2..],
            &[
                ExecutionState::Provisioning,
                ExecutionState::CleaningUp,
                ExecutionState::Done
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_infrastructure_error() {
        let tmp = TempDir::new().unwrap();
        let config = SandboxConfig::default().with_interpreter(
            Language::Python,
            InterpreterConfig::new("/nonexistent/python-for-labbox"),
        );
        let manager = manager(&tmp, config);
        let response = manager
            .execute_and_assemble(ExecutionRequest::python("print(1)"), CancellationToken::new())
            .await
            .unwrap();

        assert!(response.metadata.internal_error);
        assert!(response.text.contains("Internal sandbox error"));
        assert_eq!(work_entries(&tmp), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_interpreter_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let config = SandboxConfig::default()
            .with_interpreter(Language::R, InterpreterConfig::new("/bin/sh"))
            .with_autosave_figures(false);
        let manager = manager(&tmp, config);

        let result = manager
            .execute(ExecutionRequest::r("print(1)"), CancellationToken::new())
            .await
            .unwrap();

        // The R launcher is not valid shell; only the run/collect/cleanup path matters here.
        assert_eq!(manager.spawn_count(), 1);
        assert!(matches!(result.outcome, Outcome::Crashed | Outcome::Completed));
        assert!(result.transitions.contains(&ExecutionState::CollectingOutput));
        assert_eq!(result.transitions.last(), Some(&ExecutionState::Done));
        assert_eq!(work_entries(&tmp), 0);
    }

    #[test]
    fn test_validate_only() {
        let tmp = TempDir::new().unwrap();
        let manager = manager(&tmp, SandboxConfig::default());
        assert!(manager.validate_only(Language::Python, "import numpy as np", &[]).is_ok());
        let violations = manager
            .validate_only(Language::Python, "import socket", &[])
            .unwrap_err();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].offending_token, "socket");
    }

    #[test]
    fn test_merge_text() {
        let output = ProcessOutput {
            stdout: "2\n".to_string(),
            ..Default::default()
        };
        let text = merge_text(&output, &["[labbox] skipped x: corrupt".to_string()]);
        assert_eq!(text, "2\n[labbox] skipped x: corrupt");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut config = SandboxConfig::default();
        config.output_dir_var = "bad var".to_string();
        let err = SandboxManager::with_local_stores(config, tmp.path(), tmp.path()).unwrap_err();
        assert!(matches!(err, SandboxError::ConfigError(_)));
    }
}
