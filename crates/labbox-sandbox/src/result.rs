//! Execution results and the caller-facing response.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::collector::ProducedFile;
use crate::language::Language;
use crate::sniff::Dimensions;
use crate::store::FileReference;
use crate::validator::ValidationViolation;

/// Text returned when a successful run printed nothing.
pub const NO_OUTPUT_PLACEHOLDER: &str = "Code executed successfully (no output)";

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    TimedOut,
    Crashed,
    Rejected,
    Cancelled,
    InfrastructureError,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Outcome::Completed => "completed",
            Outcome::TimedOut => "timed_out",
            Outcome::Crashed => "crashed",
            Outcome::Rejected => "rejected",
            Outcome::Cancelled => "cancelled",
            Outcome::InfrastructureError => "infrastructure_error",
        };
        f.write_str(name)
    }
}

/// States of the per-execution state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Idle,
    Validating,
    Rejected,
    Provisioning,
    Running,
    TimedOut,
    Crashed,
    Completed,
    Cancelled,
    CollectingOutput,
    CleaningUp,
    Done,
}

impl ExecutionState {
    /// Whether `next` may follow `self`.
    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        if next == CleaningUp {
            return !matches!(self, CleaningUp | Done);
        }
        matches!(
            (self, next),
            (Idle, Validating)
                | (Validating, Rejected)
                | (Validating, Provisioning)
                | (Provisioning, Running)
                | (Running, TimedOut)
                | (Running, Crashed)
                | (Running, Completed)
                | (Running, Cancelled)
                | (TimedOut, CollectingOutput)
                | (Crashed, CollectingOutput)
                | (Completed, CollectingOutput)
                | (Cancelled, CollectingOutput)
                | (CleaningUp, Done)
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Terminal record of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub request_id: String,
    pub language: Language,
    /// Merged stdout/stderr plus collector notes.
    pub text_output: String,
    pub produced_files: Vec<ProducedFile>,
    pub outcome: Outcome,
    pub violations: Vec<ValidationViolation>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub output_truncated: bool,
    /// Applied wall-clock limit.
    pub timeout_secs: u64,
    pub elapsed_ms: u64,
    /// Infrastructure failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// State-machine path taken.
    pub transitions: Vec<ExecutionState>,
}

impl ExecutionResult {
    /// The inlined artifact, if any.
    pub fn primary_artifact(&self) -> Option<&ProducedFile> {
        self.produced_files.iter().find(|f| f.is_primary())
    }

    /// Files handed to the artifact store.
    pub fn file_references(&self) -> impl Iterator<Item = &FileReference> {
        self.produced_files.iter().filter_map(|f| f.reference.as_ref())
    }
}

/// Caller-facing response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<InlineArtifact>,
    pub files: Vec<FileReference>,
    pub metadata: ResponseMetadata,
}

/// The primary artifact, inlined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineArtifact {
    pub name: String,
    pub mime_type: String,
    /// Base64 encoded content.
    pub data: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Dimensions>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub request_id: String,
    pub outcome: Outcome,
    pub has_binary_output: bool,
    pub timed_out: bool,
    pub cancelled: bool,
    pub rejected: bool,
    pub crashed: bool,
    pub internal_error: bool,
    pub output_truncated: bool,
    pub exit_code: Option<i32>,
    pub file_count: usize,
    pub elapsed_ms: u64,
}

/// Maps an [`ExecutionResult`] into a [`SandboxResponse`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultAssembler;

impl ResultAssembler {
    pub fn assemble(result: &ExecutionResult) -> SandboxResponse {
        let artifact = result.primary_artifact().and_then(|file| {
            Some(InlineArtifact {
                name: file.file_name().to_string(),
                mime_type: file.mime_type.clone(),
                data: file.binary_payload.clone()?,
                size_bytes: file.size_bytes,
                dimensions: file.dimensions,
            })
        });
        let files: Vec<FileReference> = result.file_references().cloned().collect();

        let metadata = ResponseMetadata {
            request_id: result.request_id.clone(),
            outcome: result.outcome,
            has_binary_output: artifact.is_some(),
            timed_out: result.outcome == Outcome::TimedOut,
            cancelled: result.outcome == Outcome::Cancelled,
            rejected: result.outcome == Outcome::Rejected,
            crashed: result.outcome == Outcome::Crashed,
            internal_error: result.outcome == Outcome::InfrastructureError,
            output_truncated: result.output_truncated,
            exit_code: result.exit_code,
            file_count: files.len() + usize::from(artifact.is_some()),
            elapsed_ms: result.elapsed_ms,
        };

        SandboxResponse {
            text: compose_text(result),
            artifact,
            files,
            metadata,
        }
    }
}

fn compose_text(result: &ExecutionResult) -> String {
    if result.outcome == Outcome::Rejected {
        let mut text = String::from("Code validation failed. The following are not allowed:");
        for violation in &result.violations {
            text.push_str(&format!("\n- {violation}"));
        }
        return text;
    }

    let body = result.text_output.trim_end();
    let mut text = match (body.is_empty(), result.outcome) {
        (true, Outcome::Completed) => NO_OUTPUT_PLACEHOLDER.to_string(),
        (true, Outcome::InfrastructureError) => String::new(),
        (true, _) => "(no output)".to_string(),
        (false, _) => body.to_string(),
    };

    if result.output_truncated {
        text.push_str("\n\n[output truncated: the output limit was reached]");
    }

    let guidance = match result.outcome {
        Outcome::TimedOut => Some(format!(
            "Execution timed out after {} seconds. Reduce the amount of work or sample the data.",
            result.timeout_secs
        )),
        Outcome::Cancelled => Some("Execution was cancelled.".to_string()),
        Outcome::Crashed => Some(match (result.exit_code, result.signal) {
            (_, Some(9)) => {
                "Process was killed (signal 9). It may have exceeded the memory limit.".to_string()
            }
            (_, Some(signal)) => format!("Process was terminated by signal {signal}."),
            (Some(code), None) => format!("Process exited with code {code}."),
            (None, None) => "Process exited abnormally.".to_string(),
        }),
        Outcome::InfrastructureError => Some(format!(
            "Internal sandbox error: {}",
            result.error.as_deref().unwrap_or("unknown")
        )),
        Outcome::Completed | Outcome::Rejected => None,
    };

    if let Some(guidance) = guidance {
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        text.push_str(&guidance);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sniff::ArtifactKind;
    use crate::validator::ViolationKind;

    fn result(outcome: Outcome, text: &str) -> ExecutionResult {
        ExecutionResult {
            request_id: "req".to_string(),
            language: Language::Python,
            text_output: text.to_string(),
            produced_files: Vec::new(),
            outcome,
            violations: Vec::new(),
            exit_code: Some(0),
            signal: None,
            output_truncated: false,
            timeout_secs: 30,
            elapsed_ms: 12,
            error: None,
            transitions: Vec::new(),
        }
    }

    fn image() -> ProducedFile {
        ProducedFile {
            path: "output/plot.png".to_string(),
            kind: ArtifactKind::Png,
            mime_type: "image/png".to_string(),
            size_bytes: 33,
            dimensions: Some(Dimensions {
                width: 100,
                height: 50,
            }),
            binary_payload: Some("iVBORw0KGgo=".to_string()),
            reference: None,
        }
    }

    #[test]
    fn test_completed_text() {
        let response = ResultAssembler::assemble(&result(Outcome::Completed, "2\n"));
        assert_eq!(response.text, "2");
        assert!(response.artifact.is_none());
        assert!(!response.metadata.has_binary_output);
        assert_eq!(response.metadata.outcome, Outcome::Completed);
    }

    #[test]
    fn test_placeholder_when_empty() {
        let response = ResultAssembler::assemble(&result(Outcome::Completed, "  \n"));
        assert_eq!(response.text, NO_OUTPUT_PLACEHOLDER);
    }

    #[test]
    fn test_rejection_lists_violations() {
        let mut r = result(Outcome::Rejected, "");
        r.violations = vec![ValidationViolation {
            kind: ViolationKind::ForbiddenImport,
            offending_token: "subprocess".to_string(),
            line: 1,
        }];
        let response = ResultAssembler::assemble(&r);
        assert!(response.metadata.rejected);
        assert!(response.text.starts_with("Code validation failed"));
        assert!(response.text.contains("subprocess"));
    }

    #[test]
    fn test_timeout_guidance() {
        let mut r = result(Outcome::TimedOut, "partial");
        r.timeout_secs = 2;
        r.exit_code = None;
        let response = ResultAssembler::assemble(&r);
        assert!(response.metadata.timed_out);
        assert!(response.text.starts_with("partial"));
        assert!(response.text.contains("timed out after 2 seconds"));
    }

    #[test]
    fn test_crash_guidance() {
        let mut r = result(Outcome::Crashed, "Traceback ...");
        r.exit_code = Some(1);
        let response = ResultAssembler::assemble(&r);
        assert!(response.metadata.crashed);
        assert_eq!(response.metadata.exit_code, Some(1));
        assert!(response.text.contains("exited with code 1"));
    }

    #[test]
    fn test_infrastructure_error() {
        let mut r = result(Outcome::InfrastructureError, "");
        r.error = Some("spawn failed".to_string());
        let response = ResultAssembler::assemble(&r);
        assert!(response.metadata.internal_error);
        assert_eq!(response.text, "Internal sandbox error: spawn failed");
    }

    #[test]
    fn test_inline_artifact_and_references() {
        let mut r = result(Outcome::Completed, "");
        let mut csv = image();
        csv.path = "output/data.csv".to_string();
        csv.kind = ArtifactKind::Csv;
        csv.mime_type = "text/csv".to_string();
        csv.dimensions = None;
        csv.binary_payload = None;
        csv.reference = Some(FileReference {
            id: "f1".to_string(),
            original_name: "data.csv".to_string(),
            size_bytes: 10,
            mime_type: "text/csv".to_string(),
        });
        r.produced_files = vec![image(), csv];

        let response = ResultAssembler::assemble(&r);
        let artifact = response.artifact.as_ref().unwrap();
        assert_eq!(artifact.name, "plot.png");
        assert_eq!(artifact.dimensions.unwrap().width, 100);
        assert_eq!(response.files.len(), 1);
        assert_eq!(response.metadata.file_count, 2);
        assert!(response.metadata.has_binary_output);
    }

    #[test]
    fn test_truncation_note() {
        let mut r = result(Outcome::Completed, "lots");
        r.output_truncated = true;
        let response = ResultAssembler::assemble(&r);
        assert!(response.metadata.output_truncated);
        assert!(response.text.contains("output truncated"));
    }

    #[test]
    fn test_transitions() {
        use ExecutionState::*;
        assert!(Idle.can_transition_to(Validating));
        assert!(Validating.can_transition_to(CleaningUp));
        assert!(Running.can_transition_to(CleaningUp));
        assert!(CleaningUp.can_transition_to(Done));
        assert!(!Done.can_transition_to(CleaningUp));
        assert!(!Rejected.can_transition_to(Running));
        assert!(!Idle.can_transition_to(Running));
    }

    #[test]
    fn test_response_serializes() {
        let response = ResultAssembler::assemble(&result(Outcome::Completed, "ok"));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["metadata"]["outcome"], "completed");
        assert!(json.get("artifact").is_none());
    }
}
