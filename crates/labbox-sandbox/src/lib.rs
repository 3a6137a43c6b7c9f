//! Sandboxed execution of untrusted data-science scripts.
//!
//! This crate runs user-submitted Python or R code in a short-lived,
//! resource-bounded subprocess and returns structured results: text output,
//! at most one inlined image, and references to any other files produced.
//!
//! # Security Model
//!
//! - **Static checks**: imports and calls are screened against per-language
//!   allow/deny lists before anything is spawned. This is a best-effort filter.
//! - **Environment**: the guest starts with a cleared environment and a fresh
//!   working directory that is removed afterwards.
//! - **Resources**: wall-clock timeout, address-space and CPU rlimits, and an
//!   output ceiling. The whole process group is killed on timeout.
//!
//! Container or namespace isolation is expected from the deployment.
//!
//! # Example
//!
//! ```no_run
//! use labbox_sandbox::{ExecutionRequest, SandboxConfig, SandboxManager, Language};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = SandboxManager::with_local_stores(
//!         SandboxConfig::default(),
//!         "/srv/labbox/uploads",
//!         "/srv/labbox/artifacts",
//!     )?;
//!
//!     let status = manager.check_availability(Language::Python);
//!     if !status.is_available() {
//!         eprintln!("{status}");
//!         return Ok(());
//!     }
//!
//!     let request = ExecutionRequest::python("print(1 + 1)").with_timeout(10);
//!     let response = manager
//!         .execute_and_assemble(request, CancellationToken::new())
//!         .await?;
//!     println!("{}", response.text);
//!     Ok(())
//! }
//! ```

mod cleanup;
mod collector;
mod config;
mod error;
mod language;
mod manager;
mod platform;
mod provision;
mod result;
mod runner;
mod sniff;
mod store;
mod validator;

pub use cleanup::{CleanupGuard, CleanupReport};
pub use collector::{Collection, OutputCollector, ProducedFile, Snapshot};
pub use config::{DEFAULT_OUTPUT_DIR_VAR, ResourceLimits, SandboxConfig};
pub use error::{SandboxError, SandboxResult};
pub use language::{InterpreterConfig, Language, LaunchContext, ScriptBundle, ScriptFile, bundle};
pub use manager::SandboxManager;
pub use platform::{InterpreterStatus, Platform};
pub use provision::{
    DATA_ENV_PREFIX, EnvironmentProvisioner, ExecutionRequest, Provisioned, WorkingDirectory,
    execution_id,
};
pub use result::{
    ExecutionResult, ExecutionState, InlineArtifact, NO_OUTPUT_PLACEHOLDER, Outcome,
    ResponseMetadata, ResultAssembler, SandboxResponse,
};
pub use runner::{Invocation, ProcessOutput, ProcessRunner, ProcessTracker};
pub use sniff::{ArtifactCategory, ArtifactKind, Dimensions, HEADER_LIMIT, dimensions};
pub use store::{
    ArtifactStore, FileReference, LocalArtifactStore, LocalUploadStore, ResolvedUpload,
    UploadStore,
};
pub use validator::{CodeValidator, LanguagePolicy, ValidationViolation, ViolationKind};
