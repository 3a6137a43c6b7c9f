//! Per-execution cleanup.
//!
//! Every execution owns one [`CleanupGuard`]. Calling [`CleanupGuard::finish`]
//! kills whatever is left of the guest's process group and removes the
//! working directory. If the guard is dropped without being finished (a panic
//! or an early return), `Drop` performs the same work synchronously.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::runner::ProcessTracker;

const REMOVE_ATTEMPTS: u32 = 3;
const REMOVE_BACKOFF: Duration = Duration::from_millis(50);

/// What cleanup actually did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// A live process group was signalled.
    pub killed_processes: bool,
    /// The working directory is gone.
    pub removed_dir: bool,
}

/// Kills leftovers and removes the working directory exactly once.
#[derive(Debug)]
pub struct CleanupGuard {
    request_id: String,
    workdir: Option<PathBuf>,
    tracker: ProcessTracker,
    finished: bool,
}

impl CleanupGuard {
    pub fn new(request_id: impl Into<String>, tracker: ProcessTracker) -> Self {
        Self {
            request_id: request_id.into(),
            workdir: None,
            tracker,
            finished: false,
        }
    }

    /// Take responsibility for a working directory.
    pub fn adopt(&mut self, workdir: impl Into<PathBuf>) {
        self.workdir = Some(workdir.into());
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    pub fn tracker(&self) -> &ProcessTracker {
        &self.tracker
    }

    /// Run cleanup. Failures are logged, never returned.
    pub async fn finish(mut self) -> CleanupReport {
        self.finished = true;
        // Only set while the leader is unreaped; the runner clears it on reap.
        let killed_processes = self.tracker.kill_group();
        self.tracker.clear();

        let removed_dir = match self.workdir.take() {
            Some(dir) => remove_async(&dir, &self.request_id).await,
            None => true,
        };

        debug!(
            request_id = %self.request_id,
            killed_processes,
            removed_dir,
            "Cleanup finished"
        );
        CleanupReport {
            killed_processes,
            removed_dir,
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(request_id = %self.request_id, "Cleanup guard dropped without finish, cleaning up synchronously");
        self.tracker.kill_group();
        self.tracker.clear();
        if let Some(dir) = self.workdir.take() {
            remove_sync(&dir, &self.request_id);
        }
    }
}

async fn remove_async(dir: &Path, request_id: &str) -> bool {
    for attempt in 1..=REMOVE_ATTEMPTS {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => return true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return true,
            Err(e) if attempt == REMOVE_ATTEMPTS => {
                warn!(request_id = %request_id, path = %dir.display(), error = %e, "Failed to remove working directory");
            }
            Err(_) => tokio::time::sleep(REMOVE_BACKOFF).await,
        }
    }
    false
}

fn remove_sync(dir: &Path, request_id: &str) -> bool {
    for attempt in 1..=REMOVE_ATTEMPTS {
        match std::fs::remove_dir_all(dir) {
            Ok(()) => return true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return true,
            Err(e) if attempt == REMOVE_ATTEMPTS => {
                warn!(request_id = %request_id, path = %dir.display(), error = %e, "Failed to remove working directory");
            }
            Err(_) => std::thread::sleep(REMOVE_BACKOFF),
        }
    }
    false
}
