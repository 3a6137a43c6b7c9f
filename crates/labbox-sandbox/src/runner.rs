//! Guest process execution.
//!
//! The runner writes the script bundle into the working directory, spawns the
//! interpreter with a cleared environment in its own process group, and races
//! process exit against the timeout and the caller's cancellation token.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ResourceLimits;
use crate::error::{SandboxError, SandboxResult};
use crate::language::{InterpreterConfig, ScriptBundle};

const READ_CHUNK: usize = 8192;

/// What to run and where.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub interpreter: &'a InterpreterConfig,
    pub bundle: &'a ScriptBundle,
    pub working_dir: &'a Path,
    pub env: &'a BTreeMap<String, String>,
}

/// Captured result of one guest process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// Terminating signal, if it was killed.
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
    /// Output went past the ceiling and the rest was discarded.
    pub truncated: bool,
    pub elapsed: Duration,
}

impl ProcessOutput {
    /// Exited with status 0 on its own.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }

    /// Combine stdout and stderr for display.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n\n--- stderr ---\n{}", self.stdout, self.stderr)
        }
    }
}

/// Process group of the running guest, shared with cleanup.
///
/// Holds the group only while its leader is unreaped. The zombie leader pins
/// the id, so signalling a tracked group never reaches a recycled one.
#[derive(Debug, Clone, Default)]
pub struct ProcessTracker {
    pgid: Arc<Mutex<Option<i32>>>,
}

impl ProcessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, pgid: i32) {
        *self.pgid.lock() = Some(pgid);
    }

    pub fn current(&self) -> Option<i32> {
        *self.pgid.lock()
    }

    /// Forget the group without signalling it.
    pub fn clear(&self) {
        *self.pgid.lock() = None;
    }

    /// SIGKILL the tracked group. Returns whether anything was signalled.
    pub fn kill_group(&self) -> bool {
        let Some(pgid) = self.current() else {
            return false;
        };
        kill_process_group(pgid)
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: i32) -> bool {
    if pgid <= 1 {
        return false;
    }
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc == 0 {
        tracing::debug!(pgid, "Killed process group");
        true
    } else {
        false
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: i32) -> bool {
    false
}

/// Remaining output allowance shared by both streams.
#[derive(Debug)]
struct OutputBudget {
    remaining: AtomicUsize,
    truncated: AtomicBool,
}

impl OutputBudget {
    fn new(limit: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(limit),
            truncated: AtomicBool::new(false),
        }
    }

    /// Reserve up to `wanted` bytes; returns how many may be kept.
    fn take(&self, wanted: usize) -> usize {
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
                Some(left - left.min(wanted))
            })
            .unwrap_or(0);
        let granted = previous.min(wanted);
        if granted < wanted {
            self.truncated.store(true, Ordering::Release);
        }
        granted
    }

    fn truncated(&self) -> bool {
        self.truncated.load(Ordering::Acquire)
    }
}

enum Wait {
    Exited,
    TimedOut,
    Cancelled,
}

/// Kills and forgets the group unless the leader was reaped normally.
///
/// Declared after the child so it drops first, while the leader is unreaped.
struct GroupGuard<'a> {
    tracker: &'a ProcessTracker,
    armed: bool,
}

impl<'a> GroupGuard<'a> {
    fn new(tracker: &'a ProcessTracker) -> Self {
        Self {
            tracker,
            armed: true,
        }
    }

    /// The leader has been reaped; its id may be reused from here on.
    fn release(mut self) {
        self.armed = false;
        self.tracker.clear();
    }
}

impl Drop for GroupGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.tracker.kill_group();
            self.tracker.clear();
        }
    }
}

/// Spawns and supervises guest interpreters.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    spawns: Arc<AtomicUsize>,
    kill_grace: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl ProcessRunner {
    /// `kill_grace` bounds how long output pipes may stay open after the
    /// guest exits before the group is killed.
    pub fn new(kill_grace: Duration) -> Self {
        Self {
            spawns: Arc::new(AtomicUsize::new(0)),
            kill_grace,
        }
    }

    /// Number of processes spawned through this runner (and its clones).
    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Run the bundle to completion, timeout or cancellation.
    pub async fn run(
        &self,
        invocation: &Invocation<'_>,
        limits: &ResourceLimits,
        tracker: &ProcessTracker,
        cancel: &CancellationToken,
    ) -> SandboxResult<ProcessOutput> {
        for file in &invocation.bundle.files {
            tokio::fs::write(invocation.working_dir.join(&file.name), &file.contents).await?;
        }

        let mut cmd = self.command(invocation, limits);
        let program = invocation.interpreter.program.display().to_string();
        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            program: program.clone(),
            source,
        })?;
        self.spawns.fetch_add(1, Ordering::SeqCst);

        let started = Instant::now();
        if let Some(pid) = child.id() {
            tracker.track(pid as i32);
        }
        let group = GroupGuard::new(tracker);
        tracing::debug!(
            program = %program,
            pid = ?child.id(),
            timeout = ?limits.timeout,
            "Spawned guest process"
        );

        let budget = Arc::new(OutputBudget::new(limits.output_bytes));
        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let mut pumps: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(out, stdout_buf.clone(), budget.clone())));
        }
        if let Some(err) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(err, stderr_buf.clone(), budget.clone())));
        }

        let waited = tokio::select! {
            biased;
            exited = leader_exited(&mut child) => {
                exited?;
                Wait::Exited
            }
            _ = tokio::time::sleep(limits.timeout) => Wait::TimedOut,
            _ = cancel.cancelled() => Wait::Cancelled,
        };

        let (timed_out, cancelled) = match waited {
            Wait::Exited => (false, false),
            other => {
                let timed_out = matches!(other, Wait::TimedOut);
                let reason = if timed_out { "timeout" } else { "cancelled" };
                tracing::info!(
                    program = %program,
                    elapsed = ?started.elapsed(),
                    reason,
                    "Killing guest process group"
                );
                tracker.kill_group();
                if let Err(e) = child.start_kill() {
                    tracing::debug!(error = %e, "start_kill after killpg");
                }
                (timed_out, !timed_out)
            }
        };
        let elapsed = started.elapsed();

        self.drain(pumps, tracker).await;

        // Sweep descendants that outlived the leader, then reap it.
        tracker.kill_group();
        let status = child.wait().await?;
        group.release();

        let output = ProcessOutput {
            exit_code: status.code(),
            signal: exit_signal(&status),
            stdout: String::from_utf8_lossy(&stdout_buf.lock()).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_buf.lock()).into_owned(),
            timed_out,
            cancelled,
            truncated: budget.truncated(),
            elapsed,
        };

        tracing::debug!(
            exit_code = ?output.exit_code,
            signal = ?output.signal,
            timed_out,
            cancelled,
            truncated = output.truncated,
            elapsed = ?elapsed,
            "Guest process finished"
        );
        Ok(output)
    }

    fn command(&self, invocation: &Invocation<'_>, limits: &ResourceLimits) -> Command {
        let mut cmd = Command::new(&invocation.interpreter.program);
        cmd.args(&invocation.interpreter.args)
            .arg(invocation.working_dir.join(&invocation.bundle.entry))
            .current_dir(invocation.working_dir)
            .env_clear()
            .envs(invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            cmd.process_group(0);
            let memory = limits.memory_bytes;
            let cpu_secs = limits.timeout.as_secs() + self.kill_grace.as_secs() + 1;
            // SAFETY: the closure only issues getrlimit/setrlimit, which are
            // async-signal-safe.
            unsafe {
                cmd.pre_exec(move || apply_rlimits(memory, cpu_secs));
            }
        }
        #[cfg(not(unix))]
        let _ = limits;

        cmd
    }

    /// Wait for the output pumps; kill the group if a descendant keeps a pipe open.
    async fn drain(&self, pumps: Vec<JoinHandle<()>>, tracker: &ProcessTracker) {
        let deadline = tokio::time::Instant::now() + self.kill_grace;
        let mut killed = false;
        for mut pump in pumps {
            if tokio::time::timeout_at(deadline, &mut pump).await.is_ok() {
                continue;
            }
            if !killed {
                tracing::debug!("Output still open after exit, killing process group");
                tracker.kill_group();
                killed = true;
            }
            if tokio::time::timeout(self.kill_grace, &mut pump).await.is_err() {
                tracing::warn!("Abandoning output pump that did not close");
                pump.abort();
            }
        }
    }
}

/// Resolves once the leader has exited, leaving it unreaped.
#[cfg(unix)]
async fn leader_exited(child: &mut tokio::process::Child) -> std::io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    tokio::task::spawn_blocking(move || wait_without_reaping(pid as libc::id_t))
        .await
        .map_err(std::io::Error::other)?
}

#[cfg(unix)]
fn wait_without_reaping(pid: libc::id_t) -> std::io::Result<()> {
    loop {
        // SAFETY: siginfo_t is plain data; waitid only writes into it.
        let rc = unsafe {
            let mut info: libc::siginfo_t = std::mem::zeroed();
            libc::waitid(
                libc::P_PID,
                pid,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Without process groups there is nothing to pin; reaping early is fine.
#[cfg(not(unix))]
async fn leader_exited(child: &mut tokio::process::Child) -> std::io::Result<()> {
    child.wait().await.map(|_| ())
}

async fn pump<R>(mut reader: R, sink: Arc<Mutex<Vec<u8>>>, budget: Arc<OutputBudget>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let keep = budget.take(n);
                if keep > 0 {
                    sink.lock().extend_from_slice(&buf[..keep]);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Output pipe read failed");
                break;
            }
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
macro_rules! lower_rlimit {
    ($resource:expr, $value:expr) => {{
        let mut current = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit($resource, &mut current) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let value = ($value as libc::rlim_t).min(current.rlim_max);
        let limit = libc::rlimit {
            rlim_cur: value,
            rlim_max: value,
        };
        if libc::setrlimit($resource, &limit) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }};
}

/// Runs in the forked child before exec.
#[cfg(unix)]
fn apply_rlimits(memory_bytes: u64, cpu_secs: u64) -> std::io::Result<()> {
    // SAFETY: plain syscalls on stack-allocated structs.
    unsafe {
        lower_rlimit!(libc::RLIMIT_CORE, 0);
        lower_rlimit!(libc::RLIMIT_CPU, cpu_secs);
        if memory_bytes > 0 {
            lower_rlimit!(libc::RLIMIT_AS, memory_bytes);
        }
    }
    Ok(())
}
