//! Worker process management.
//!
//! The gateway runs at most one external worker at a time. The OS-facing part
//! is behind [`WorkerLauncher`] / [`WorkerProcess`]; [`WorkerProcessManager`]
//! enforces the single-live-worker rule and hands out [`WorkerHandle`]s whose
//! termination is idempotent.

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::api_objects::{JobInput, TranslationRecord};
use crate::config::WorkerConfig;
use crate::errors::GatewayError;

/// Largest stdout a worker may produce.
pub const MAX_OUTPUT_BYTES: usize = 4 * 1024 * 1024;
const MAX_STDERR_BYTES: usize = 64 * 1024;

pub type WorkerResult = Result<TranslationRecord, GatewayError>;

#[async_trait]
pub trait WorkerProcess: Send {
    /// Resolves once the worker exits. Cancel-safe: dropping the future
    /// leaves the process running and a later call resumes the wait.
    async fn wait(&mut self) -> WorkerResult;

    /// Forcibly stops the worker and reaps it.
    async fn kill(&mut self) -> io::Result<()>;
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, input: &JobInput) -> Result<Box<dyn WorkerProcess>, GatewayError>;
}

/// How a wait on a worker ended.
#[derive(Debug)]
pub enum WaitOutcome {
    Completed(WorkerResult),
    DeadlineElapsed,
    Cancelled,
}

pub struct WorkerProcessManager {
    launcher: Arc<dyn WorkerLauncher>,
    live: Arc<AtomicBool>,
}

impl WorkerProcessManager {
    pub fn new(launcher: Arc<dyn WorkerLauncher>) -> Self {
        WorkerProcessManager {
            launcher,
            live: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn has_live_worker(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub async fn spawn(&self, input: &JobInput) -> Result<WorkerHandle, GatewayError> {
        if self
            .live
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(GatewayError::Spawn {
                details: "a previous worker is still alive".to_string(),
            });
        }
        let live = LiveGuard(self.live.clone());
        let process = self.launcher.launch(input).await?;
        Ok(WorkerHandle {
            process,
            finished: false,
            terminated: false,
            _live: live,
        })
    }
}

struct LiveGuard(Arc<AtomicBool>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct WorkerHandle {
    process: Box<dyn WorkerProcess>,
    finished: bool,
    terminated: bool,
    _live: LiveGuard,
}

impl WorkerHandle {
    /// Waits for the worker until it exits, `deadline` passes, or `cancel`
    /// fires, whichever happens first.
    pub async fn await_result(
        &mut self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> WaitOutcome {
        if self.terminated {
            return WaitOutcome::Completed(Err(GatewayError::worker_failure(
                "worker was already terminated",
            )));
        }
        tokio::select! {
            biased;
            result = self.process.wait() => {
                self.finished = true;
                WaitOutcome::Completed(result)
            }
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
            _ = tokio::time::sleep_until(deadline) => WaitOutcome::DeadlineElapsed,
        }
    }

    /// Stops the worker. A no-op when it already exited or was terminated.
    pub async fn terminate(&mut self) {
        if self.finished || self.terminated {
            return;
        }
        self.terminated = true;
        if let Err(e) = self.process.kill().await {
            tracing::warn!(error = %e, "failed to terminate worker");
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}

/// Launches the configured worker command with `tokio::process`.
///
/// URL jobs receive the URL as the last argument. Text jobs receive `-` and
/// the text on stdin.
pub struct ProcessLauncher {
    config: WorkerConfig,
}

impl ProcessLauncher {
    pub fn new(config: WorkerConfig) -> Self {
        ProcessLauncher { config }
    }

    fn command(&self, input: &JobInput) -> Command {
        let mut command = Command::new(&self.config.program);
        if let Some(script) = &self.config.script {
            command.arg(script);
        }
        command.args(&self.config.args);
        match input {
            JobInput::Url(url) => {
                command.arg(url).stdin(Stdio::null());
            }
            JobInput::Text(_) => {
                command.arg("-").stdin(Stdio::piped());
            }
        }
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }
        command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, input: &JobInput) -> Result<Box<dyn WorkerProcess>, GatewayError> {
        Ok(Box::new(self.spawn_worker(input)?))
    }
}

impl ProcessLauncher {
    fn spawn_worker(&self, input: &JobInput) -> Result<ProcessWorker, GatewayError> {
        let mut child = self.command(input).spawn().map_err(|e| GatewayError::Spawn {
            details: format!("{}: {e}", self.config.program),
        })?;
        tracing::info!(pid = child.id(), input = input.kind(), "worker spawned");

        if let (JobInput::Text(text), Some(mut stdin)) = (input, child.stdin.take()) {
            let text = text.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(text.as_bytes()).await {
                    tracing::debug!(error = %e, "worker closed stdin early");
                }
            });
        }
        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(read_capped(out, MAX_OUTPUT_BYTES)));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(read_capped(err, MAX_STDERR_BYTES)));

        Ok(ProcessWorker {
            child,
            stdout,
            stderr,
        })
    }
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

// Keeps draining past the cap so the worker never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> io::Result<Captured> {
    let mut captured = Captured::default();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(captured);
        }
        let room = cap.saturating_sub(captured.bytes.len());
        if n > room {
            captured.truncated = true;
        }
        captured.bytes.extend_from_slice(&chunk[..n.min(room)]);
    }
}

type Reader = Option<JoinHandle<io::Result<Captured>>>;

async fn collect(reader: &mut Reader) -> Captured {
    let Some(handle) = reader.as_mut() else {
        return Captured::default();
    };
    let captured = match handle.await {
        Ok(Ok(captured)) => captured,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "failed to read worker output");
            Captured::default()
        }
        Err(e) => {
            tracing::debug!(error = %e, "worker output reader stopped");
            Captured::default()
        }
    };
    *reader = None;
    captured
}

struct ProcessWorker {
    child: Child,
    stdout: Reader,
    stderr: Reader,
}

impl ProcessWorker {
    fn abort_readers(&mut self) {
        for reader in [self.stdout.take(), self.stderr.take()].into_iter().flatten() {
            reader.abort();
        }
    }

    #[cfg(test)]
    fn readers_active(&self) -> bool {
        self.stdout.is_some() || self.stderr.is_some()
    }
}

#[async_trait]
impl WorkerProcess for ProcessWorker {
    async fn wait(&mut self) -> WorkerResult {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| GatewayError::worker_failure(format!("failed to wait for worker: {e}")))?;
        let stdout = collect(&mut self.stdout).await;
        let stderr = collect(&mut self.stderr).await;

        if stdout.truncated {
            return Err(GatewayError::worker_failure(format!(
                "worker output exceeded {MAX_OUTPUT_BYTES} bytes"
            )));
        }
        match parse_worker_output(&stdout.bytes) {
            Ok(record) if status.success() => Ok(record),
            Err(GatewayError::WorkerFailure { details }) if !status.success() && stdout.bytes.is_empty() => {
                let tail = last_line(&stderr.bytes);
                Err(GatewayError::worker_failure(match tail {
                    Some(line) => format!("worker exited with {status}: {line}"),
                    None => format!("worker exited with {status} ({details})"),
                }))
            }
            Ok(_) => Err(GatewayError::worker_failure(format!(
                "worker exited with {status}"
            ))),
            Err(e) => Err(e),
        }
    }

    async fn kill(&mut self) -> io::Result<()> {
        let result = match self.child.start_kill() {
            Ok(()) => self.child.wait().await.map(|status| {
                tracing::info!(%status, "worker terminated");
            }),
            // Already reaped.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        };
        // A grandchild may still hold the pipes open.
        self.abort_readers();
        result
    }
}

fn last_line(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Interprets the JSON object a worker prints on stdout.
pub(crate) fn parse_worker_output(stdout: &[u8]) -> WorkerResult {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();
    if text.is_empty() {
        return Err(GatewayError::worker_failure("worker produced no output"));
    }
    let value: Value = serde_json::from_str(text)
        .map_err(|e| GatewayError::worker_failure(format!("malformed worker output: {e}")))?;
    let Value::Object(record) = value else {
        return Err(GatewayError::worker_failure(
            "worker output is not a JSON object",
        ));
    };
    match record.get("status").and_then(Value::as_str) {
        Some("ok") => Ok(record),
        Some("error") => {
            let details = record
                .get("error")
                .or_else(|| record.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown worker error");
            Err(GatewayError::worker_failure(details))
        }
        Some(other) => Err(GatewayError::worker_failure(format!(
            "unexpected worker status {other:?}"
        ))),
        None => Err(GatewayError::worker_failure("worker output has no status")),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::Notify;

    use super::*;

    /// What a spy worker does once launched.
    #[derive(Clone)]
    pub(crate) enum Behavior {
        Succeed(TranslationRecord),
        Fail(String),
        Hang,
        /// Completes with the record once the notify fires.
        WaitFor(Arc<Notify>, TranslationRecord),
        FailToSpawn,
    }

    pub(crate) fn record(json: &str) -> TranslationRecord {
        serde_json::from_str(json).unwrap()
    }

    pub(crate) struct SpyLauncher {
        behavior: Mutex<Behavior>,
        spawns: AtomicUsize,
        kills: Arc<AtomicUsize>,
        inputs: Mutex<Vec<JobInput>>,
    }

    impl SpyLauncher {
        pub(crate) fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(SpyLauncher {
                behavior: Mutex::new(behavior),
                spawns: AtomicUsize::new(0),
                kills: Arc::new(AtomicUsize::new(0)),
                inputs: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn set_behavior(&self, behavior: Behavior) {
            *self.behavior.lock().unwrap() = behavior;
        }

        pub(crate) fn spawns(&self) -> usize {
            self.spawns.load(Ordering::SeqCst)
        }

        pub(crate) fn kills(&self) -> usize {
            self.kills.load(Ordering::SeqCst)
        }

        pub(crate) fn inputs(&self) -> Vec<JobInput> {
            self.inputs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WorkerLauncher for SpyLauncher {
        async fn launch(&self, input: &JobInput) -> Result<Box<dyn WorkerProcess>, GatewayError> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            self.inputs.lock().unwrap().push(input.clone());
            let behavior = self.behavior.lock().unwrap().clone();
            if let Behavior::FailToSpawn = behavior {
                return Err(GatewayError::Spawn {
                    details: "python3: not found".to_string(),
                });
            }
            Ok(Box::new(SpyProcess {
                behavior,
                kills: self.kills.clone(),
            }))
        }
    }

    struct SpyProcess {
        behavior: Behavior,
        kills: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkerProcess for SpyProcess {
        async fn wait(&mut self) -> WorkerResult {
            match &self.behavior {
                Behavior::Succeed(record) => Ok(record.clone()),
                Behavior::Fail(details) => Err(GatewayError::worker_failure(details.clone())),
                Behavior::WaitFor(notify, record) => {
                    notify.notified().await;
                    Ok(record.clone())
                }
                Behavior::Hang | Behavior::FailToSpawn => std::future::pending().await,
            }
        }

        async fn kill(&mut self) -> io::Result<()> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
