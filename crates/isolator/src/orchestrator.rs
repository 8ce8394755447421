//! Orchestrator - runs requests in freshly spawned worker processes.
//!
//! Flow for one request:
//! 1. Encode the request
//! 2. Spawn a worker, start draining its stdout and stderr
//! 3. Write the payload to the worker's stdin and close it
//! 4. Wait for exit (killing the worker if the timeout elapses)
//! 5. Parse the complete stderr capture into a `Response`
//!
//! One request, one process. Each worker is reaped before the next is spawned.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};

use crate::bridge::codec::CodecError;
use crate::bridge::request::Request;
use crate::bridge::response::Response;

/// Environment variable carrying the request id into the worker.
pub const REQUEST_ID_ENV: &str = "ISOLATOR_REQUEST_ID";
/// Path of the worker binary used by [`BinarySpawner::from_env`].
pub const WORKER_BIN_ENV: &str = "ISOLATOR_WORKER_BIN";
/// Timeout in seconds used by [`OrchestratorConfig::from_env`].
pub const TIMEOUT_ENV: &str = "ISOLATOR_TIMEOUT_SECS";

const DEFAULT_WORKER_BIN: &str = "isolator-worker";

/// How long output pipes may stay open after a timeout kill.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Output collected so far from one worker stream.
type Captured = Arc<Mutex<Vec<u8>>>;

/// Identifies one request/worker pair in logs on both sides of the process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSpawnConfig {
    pub request_id: RequestId,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
///
/// Implementations must pipe stdin, stdout and stderr.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<Child, SpawnError>;
}

/// Spawns a worker binary directly.
#[derive(Debug, Clone)]
pub struct BinarySpawner {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
}

impl BinarySpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
        }
    }

    /// Worker binary from `ISOLATOR_WORKER_BIN`, else `isolator-worker` on `PATH`.
    pub fn from_env() -> Self {
        let program = std::env::var_os(WORKER_BIN_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKER_BIN));
        Self::new(program)
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }
}

impl WorkerSpawner for BinarySpawner {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<Child, SpawnError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(REQUEST_ID_ENV, config.request_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout kill reaches anything the worker forks.
        #[cfg(unix)]
        command.process_group(0);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        Ok(command.spawn()?)
    }
}

pub struct OrchestratorConfig {
    pub timeout: Option<Duration>,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl OrchestratorConfig {
    pub fn new(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            timeout: None,
            spawner,
        }
    }

    /// Binary spawner from the environment, timeout from `ISOLATOR_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let timeout = std::env::var(TIMEOUT_ENV).ok().and_then(|raw| {
            match raw.trim().parse::<f64>() {
                Ok(secs) if secs > 0.0 => Some(Duration::from_secs_f64(secs)),
                _ => {
                    tracing::warn!(value = %raw, "Ignoring invalid {}", TIMEOUT_ENV);
                    None
                }
            }
        });
        Self {
            timeout,
            spawner: Arc::new(BinarySpawner::from_env()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("failed to encode request")]
    Encode(#[source] CodecError),
    #[error("failed to spawn worker")]
    Spawn(#[from] SpawnError),
    #[error("worker {0} not captured")]
    MissingPipe(&'static str),
    #[error("failed to wait for worker")]
    Wait(#[source] std::io::Error),
    #[error("failed to read worker {stream}")]
    Read {
        stream: &'static str,
        #[source]
        source: std::io::Error,
    },
    /// The worker wrote a payload that could not be decoded.
    #[error("malformed response payload")]
    Protocol(#[source] CodecError),
}

/// Everything collected from one worker run.
#[derive(Debug)]
pub struct WorkerOutcome {
    pub request_id: RequestId,
    pub response: Response,
    pub stdout: String,
    /// Complete stderr capture, byte for byte.
    pub stderr: Vec<u8>,
    /// Raw process exit code; `None` if the worker was killed by a signal.
    pub status_code: Option<i32>,
    pub timed_out: bool,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self { config }
    }

    pub fn from_env() -> Self {
        Self::new(OrchestratorConfig::from_env())
    }

    /// Run one request in a fresh worker and wait for its response.
    pub async fn run(&self, request: &Request) -> Result<WorkerOutcome, OrchestratorError> {
        let request_id = RequestId::new();
        let payload = request.encode().map_err(OrchestratorError::Encode)?;

        tracing::debug!(
            %request_id,
            job = %request.work_item().job,
            payload_bytes = payload.len(),
            "Spawning worker"
        );
        let mut child = self
            .config
            .spawner
            .spawn(&WorkerSpawnConfig { request_id })?;

        let stdin = child
            .stdin
            .take()
            .ok_or(OrchestratorError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(OrchestratorError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(OrchestratorError::MissingPipe("stderr"))?;

        // Drain both streams while the worker runs so neither pipe fills up.
        let stdout_buf = Captured::default();
        let stderr_buf = Captured::default();
        let stdout_task = tokio::spawn(drain(stdout, Arc::clone(&stdout_buf)));
        let stderr_task = tokio::spawn(drain(stderr, Arc::clone(&stderr_buf)));

        let exchange = deliver_and_wait(&mut child, stdin, &payload, request_id);
        let waited = match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, exchange).await.ok(),
            None => Some(exchange.await),
        };
        let (status, timed_out) = match waited {
            Some(status) => (status.map_err(OrchestratorError::Wait)?, false),
            None => {
                tracing::warn!(%request_id, "Worker timed out, killing it");
                kill_process_group(&child, request_id);
                child.kill().await.map_err(OrchestratorError::Wait)?;
                (child.wait().await.map_err(OrchestratorError::Wait)?, true)
            }
        };

        // After a kill, a surviving descendant may still hold the pipes open.
        let grace = timed_out.then_some(DRAIN_GRACE);
        let (stdout, stderr) = tokio::try_join!(
            join_reader(stdout_task, stdout_buf, "stdout", grace, request_id),
            join_reader(stderr_task, stderr_buf, "stderr", grace, request_id),
        )?;

        let response = Response::parse(&stderr).map_err(OrchestratorError::Protocol)?;
        log_diagnostics(request_id, &stderr, &response);

        let status_code = status.code();
        let response = match status_code {
            Some(code) if code != 0 && !response.has_payload() => response.with_exit_code(code),
            _ => response,
        };

        tracing::debug!(
            %request_id,
            exit_code = response.exit_code(),
            ?status_code,
            timed_out,
            "Worker finished"
        );

        Ok(WorkerOutcome {
            request_id,
            response,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr,
            status_code,
            timed_out,
        })
    }

    /// Run requests one after another, each in its own worker.
    pub async fn run_all<I>(&self, requests: I) -> Result<Vec<WorkerOutcome>, OrchestratorError>
    where
        I: IntoIterator<Item = Request>,
    {
        let mut outcomes = Vec::new();
        for request in requests {
            outcomes.push(self.run(&request).await?);
        }
        Ok(outcomes)
    }
}

async fn deliver_and_wait(
    child: &mut Child,
    mut stdin: ChildStdin,
    payload: &[u8],
    request_id: RequestId,
) -> std::io::Result<ExitStatus> {
    // A worker that dies early closes its stdin; its exit is reported through the response.
    if let Err(e) = stdin.write_all(payload).await {
        tracing::warn!(%request_id, error = %e, "Failed to deliver request payload");
    } else if let Err(e) = stdin.shutdown().await {
        tracing::debug!(%request_id, error = %e, "Failed to close worker stdin");
    }
    drop(stdin);
    child.wait().await
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R, sink: Captured) -> std::io::Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(&chunk[..n]);
    }
}

/// Wait for a drain task, giving up after `grace` and keeping what was read.
async fn join_reader(
    mut task: tokio::task::JoinHandle<std::io::Result<()>>,
    sink: Captured,
    stream: &'static str,
    grace: Option<Duration>,
    request_id: RequestId,
) -> Result<Vec<u8>, OrchestratorError> {
    let joined = match grace {
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => Some(joined),
            Err(_) => {
                tracing::warn!(%request_id, stream, "Worker output still open after kill, abandoning it");
                task.abort();
                None
            }
        },
        None => Some(task.await),
    };
    match joined {
        Some(Ok(Ok(()))) | None => {}
        Some(Ok(Err(source))) => return Err(OrchestratorError::Read { stream, source }),
        Some(Err(e)) => {
            return Err(OrchestratorError::Read {
                stream,
                source: std::io::Error::other(e),
            });
        }
    }
    let captured = std::mem::take(&mut *sink.lock().unwrap_or_else(PoisonError::into_inner));
    Ok(captured)
}

/// Kill the worker's process group. Spawners that did not give the worker its
/// own group are left to `Child::kill`.
#[cfg(unix)]
fn kill_process_group(child: &Child, request_id: RequestId) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        tracing::debug!(%request_id, error = %e, "Could not kill worker process group");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child, _request_id: RequestId) {}

/// Re-emit the worker's diagnostic output through our own tracing.
fn log_diagnostics(request_id: RequestId, stderr: &[u8], response: &Response) {
    let diagnostic = if response.has_payload() {
        &stderr[..response.stderr_length()]
    } else {
        stderr
    };
    for line in String::from_utf8_lossy(diagnostic).lines() {
        let line = line.trim_end();
        if !line.is_empty() {
            tracing::info!(target: "isolator::worker", %request_id, "{}", line);
        }
    }
}
