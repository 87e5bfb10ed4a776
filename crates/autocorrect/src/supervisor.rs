//! Process supervisor - owns the suggestion process lifecycle.
//!
//! Flow:
//! 1. Spawn the process (stdin/stdout piped, stderr drained into tracing)
//! 2. Start a monitor task that owns the child and publishes its exit
//! 3. Wait for readiness (grace period or probe round trip)
//! 4. Hand the framed pipes to the dispatcher
//!
//! The monitor is the only place the child is waited on or signalled.
//! `ProcessHandle` is a cheap clone of its published state plus the stop
//! token, so the dispatcher can watch for exit without owning the child.

use std::fmt;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{DEFAULT_MAX_FRAME_LENGTH, JsonLinesCodec};
use crate::bridge::protocol::{LookupRequest, LookupResponse};
use crate::error::StartupError;

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Framed process stdin.
pub type RequestWriter = FramedWrite<BoxedWriter, JsonLinesCodec<LookupRequest>>;
/// Framed process stdout.
pub type ResponseReader = FramedRead<BoxedReader, JsonLinesCodec<LookupResponse>>;

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    code: Option<i32>,
    signal: Option<i32>,
}

impl ProcessExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Exit status could not be collected.
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.code
    }

    pub fn signal(&self) -> Option<i32> {
        self.signal
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Io(#[from] io::Error),
    #[error("{0} was not captured")]
    MissingPipe(&'static str),
}

/// Wait/signal access to a spawned child.
#[async_trait]
pub trait ChildControl: Send {
    /// Wait for the child to exit. Must be cancel safe.
    async fn wait(&mut self) -> io::Result<ProcessExit>;

    /// Ask the child to exit (SIGTERM on unix).
    fn terminate(&mut self) -> io::Result<()>;

    /// Force the child to exit.
    fn kill(&mut self) -> io::Result<()>;
}

/// A freshly spawned child with its pipes detached.
pub struct SpawnedProcess {
    pub pid: Option<u32>,
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    pub control: Box<dyn ChildControl>,
}

/// Extension point for different spawn strategies.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self) -> Result<SpawnedProcess, SpawnError>;
}

/// Spawns an OS process with piped stdio.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: String,
    args: Vec<String>,
    current_dir: Option<std::path::PathBuf>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_current_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

impl ProcessSpawner for CommandSpawner {
    fn spawn(&self) -> Result<SpawnedProcess, SpawnError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;
        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take();

        Ok(SpawnedProcess {
            pid: child.id(),
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as BoxedReader),
            control: Box::new(TokioChild(child)),
        })
    }
}

struct TokioChild(Child);

#[async_trait]
impl ChildControl for TokioChild {
    async fn wait(&mut self) -> io::Result<ProcessExit> {
        self.0.wait().await.map(ProcessExit::from)
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        // id() is None once the child has been reaped.
        match self.0.id() {
            Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from),
            None => Ok(()),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.0.start_kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        self.0.start_kill()
    }
}

/// When a freshly spawned process counts as ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Ready once the grace period elapses without the process exiting.
    Grace(Duration),
    /// Ready once a warm-up lookup for `word` gets any well-formed response.
    Probe { word: String, timeout: Duration },
}

impl Default for Readiness {
    fn default() -> Self {
        Self::Grace(Duration::from_secs(13))
    }
}

#[derive(Clone)]
pub struct SupervisorConfig {
    pub spawner: Arc<dyn ProcessSpawner>,
    pub readiness: Readiness,
    pub max_frame_length: usize,
    /// Time between SIGTERM and SIGKILL on stop.
    pub stop_grace: Duration,
}

impl SupervisorConfig {
    pub fn new(spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self {
            spawner,
            readiness: Readiness::default(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            stop_grace: Duration::from_secs(5),
        }
    }

    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }
}

/// Shared view of a supervised process.
#[derive(Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    alive: Arc<AtomicBool>,
    stop: CancellationToken,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    /// Request termination. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Resolves once the process has exited. Cancel safe.
    pub async fn exited(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or_else(ProcessExit::unknown),
            Err(_) => ProcessExit::unknown(),
        }
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("started_at", &self.started_at)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// A ready process: its handle plus the framed pipes.
pub struct RunningProcess {
    pub handle: ProcessHandle,
    pub writer: RequestWriter,
    pub reader: ResponseReader,
}

pub struct Supervisor {
    config: SupervisorConfig,
    current: StdMutex<Option<ProcessHandle>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            current: StdMutex::new(None),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Handle of the most recently started process, alive or not.
    pub fn current(&self) -> Option<ProcessHandle> {
        self.lock_current().clone()
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, Option<ProcessHandle>> {
        match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Supervisor handle mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Spawn the process and wait until it is ready.
    ///
    /// Any previously started process is stopped first. On failure the new
    /// process is stopped before returning.
    pub async fn start(&self) -> Result<RunningProcess, StartupError> {
        self.stop();

        tracing::info!("Spawning suggestion process");
        let SpawnedProcess {
            pid,
            stdin,
            stdout,
            stderr,
            control,
        } = self.config.spawner.spawn()?;

        if let Some(stderr) = stderr {
            spawn_stderr_sink(stderr, pid);
        }

        let handle = spawn_monitor(control, pid, self.config.stop_grace);
        *self.lock_current() = Some(handle.clone());

        let max = self.config.max_frame_length;
        let mut writer = FramedWrite::new(stdin, JsonLinesCodec::with_max_length(max));
        let mut reader = FramedRead::new(stdout, JsonLinesCodec::with_max_length(max));

        tracing::debug!(?pid, readiness = ?self.config.readiness, "Waiting for process readiness");
        if let Err(e) = self.await_ready(&handle, &mut writer, &mut reader).await {
            tracing::error!(?pid, error = %e, "Suggestion process failed to become ready");
            handle.stop();
            return Err(e);
        }

        tracing::info!(?pid, "Suggestion process ready");
        Ok(RunningProcess {
            handle,
            writer,
            reader,
        })
    }

    async fn await_ready(
        &self,
        handle: &ProcessHandle,
        writer: &mut RequestWriter,
        reader: &mut ResponseReader,
    ) -> Result<(), StartupError> {
        match self.config.readiness {
            Readiness::Grace(grace) => {
                tokio::select! {
                    biased;
                    exit = handle.exited() => Err(StartupError::ExitedDuringWarmup(exit)),
                    _ = tokio::time::sleep(grace) => Ok(()),
                }
            }
            Readiness::Probe { ref word, timeout } => {
                // The probe response is consumed here so the dispatcher starts
                // with an empty, aligned stream.
                let probe = async {
                    writer
                        .send(LookupRequest {
                            id: 0,
                            word: word.clone(),
                        })
                        .await
                        .map_err(|e| StartupError::Probe(format!("failed to write probe: {e}")))?;
                    match reader.next().await {
                        Some(Ok(Ok(_))) => Ok(()),
                        Some(Ok(Err(frame))) => Err(StartupError::Probe(frame.to_string())),
                        Some(Err(e)) => Err(StartupError::Probe(format!("read failed: {e}"))),
                        None => Err(StartupError::ExitedDuringWarmup(handle.exited().await)),
                    }
                };
                tokio::select! {
                    biased;
                    exit = handle.exited() => Err(StartupError::ExitedDuringWarmup(exit)),
                    result = probe => result,
                    _ = tokio::time::sleep(timeout) => Err(StartupError::ProbeTimeout(timeout)),
                }
            }
        }
    }

    /// Stop the current process, if any. Idempotent.
    pub fn stop(&self) {
        if let Some(handle) = self.lock_current().as_ref() {
            handle.stop();
        }
    }
}

fn spawn_monitor(
    mut control: Box<dyn ChildControl>,
    pid: Option<u32>,
    stop_grace: Duration,
) -> ProcessHandle {
    let alive = Arc::new(AtomicBool::new(true));
    let stop = CancellationToken::new();
    let (exit_tx, exit_rx) = watch::channel(None);

    let handle = ProcessHandle {
        pid,
        started_at: Utc::now(),
        alive: Arc::clone(&alive),
        stop: stop.clone(),
        exit_rx,
    };

    tokio::spawn(async move {
        let result = tokio::select! {
            result = control.wait() => result,
            _ = stop.cancelled() => {
                tracing::debug!(?pid, "Sending termination signal");
                if let Err(e) = control.terminate() {
                    tracing::debug!(?pid, error = %e, "Terminate signal failed");
                }
                match tokio::time::timeout(stop_grace, control.wait()).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(?pid, ?stop_grace, "Process ignored termination, killing");
                        if let Err(e) = control.kill() {
                            tracing::debug!(?pid, error = %e, "Kill failed");
                        }
                        control.wait().await
                    }
                }
            }
        };

        let exit = result.unwrap_or_else(|e| {
            tracing::error!(?pid, error = %e, "Failed to collect process exit status");
            ProcessExit::unknown()
        });
        alive.store(false, Ordering::SeqCst);

        if stop.is_cancelled() {
            tracing::info!(?pid, %exit, "Suggestion process stopped");
        } else {
            tracing::warn!(?pid, %exit, "Suggestion process exited unexpectedly");
        }
        exit_tx.send_replace(Some(exit));
    });

    handle
}

fn spawn_stderr_sink(stderr: BoxedReader, pid: Option<u32>) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end();
                    if !line.is_empty() {
                        tracing::warn!(target: "autocorrect::process", ?pid, "{}", line);
                    }
                }
                Err(e) => {
                    tracing::debug!(?pid, error = %e, "stderr read failed");
                    break;
                }
            }
        }
    });
}
