//! Dispatcher - the single loop that owns the pipe conversation.
//!
//! Flow:
//! 1. Lookups arrive over an mpsc channel (append is atomic by construction)
//! 2. If idle, the queue head is written to the process stdin
//! 3. Each decoded stdout frame settles the queue head, then the next head
//!    is written
//! 4. On process exit, stdout EOF, write failure or response timeout: fail
//!    every pending caller and respawn under the restart policy
//!
//! Everything runs on one task, so no two dispatch steps ever overlap and
//! the queue needs no lock.
//!
//! Correlation is by order only. If the process ever drops, duplicates or
//! reorders a response, every later caller receives the wrong answer. The
//! optional `id` echo in responses is the only guard against that.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::bridge::codec::MalformedFrame;
use crate::bridge::protocol::{LookupRequest, LookupResponse, ResponseOutcome};
use crate::error::{LookupError, StartupError};
use crate::health::{Health, ProcessInfo};
use crate::queue::{LookupQueue, LookupResult, Settled};
use crate::supervisor::{
    ProcessExit, ProcessHandle, RequestWriter, ResponseReader, RunningProcess, Supervisor,
};

/// Respawn limits after the process is lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Consecutive restarts allowed before giving up. Reset by a successful lookup.
    pub max_restarts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RestartPolicy {
    /// Never respawn; the first loss is permanent.
    pub fn never() -> Self {
        Self {
            max_restarts: 0,
            ..Self::default()
        }
    }

    /// Exponential backoff for the given zero-based attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

pub(crate) enum Command {
    Lookup {
        word: String,
        responder: oneshot::Sender<LookupResult>,
        enqueued_at: Instant,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Future returned by [`DispatcherHandle::enqueue`].
///
/// Dropping it abandons the lookup. If the request was already written, its
/// response is still consumed to keep the stream aligned.
#[must_use = "a lookup does nothing unless awaited"]
pub struct PendingLookup {
    rx: Option<oneshot::Receiver<LookupResult>>,
}

impl PendingLookup {
    /// A lookup that fails immediately with `ProcessUnavailable`.
    pub(crate) fn unavailable() -> Self {
        Self { rx: None }
    }
}

impl Future for PendingLookup {
    type Output = LookupResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.rx.as_mut() {
            // Dispatcher gone: nothing will ever answer.
            None => Poll::Ready(Err(LookupError::ProcessUnavailable)),
            Some(rx) => Pin::new(rx)
                .poll(cx)
                .map(|r| r.unwrap_or(Err(LookupError::ProcessUnavailable))),
        }
    }
}

/// Cloneable sender side of the dispatcher.
#[derive(Clone)]
pub struct DispatcherHandle {
    commands: mpsc::UnboundedSender<Command>,
    health: watch::Receiver<Health>,
    process: watch::Receiver<Option<ProcessInfo>>,
}

impl DispatcherHandle {
    /// Append a lookup to the queue. Never blocks.
    pub fn enqueue(&self, word: impl Into<String>) -> PendingLookup {
        let (responder, rx) = oneshot::channel();
        let command = Command::Lookup {
            word: word.into(),
            responder,
            enqueued_at: Instant::now(),
        };
        match self.commands.send(command) {
            Ok(()) => PendingLookup { rx: Some(rx) },
            Err(_) => PendingLookup::unavailable(),
        }
    }

    pub fn health(&self) -> Health {
        *self.health.borrow()
    }

    pub fn health_watch(&self) -> watch::Receiver<Health> {
        self.health.clone()
    }

    pub fn process_info(&self) -> Option<ProcessInfo> {
        self.process.borrow().clone()
    }

    /// Fail pending lookups, stop the process and end the loop.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// Start the dispatch loop around an already running process.
pub fn spawn_dispatcher(
    supervisor: Arc<Supervisor>,
    process: RunningProcess,
    policy: RestartPolicy,
    response_timeout: Option<Duration>,
) -> DispatcherHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (health_tx, health_rx) = watch::channel(Health::Ready);
    let (process_tx, process_rx) = watch::channel(None);

    let mut dispatcher = Dispatcher {
        supervisor,
        queue: LookupQueue::new(),
        process: None,
        writer: None,
        reader: None,
        restart: None,
        restarts: 0,
        total_restarts: 0,
        policy,
        response_timeout,
        commands: commands_rx,
        health: health_tx,
        process_info: process_tx,
    };
    dispatcher.install(process);

    tokio::spawn(dispatcher.run());

    DispatcherHandle {
        commands: commands_tx,
        health: health_rx,
        process: process_rx,
    }
}

type RestartTask = JoinHandle<Result<RunningProcess, StartupError>>;

struct Dispatcher {
    supervisor: Arc<Supervisor>,
    queue: LookupQueue,

    // Present together while a process is live.
    process: Option<ProcessHandle>,
    writer: Option<RequestWriter>,
    reader: Option<ResponseReader>,

    restart: Option<RestartTask>,
    /// Consecutive restarts since the last successful lookup.
    restarts: u32,
    total_restarts: u32,
    policy: RestartPolicy,
    response_timeout: Option<Duration>,

    commands: mpsc::UnboundedReceiver<Command>,
    health: watch::Sender<Health>,
    process_info: watch::Sender<Option<ProcessInfo>>,
}

type Frame = Option<Result<Result<LookupResponse, MalformedFrame>, io::Error>>;

async fn next_frame(reader: &mut Option<ResponseReader>) -> Frame {
    match reader {
        Some(reader) => reader.next().await,
        None => std::future::pending().await,
    }
}

async fn process_exit(process: &Option<ProcessHandle>) -> ProcessExit {
    match process {
        Some(handle) => handle.exited().await,
        None => std::future::pending().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn restart_finished(
    restart: &mut Option<RestartTask>,
) -> Result<Result<RunningProcess, StartupError>, tokio::task::JoinError> {
    match restart {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

impl Dispatcher {
    async fn run(mut self) {
        loop {
            let response_deadline = self.response_deadline();
            tokio::select! {
                biased;

                frame = next_frame(&mut self.reader) => {
                    self.on_frame(frame).await;
                }

                exit = process_exit(&self.process) => {
                    self.on_process_lost(&format!("process exited ({exit})"));
                }

                _ = deadline(response_deadline) => {
                    self.on_response_timeout();
                }

                result = restart_finished(&mut self.restart) => {
                    self.restart = None;
                    self.on_restart_finished(result).await;
                }

                command = self.commands.recv() => match command {
                    Some(Command::Lookup { word, responder, enqueued_at }) => {
                        self.on_lookup(word, responder, enqueued_at).await;
                    }
                    Some(Command::Shutdown(ack)) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
            }
        }

        tracing::info!("Dispatcher exiting");
    }

    fn response_deadline(&self) -> Option<Instant> {
        let timeout = self.response_timeout?;
        self.queue.dispatched_at().map(|at| at + timeout)
    }

    fn install(&mut self, process: RunningProcess) {
        let RunningProcess {
            handle,
            writer,
            reader,
        } = process;
        self.process_info.send_replace(Some(ProcessInfo {
            pid: handle.pid(),
            started_at: handle.started_at().to_rfc3339(),
            restarts: self.total_restarts,
        }));
        self.process = Some(handle);
        self.writer = Some(writer);
        self.reader = Some(reader);
        self.health.send_replace(Health::Ready);
    }

    async fn on_lookup(
        &mut self,
        word: String,
        responder: oneshot::Sender<LookupResult>,
        enqueued_at: Instant,
    ) {
        if self.writer.is_none() {
            tracing::debug!(health = ?*self.health.borrow(), "Rejecting lookup, process unavailable");
            let _ = responder.send(Err(LookupError::ProcessUnavailable));
            return;
        }
        let seq = self.queue.push(word, responder, enqueued_at);
        tracing::trace!(seq, queued = self.queue.len(), "Lookup enqueued");
        self.dispatch_next().await;
    }

    /// Write the queue head if nothing is in flight.
    async fn dispatch_next(&mut self) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let started = Instant::now();
        let Some(head) = self.queue.begin_dispatch(started) else {
            return;
        };
        let request = LookupRequest {
            id: head.seq(),
            word: head.word().to_string(),
        };
        let seq = request.id;

        // send() waits for the pipe to drain, which is the backpressure point.
        // The write spends from the same deadline as the response wait.
        let write = writer.send(request);
        let result = match self.response_timeout {
            Some(timeout) => match tokio::time::timeout_at(started + timeout, write).await {
                Ok(result) => result.map_err(Some),
                Err(_) => Err(None),
            },
            None => write.await.map_err(Some),
        };

        match result {
            Ok(()) => {
                tracing::trace!(seq, "Request written");
                self.queue.mark_written();
            }
            Err(Some(e)) => {
                tracing::error!(seq, error = %e, "Failed to write request");
                self.on_process_lost(&format!("write failed: {e}"));
            }
            Err(None) => {
                tracing::error!(seq, "Write to process blocked past response timeout");
                self.on_response_timeout();
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame) {
        let result = match frame {
            Some(Ok(Ok(response))) => {
                if let (Some(got), Some(expected)) = (response.id, self.queue.awaiting_seq())
                    && got != expected
                {
                    tracing::error!(
                        got,
                        expected,
                        "Response id does not match queue head, stream is desynchronised"
                    );
                    self.on_process_lost("response out of order");
                    return;
                }
                match response.into_outcome() {
                    ResponseOutcome::Suggestions(suggestions) => Ok(suggestions),
                    ResponseOutcome::Rejected(error) => Err(LookupError::Rejected(error)),
                    ResponseOutcome::Empty => Err(LookupError::Decode(
                        "response carries neither suggestions nor error".to_string(),
                    )),
                }
            }
            Some(Ok(Err(malformed))) => {
                tracing::warn!(error = %malformed, "Malformed response frame");
                Err(LookupError::Decode(malformed.to_string()))
            }
            Some(Err(e)) => {
                self.on_process_lost(&format!("stdout read failed: {e}"));
                return;
            }
            None => {
                self.on_process_lost("stdout closed");
                return;
            }
        };

        let ok = result.is_ok();
        match self.queue.settle_head(result) {
            Settled::Delivered { seq, elapsed } => {
                tracing::debug!(
                    target: "autocorrect::lookup",
                    seq,
                    ok,
                    latency_ms = elapsed.as_millis() as u64,
                    "Lookup settled"
                );
                if ok {
                    self.restarts = 0;
                }
            }
            Settled::Abandoned { seq } => {
                tracing::debug!(target: "autocorrect::lookup", seq, "Caller went away, response discarded");
            }
            Settled::Unsolicited => {
                tracing::warn!("Dropping response with no request awaiting it");
            }
        }

        self.dispatch_next().await;
    }

    /// The in-flight request ran past its deadline. Fatal to the pipe:
    /// without an id, later responses could not be matched reliably.
    fn on_response_timeout(&mut self) {
        let Some(timeout) = self.response_timeout else {
            return;
        };
        tracing::error!(?timeout, queued = self.queue.len(), "Suggestion process timed out");
        self.queue.fail_head(LookupError::Timeout(timeout));
        self.on_process_lost("response timeout");
    }

    /// Tear down the current process, fail everyone waiting, and schedule a
    /// respawn if the policy allows. Idempotent while no process is live.
    fn on_process_lost(&mut self, reason: &str) {
        let Some(handle) = self.process.take() else {
            return;
        };
        self.writer = None;
        self.reader = None;
        handle.stop();

        let failed = self.queue.fail_all(LookupError::ProcessUnavailable);
        tracing::error!(pid = ?handle.pid(), reason, failed, "Suggestion process lost");

        self.schedule_restart();
    }

    fn schedule_restart(&mut self) {
        if self.restarts >= self.policy.max_restarts {
            tracing::error!(
                restarts = self.restarts,
                "Restart limit reached, suggestion process is defunct"
            );
            self.health.send_replace(Health::Defunct);
            return;
        }

        let backoff = self.policy.backoff(self.restarts);
        self.restarts += 1;
        self.total_restarts += 1;
        self.health.send_replace(Health::Restarting);
        tracing::info!(attempt = self.restarts, ?backoff, "Restarting suggestion process");

        let supervisor = Arc::clone(&self.supervisor);
        self.restart = Some(tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            supervisor.start().await
        }));
    }

    async fn on_restart_finished(
        &mut self,
        result: Result<Result<RunningProcess, StartupError>, tokio::task::JoinError>,
    ) {
        match result {
            Ok(Ok(process)) => {
                tracing::info!(pid = ?process.handle.pid(), "Suggestion process restarted");
                self.install(process);
                self.dispatch_next().await;
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Restart failed");
                self.schedule_restart();
            }
            Err(e) => {
                tracing::error!(error = %e, "Restart task panicked");
                self.schedule_restart();
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Some(task) = self.restart.take() {
            task.abort();
        }
        let failed = self.queue.fail_all(LookupError::ProcessUnavailable);
        if failed > 0 {
            tracing::info!(failed, "Failed pending lookups on shutdown");
        }
        self.health.send_replace(Health::Stopped);

        self.writer = None;
        self.reader = None;
        self.supervisor.stop();
        if let Some(handle) = self.process.take() {
            let bound = self.supervisor.config().stop_grace + Duration::from_secs(1);
            match tokio::time::timeout(bound, handle.exited()).await {
                Ok(exit) => tracing::info!(%exit, "Suggestion process shut down"),
                Err(_) => tracing::warn!("Suggestion process did not exit in time"),
            }
        }
    }
}
