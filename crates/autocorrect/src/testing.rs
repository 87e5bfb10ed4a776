//! In-memory stand-in for the suggestion process.
//!
//! Each spawn creates duplex pipes and a task that reads request lines,
//! records the word, and writes whatever the handler scripts for it.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{LookupRequest, LookupResponse};
use crate::supervisor::{
    BoxedReader, ChildControl, ProcessExit, ProcessSpawner, SpawnError, SpawnedProcess,
};

/// What the fake process does after reading one request.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    /// Write the string followed by a newline.
    Line(String),
    /// Write the string as-is.
    Raw(String),
    /// Write arbitrary bytes, which need not be UTF-8.
    Bytes(Vec<u8>),
    /// Write nothing.
    Silent,
    /// Exit with the given code, closing stdout.
    Exit(i32),
}

impl Reply {
    pub(crate) fn suggestions(words: &[&str]) -> Self {
        let resp = LookupResponse::suggestions(words.iter().map(|w| w.to_string()).collect());
        Self::Line(serde_json::to_string(&resp).unwrap())
    }
}

/// Handler arguments: zero-based request index within this spawn, request.
type Handler = dyn Fn(usize, &LookupRequest) -> Vec<Reply> + Send + Sync;

#[derive(Clone)]
pub(crate) struct FakeSpawner {
    handler: Arc<Handler>,
    spawns: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<String>>>,
    exit_on_start: Option<i32>,
    fail_spawn: bool,
    stderr: Option<String>,
    stdin_capacity: usize,
    read_delay: Option<Duration>,
}

impl FakeSpawner {
    pub(crate) fn new(
        handler: impl Fn(usize, &LookupRequest) -> Vec<Reply> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Arc::new(handler),
            spawns: Arc::new(AtomicUsize::new(0)),
            received: Arc::new(Mutex::new(Vec::new())),
            exit_on_start: None,
            fail_spawn: false,
            stderr: None,
            stdin_capacity: 64 * 1024,
            read_delay: None,
        }
    }

    /// Answers every word with `[word]`.
    pub(crate) fn echo() -> Self {
        Self::new(|_, req| vec![Reply::suggestions(&[req.word.as_str()])])
    }

    pub(crate) fn exit_on_start(mut self, code: i32) -> Self {
        self.exit_on_start = Some(code);
        self
    }

    pub(crate) fn fail_spawn(mut self) -> Self {
        self.fail_spawn = true;
        self
    }

    pub(crate) fn with_stderr(mut self, text: impl Into<String>) -> Self {
        self.stderr = Some(text.into());
        self
    }

    /// Buffer size of the stdin pipe; writes beyond it wait for the fake to read.
    pub(crate) fn with_stdin_capacity(mut self, bytes: usize) -> Self {
        self.stdin_capacity = bytes;
        self
    }

    /// Sleep before reading each request.
    pub(crate) fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    pub(crate) fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Words read by every spawned instance, in order.
    pub(crate) fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(&self) -> Result<SpawnedProcess, SpawnError> {
        if self.fail_spawn {
            return Err(SpawnError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "no such program",
            )));
        }
        self.spawns.fetch_add(1, Ordering::SeqCst);

        let (parent_stdin, child_stdin) = tokio::io::duplex(self.stdin_capacity);
        let (mut child_stdout, parent_stdout) = tokio::io::duplex(64 * 1024);
        let (mut child_stderr, parent_stderr) = tokio::io::duplex(64 * 1024);
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();

        let handler = Arc::clone(&self.handler);
        let received = Arc::clone(&self.received);
        let exit_on_start = self.exit_on_start;
        let stderr = self.stderr.clone();
        let read_delay = self.read_delay;
        let killed = kill.clone();

        tokio::spawn(async move {
            if let Some(text) = stderr {
                let _ = child_stderr.write_all(text.as_bytes()).await;
            }
            drop(child_stderr);

            let exit = match exit_on_start {
                Some(code) => ProcessExit::code(code),
                None => {
                    let mut lines = BufReader::new(child_stdin).lines();
                    let mut index = 0;
                    'outer: loop {
                        let line = tokio::select! {
                            _ = killed.cancelled() => break ProcessExit::signaled(15),
                            line = async {
                                if let Some(delay) = read_delay {
                                    tokio::time::sleep(delay).await;
                                }
                                lines.next_line().await
                            } => line,
                        };
                        let Ok(Some(line)) = line else {
                            break ProcessExit::code(0);
                        };
                        let req: LookupRequest = match serde_json::from_str(&line) {
                            Ok(req) => req,
                            Err(_) => break ProcessExit::code(2),
                        };
                        received.lock().unwrap().push(req.word.clone());
                        for reply in handler(index, &req) {
                            match reply {
                                Reply::Line(text) => {
                                    let _ = child_stdout.write_all(format!("{text}\n").as_bytes()).await;
                                }
                                Reply::Raw(text) => {
                                    let _ = child_stdout.write_all(text.as_bytes()).await;
                                }
                                Reply::Bytes(bytes) => {
                                    let _ = child_stdout.write_all(&bytes).await;
                                }
                                Reply::Silent => {}
                                Reply::Exit(code) => break 'outer ProcessExit::code(code),
                            }
                        }
                        let _ = child_stdout.flush().await;
                        index += 1;
                    }
                }
            };
            drop(child_stdout);
            exit_tx.send_replace(Some(exit));
        });

        Ok(SpawnedProcess {
            pid: None,
            stdin: Box::new(parent_stdin),
            stdout: Box::new(parent_stdout),
            stderr: Some(Box::new(parent_stderr) as BoxedReader),
            control: Box::new(FakeControl { exit_rx, kill }),
        })
    }
}

struct FakeControl {
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    kill: CancellationToken,
}

#[async_trait]
impl ChildControl for FakeControl {
    async fn wait(&mut self) -> io::Result<ProcessExit> {
        let exit = self
            .exit_rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| io::Error::other("fake process vanished"))?;
        Ok((*exit).unwrap_or_else(ProcessExit::unknown))
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.kill.cancel();
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.kill.cancel();
        Ok(())
    }
}
