//! The seam between device lanes and the executor process.
//!
//! Lanes only see [`RemoteRunner`]: `run` executes one invocation to
//! completion, `follow` starts a continuous output stream that can be
//! cancelled. Failures are values ([`RunOutput`] without an exit code), never
//! errors that cross into the lanes.

use async_trait::async_trait;
use log::{debug, warn};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::remote::protocol::Invocation;

/// Byte written to a follow's stdin to ask it to exit.
pub const CANCEL_BYTE: &[u8] = b"q";

const READ_CHUNK: usize = 4096;

/// Captured result of one executor invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    /// `None` if the executor could not be started or was killed
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn not_started(reason: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            stdout: String::new(),
            stderr: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowEvent {
    Chunk(String),
    /// The follow ended by itself
    Ended(RunOutput),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Exited within the grace period
    Graceful,
    /// Killed after the grace period
    Killed,
    /// Had already ended on its own
    Exited,
}

#[async_trait]
pub trait FollowControl: Send {
    /// Stops the follow within `grace` or kills it. Calling it again returns
    /// the first outcome.
    async fn cancel(&mut self, grace: Duration) -> CancelOutcome;
}

/// A running continuous output stream.
pub struct OutputFollow {
    pub events: mpsc::UnboundedReceiver<FollowEvent>,
    pub control: Box<dyn FollowControl>,
}

#[async_trait]
pub trait RemoteRunner: Send + Sync {
    async fn run(&self, invocation: Invocation) -> RunOutput;

    async fn follow(&self, invocation: Invocation) -> Result<OutputFollow>;
}

/// Runs invocations as child processes of an executor binary.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: PathBuf,
    prefix_args: Vec<String>,
}

impl ProcessRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
        }
    }

    /// Arguments placed before the invocation's own.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix_args.extend(args.into_iter().map(Into::into));
        self
    }

    fn command(&self, invocation: &Invocation) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.prefix_args)
            .args(invocation.to_args())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RemoteRunner for ProcessRunner {
    async fn run(&self, invocation: Invocation) -> RunOutput {
        debug!("Running {} {:?}", self.program.display(), invocation.to_args());

        let mut cmd = self.command(&invocation);
        cmd.stdin(Stdio::null());

        match cmd.output().await {
            Ok(output) => RunOutput {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Err(e) => {
                warn!("Failed to start {}: {}", self.program.display(), e);
                RunOutput::not_started(format!(
                    "Failed to start {}: {}",
                    self.program.display(),
                    e
                ))
            }
        }
    }

    async fn follow(&self, invocation: Invocation) -> Result<OutputFollow> {
        debug!("Following {} {:?}", self.program.display(), invocation.to_args());

        let mut cmd = self.command(&invocation);
        cmd.stdin(Stdio::piped());

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Io(std::io::Error::other("executor stdout not captured")))?;
        let stderr = child.stderr.take();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let driver = tokio::spawn(drive_follow(
            child, stdin, stdout, stderr, event_tx, cancel_rx,
        ));

        Ok(OutputFollow {
            events: event_rx,
            control: Box::new(ProcessFollow {
                cancel_tx: Some(cancel_tx),
                driver: Some(driver),
                outcome: None,
            }),
        })
    }
}

struct ProcessFollow {
    cancel_tx: Option<oneshot::Sender<Duration>>,
    driver: Option<JoinHandle<CancelOutcome>>,
    outcome: Option<CancelOutcome>,
}

#[async_trait]
impl FollowControl for ProcessFollow {
    async fn cancel(&mut self, grace: Duration) -> CancelOutcome {
        if let Some(outcome) = self.outcome {
            return outcome;
        }
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(grace);
        }
        let outcome = match self.driver.take() {
            Some(driver) => driver.await.unwrap_or(CancelOutcome::Killed),
            None => CancelOutcome::Exited,
        };
        self.outcome = Some(outcome);
        outcome
    }
}

/// Owns the follow process: forwards stdout chunks until it ends or a
/// cancellation arrives.
async fn drive_follow(
    mut child: Child,
    stdin: Option<ChildStdin>,
    mut stdout: impl AsyncRead + Unpin,
    stderr: Option<impl AsyncRead + Unpin + Send + 'static>,
    events: mpsc::UnboundedSender<FollowEvent>,
    mut cancel: oneshot::Receiver<Duration>,
) -> CancelOutcome {
    let stderr_task = tokio::spawn(async move {
        let mut text = Vec::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_end(&mut text).await;
        }
        String::from_utf8_lossy(&text).into_owned()
    });

    let mut buf = vec![0u8; READ_CHUNK];
    let mut pending = Vec::new();

    let requested = loop {
        tokio::select! {
            biased;
            grace = &mut cancel => break Some(grace.unwrap_or(Duration::ZERO)),
            read = stdout.read(&mut buf) => match read {
                Ok(0) | Err(_) => break None,
                Ok(n) => forward(&mut pending, &buf[..n], &events),
            },
        }
    };

    if let Some(grace) = requested {
        stderr_task.abort();
        let outcome = stop_child(child, stdin, &mut stdout, &mut pending, &events, grace).await;
        flush_pending(&mut pending, &events);
        return outcome;
    }

    flush_pending(&mut pending, &events);

    let status = tokio::select! {
        biased;
        grace = &mut cancel => {
            stderr_task.abort();
            let grace = grace.unwrap_or(Duration::ZERO);
            return stop_child(child, stdin, &mut stdout, &mut pending, &events, grace).await;
        }
        status = child.wait() => status,
    };

    let stderr = stderr_task.await.unwrap_or_default();
    let output = RunOutput {
        exit_code: status.ok().and_then(|s| s.code()),
        stdout: String::new(),
        stderr,
    };
    debug!("Follow ended with {:?}", output.exit_code);
    let _ = events.send(FollowEvent::Ended(output));
    CancelOutcome::Exited
}

/// Writes the cancellation byte, closes stdin and keeps forwarding stdout for
/// up to `grace` while the process exits, then kills it.
async fn stop_child(
    mut child: Child,
    stdin: Option<ChildStdin>,
    stdout: &mut (impl AsyncRead + Unpin),
    pending: &mut Vec<u8>,
    events: &mpsc::UnboundedSender<FollowEvent>,
    grace: Duration,
) -> CancelOutcome {
    let graceful = tokio::time::timeout(grace, async {
        if let Some(mut stdin) = stdin {
            let _ = stdin.write_all(CANCEL_BYTE).await;
            let _ = stdin.flush().await;
        }

        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => forward(pending, &buf[..n], events),
            }
        }
        child.wait().await
    })
    .await;

    match graceful {
        Ok(_) => CancelOutcome::Graceful,
        Err(_) => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill follow process: {}", e);
            }
            CancelOutcome::Killed
        }
    }
}

fn forward(pending: &mut Vec<u8>, bytes: &[u8], events: &mpsc::UnboundedSender<FollowEvent>) {
    let text = decode_chunk(pending, bytes);
    if !text.is_empty() {
        let _ = events.send(FollowEvent::Chunk(text));
    }
}

/// Sends a trailing incomplete sequence as replacement characters.
fn flush_pending(pending: &mut Vec<u8>, events: &mpsc::UnboundedSender<FollowEvent>) {
    if !pending.is_empty() {
        let _ = events.send(FollowEvent::Chunk(
            String::from_utf8_lossy(pending).into_owned(),
        ));
        pending.clear();
    }
}

/// Decodes as much UTF-8 as possible, keeping an incomplete trailing
/// sequence for the next chunk. Invalid bytes become replacement characters.
fn decode_chunk(pending: &mut Vec<u8>, bytes: &[u8]) -> String {
    pending.extend_from_slice(bytes);
    let mut text = String::new();

    loop {
        match std::str::from_utf8(pending) {
            Ok(valid) => {
                text.push_str(valid);
                pending.clear();
                return text;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                match e.error_len() {
                    None => {
                        text.push_str(&String::from_utf8_lossy(&pending[..valid]));
                        pending.drain(..valid);
                        return text;
                    }
                    Some(invalid) => {
                        text.push_str(&String::from_utf8_lossy(&pending[..valid + invalid]));
                        pending.drain(..valid + invalid);
                    }
                }
            }
        }
    }
}
