//! CommandBridge - owns the child process and correlates requests.
//!
//! Flow:
//! 1. Lazily spawn the child on first dispatch (or eagerly via `restart`)
//! 2. Register a response handle, then write `command + "\n"` to stdin
//! 3. A background reader task owns stdout and routes each completed
//!    line to the oldest outstanding handle
//! 4. `execute` awaits the handle with a fixed deadline; losing the race
//!    yields `ExecuteOutcome::TimedOut`
//! 5. An exit watcher reaps the child and clears the live slot so the
//!    next dispatch starts a replacement
//!
//! Responses are matched to requests purely by order: the child speaks a
//! line protocol with no request ids, so FIFO is the only correlation
//! available. The dispatch lock guarantees registration order equals
//! write order.

use std::collections::VecDeque;
use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::child::{ChildSpawner, SpawnError, drain_stderr};
use crate::health::{BRIDGELET_VERSION, ChildStatus, HealthSnapshot};

/// Reserved response text signaling a correlator-level timeout.
///
/// Wire contract with the gateway; inside the bridge the condition is the
/// distinct [`ExecuteOutcome::TimedOut`] variant, not this string.
pub const TIMEOUT_SENTINEL: &str = "ERROR|Timeout";

/// Upper bound on a single response line. A child that streams unbounded
/// data without a terminator would otherwise grow the accumulation
/// buffer forever.
const MAX_RESPONSE_LINE_BYTES: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Deadline for one line of response after a command is dispatched.
    pub response_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to start child process: {0}")]
    Spawn(#[from] SpawnError),
    #[error("failed to dispatch command to child: {0}")]
    Dispatch(#[source] io::Error),
}

/// Result of one executed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// The child produced a response line before the deadline (trimmed).
    Completed(String),
    /// No response line arrived before the deadline, or the child died
    /// with the request in flight.
    TimedOut,
}

impl ExecuteOutcome {
    /// Render the outcome as the gateway-facing response text.
    pub fn into_output(self) -> String {
        match self {
            Self::Completed(text) => text,
            Self::TimedOut => TIMEOUT_SENTINEL.to_string(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut)
    }
}

/// Transport-facing seam for the bridge.
///
/// Lets the HTTP layer be tested against a mock without a real child
/// process.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &str) -> Result<ExecuteOutcome, BridgeError>;

    async fn health(&self) -> HealthSnapshot;
}

/// Handle to the currently running child.
///
/// Exclusively owned by the bridge; dropping out of the live slot always
/// goes through `kill()` so the exit watcher reaps the process.
struct LiveChild {
    generation: u64,
    stdin: ChildStdin,
    pending_tx: mpsc::UnboundedSender<oneshot::Sender<String>>,
    kill_tx: oneshot::Sender<()>,
}

impl LiveChild {
    /// Ask the exit watcher to terminate and reap this child.
    fn kill(self) {
        // Watcher already gone means the child already exited.
        let _ = self.kill_tx.send(());
    }
}

struct BridgeShared {
    live: Mutex<Option<LiveChild>>,
    generation: AtomicU64,
    last_exit: Mutex<Option<ExitStatus>>,
}

/// Request/response bridge over a single line-oriented child process.
pub struct CommandBridge {
    spawner: Arc<dyn ChildSpawner>,
    config: BridgeConfig,
    shared: Arc<BridgeShared>,
}

impl CommandBridge {
    pub fn new(spawner: Arc<dyn ChildSpawner>, config: BridgeConfig) -> Self {
        Self {
            spawner,
            config,
            shared: Arc::new(BridgeShared {
                live: Mutex::new(None),
                generation: AtomicU64::new(0),
                last_exit: Mutex::new(None),
            }),
        }
    }

    /// Start a child if none is live. Idempotent: never double-starts
    /// while a live handle exists.
    pub async fn ensure_running(&self) -> Result<(), BridgeError> {
        let mut live = self.shared.live.lock().await;
        if live.is_none() {
            self.start_locked(&mut live)?;
        }
        Ok(())
    }

    /// Kill any live child and start a fresh one. With no live child this
    /// degenerates to a plain start, leaving exactly one process running.
    pub async fn restart(&self) -> Result<(), BridgeError> {
        let mut live = self.shared.live.lock().await;
        if let Some(old) = live.take() {
            tracing::info!("terminating child process for restart");
            old.kill();
        }
        self.start_locked(&mut live)?;
        Ok(())
    }

    /// Kill the child unconditionally. Host-exit cleanup, not mid-request
    /// cancellation.
    pub async fn shutdown(&self) {
        let mut live = self.shared.live.lock().await;
        if let Some(old) = live.take() {
            tracing::info!("terminating child process for shutdown");
            old.kill();
        }
    }

    pub async fn is_running(&self) -> bool {
        self.shared.live.lock().await.is_some()
    }

    /// Exit code of the most recently reaped child, if any. Logged
    /// diagnostics, never surfaced to callers.
    pub async fn last_exit_code(&self) -> Option<i32> {
        self.shared.last_exit.lock().await.and_then(|s| s.code())
    }

    fn start_locked<'a>(
        &self,
        slot: &'a mut Option<LiveChild>,
    ) -> Result<&'a mut LiveChild, BridgeError> {
        let mut child = self.spawner.spawn()?;
        let generation = self.shared.generation.fetch_add(1, Ordering::Relaxed) + 1;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr));
        }

        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        tokio::spawn(route_responses(stdout, pending_rx));

        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(watch_exit(
            Arc::clone(&self.shared),
            generation,
            child,
            kill_rx,
        ));

        tracing::info!(generation, "child process started");

        Ok(slot.insert(LiveChild {
            generation,
            stdin,
            pending_tx,
            kill_tx,
        }))
    }

    /// Register a response handle and write the command line, lazily
    /// starting the child first. On a dead pipe the stale child is
    /// discarded and the dispatch retried once against a fresh one.
    async fn dispatch(&self, command: &str) -> Result<oneshot::Receiver<String>, BridgeError> {
        let mut live = self.shared.live.lock().await;
        if live.is_none() {
            self.start_locked(&mut live)?;
        }

        // Writing to a non-existent process must fail loudly, never silently.
        let first_try = match live.as_mut() {
            Some(handle) => try_dispatch(handle, command).await,
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "child process not running",
            )),
        };

        match first_try {
            Ok(rx) => Ok(rx),
            Err(e) => {
                tracing::warn!(error = %e, "dispatch failed, restarting child and retrying once");
                if let Some(old) = live.take() {
                    old.kill();
                }
                let handle = self.start_locked(&mut live)?;
                try_dispatch(handle, command).await.map_err(BridgeError::Dispatch)
            }
        }
    }
}

#[async_trait]
impl CommandExecutor for CommandBridge {
    /// Deliver one command and await one line of response.
    ///
    /// The command text passes through verbatim plus the terminator; no
    /// escaping or validation.
    async fn execute(&self, command: &str) -> Result<ExecuteOutcome, BridgeError> {
        let rx = self.dispatch(command).await?;

        match tokio::time::timeout(self.config.response_timeout, rx).await {
            Ok(Ok(response)) => Ok(ExecuteOutcome::Completed(response)),
            Ok(Err(_)) => {
                // Reader task dropped the handle: the child died with the
                // request in flight. The caller still only ever sees the
                // timeout outcome.
                tracing::warn!("child exited before responding");
                Ok(ExecuteOutcome::TimedOut)
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.response_timeout.as_millis() as u64,
                    "no response before deadline"
                );
                Ok(ExecuteOutcome::TimedOut)
            }
        }
    }

    async fn health(&self) -> HealthSnapshot {
        let child = if self.is_running().await {
            ChildStatus::Running
        } else {
            ChildStatus::Stopped
        };
        HealthSnapshot {
            child,
            last_exit_code: self.last_exit_code().await,
            version: BRIDGELET_VERSION,
        }
    }
}

async fn try_dispatch(
    live: &mut LiveChild,
    command: &str,
) -> io::Result<oneshot::Receiver<String>> {
    let (tx, rx) = oneshot::channel();
    live.pending_tx
        .send(tx)
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "response router gone"))?;
    live.stdin.write_all(command.as_bytes()).await?;
    live.stdin.write_all(b"\n").await?;
    live.stdin.flush().await?;
    Ok(rx)
}

/// Reader task: permanently owns the child's stdout and routes each
/// terminator-completed line to the oldest outstanding request handle.
///
/// Exiting the loop drops every queued handle, which wakes the waiting
/// `execute` calls with a closed channel.
async fn route_responses(
    stdout: ChildStdout,
    mut pending_rx: mpsc::UnboundedReceiver<oneshot::Sender<String>>,
) {
    let mut frames = FramedRead::new(
        stdout,
        LinesCodec::new_with_max_length(MAX_RESPONSE_LINE_BYTES),
    );
    let mut waiting: VecDeque<oneshot::Sender<String>> = VecDeque::new();

    loop {
        tokio::select! {
            registration = pending_rx.recv() => {
                match registration {
                    Some(tx) => waiting.push_back(tx),
                    // Bridge dropped the child handle.
                    None => break,
                }
            }
            frame = frames.next() => {
                match frame {
                    Some(Ok(line)) => {
                        // A handle is always registered before its command is
                        // written, so anything already queued in the channel must
                        // be visible before this line is routed.
                        while let Ok(tx) = pending_rx.try_recv() {
                            waiting.push_back(tx);
                        }
                        route_line(&mut waiting, line.trim().to_string());
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "error reading child stdout");
                        break;
                    }
                    None => {
                        tracing::debug!("child stdout closed");
                        break;
                    }
                }
            }
        }
    }
}

fn route_line(waiting: &mut VecDeque<oneshot::Sender<String>>, mut response: String) {
    while let Some(tx) = waiting.pop_front() {
        // Handles abandoned by a timed-out request are skipped, never
        // handed a later request's response.
        if tx.is_closed() {
            continue;
        }
        match tx.send(response) {
            Ok(()) => return,
            Err(unrouted) => response = unrouted,
        }
    }
    tracing::warn!(output = %response, "no pending request for child output, dropping");
}

/// Exit watcher: reaps the child on its own exit or on a kill request.
///
/// Passive watch, not a retry loop - on unexpected exit it records the
/// status and clears the live slot so the next dispatch starts fresh.
async fn watch_exit(
    shared: Arc<BridgeShared>,
    generation: u64,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
) {
    let status = tokio::select! {
        status = child.wait() => {
            match status {
                Ok(s) => {
                    tracing::warn!(generation, exit_code = ?s.code(), "child process exited unexpectedly");
                    Some(s)
                }
                Err(e) => {
                    tracing::error!(generation, error = %e, "failed to wait for child");
                    None
                }
            }
        }
        _ = kill_rx => {
            if let Err(e) = child.kill().await {
                tracing::warn!(generation, error = %e, "failed to kill child");
            }
            match child.wait().await {
                Ok(s) => {
                    tracing::debug!(generation, exit_code = ?s.code(), "child process terminated by bridge");
                    Some(s)
                }
                Err(e) => {
                    tracing::error!(generation, error = %e, "failed to reap killed child");
                    None
                }
            }
        }
    };

    if let Some(status) = status {
        *shared.last_exit.lock().await = Some(status);
    }

    // A watcher for an old child must never clear a newer one's slot.
    let mut live = shared.live.lock().await;
    if live.as_ref().is_some_and(|l| l.generation == generation) {
        *live = None;
    }
}
