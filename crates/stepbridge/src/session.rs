use crate::protocol::{Invocation, WireMessage};
use crate::runners::RunnerTable;
use serde_json::Value;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use stepcore::{Emitter, Event, HandlerRef, StepDefinition, StepError};
use stepruntime::RuntimeConfig;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout};
use tokio::sync::{Mutex, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

/// How long a worker may keep running after its terminal message.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("step '{step_id}': no runner for runtime '{runtime}'")]
    NoRunner { step_id: String, runtime: String },

    #[error("step '{step_id}' is not backed by a handler file")]
    NotAFileStep { step_id: String },

    #[error("step '{step_id}': failed to spawn worker: {message}")]
    Spawn { step_id: String, message: String },

    #[error("step '{step_id}': worker channel failed: {message}")]
    Io { step_id: String, message: String },

    #[error("step '{step_id}': incomplete execution, worker exited ({}) without a result", describe_exit(.exit_code))]
    IncompleteExecution { step_id: String, exit_code: Option<i32> },

    #[error("step '{step_id}': worker timed out after {millis}ms")]
    Timeout { step_id: String, millis: u64 },

    #[error("step '{step_id}': invocation queue is full ({capacity} waiting)")]
    QueueFull { step_id: String, capacity: usize },

    #[error("step '{step_id}': session is closed")]
    SessionClosed { step_id: String },

    #[error("step '{step_id}': invocation cancelled")]
    Cancelled { step_id: String },

    #[error("step '{step_id}': worker reported an error: {message}")]
    Worker { step_id: String, message: String },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "killed by signal".to_string(),
    }
}

impl From<BridgeError> for StepError {
    fn from(e: BridgeError) -> Self {
        match e {
            BridgeError::Timeout { millis, .. } => StepError::Timeout { millis },
            BridgeError::Cancelled { .. } => StepError::Cancelled,
            BridgeError::NoRunner { .. } | BridgeError::NotAFileStep { .. } => {
                StepError::Configuration(e.to_string())
            }
            other => StepError::ExecutionFailed(other.to_string()),
        }
    }
}

/// Settings shared by every bridge session.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub runners: RunnerTable,
    /// Per-invocation limit; the worker is killed when it runs out.
    pub timeout: Option<Duration>,
    /// Invocations allowed to wait while one is in flight.
    pub queue_capacity: usize,
}

impl BridgeConfig {
    pub fn from_runtime(config: &RuntimeConfig) -> Self {
        Self {
            runners: RunnerTable::with_defaults(&config.runners_dir),
            timeout: config.bridge_timeout,
            queue_capacity: config.bridge_queue_capacity,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from_runtime(&RuntimeConfig::default())
    }
}

/// What one completed invocation produced.
#[derive(Debug, Clone)]
pub struct BridgeOutcome {
    pub result: Value,
    /// Events the worker emitted and the bus accepted, in channel order.
    pub emitted: Vec<Event>,
}

enum Terminal {
    Result(Value),
    Error(String),
}

enum Finished {
    Terminal(Terminal),
    Exited(ExitStatus),
}

/// Exclusive channel to the worker processes of one out-of-process step.
///
/// Each invocation runs one worker process. Invocations are serialized
/// through a single slot; up to `queue_capacity` more may wait for it and
/// anything beyond that is rejected.
pub struct BridgeSession {
    step_id: String,
    file: PathBuf,
    runtime: String,
    config: Arc<BridgeConfig>,
    slot: Mutex<()>,
    admission: Arc<Semaphore>,
    closed: CancellationToken,
}

impl BridgeSession {
    pub fn new(step: &StepDefinition, config: Arc<BridgeConfig>) -> Result<Self, BridgeError> {
        let file = match &step.handler {
            Some(HandlerRef::File(file)) => file.clone(),
            _ => {
                return Err(BridgeError::NotAFileStep {
                    step_id: step.id.clone(),
                })
            }
        };
        let runtime = step.language_runtime.clone().unwrap_or_default();
        if config.runners.get(&runtime).is_none() {
            return Err(BridgeError::NoRunner {
                step_id: step.id.clone(),
                runtime,
            });
        }

        Ok(Self {
            step_id: step.id.clone(),
            file,
            runtime,
            admission: Arc::new(Semaphore::new(config.queue_capacity.saturating_add(1))),
            config,
            slot: Mutex::new(()),
            closed: CancellationToken::new(),
        })
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Run one invocation to completion.
    ///
    /// Emit messages are published through `emitter` as they arrive, so they
    /// reach the bus before the invocation resolves. Cancelling `cancel`
    /// kills the worker; events it already emitted stay published.
    pub async fn invoke(
        &self,
        invocation: Invocation,
        emitter: &Emitter,
        cancel: &CancellationToken,
    ) -> Result<BridgeOutcome, BridgeError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let _admitted = match self.admission.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                tracing::warn!(step_id = %self.step_id, trace_id = %invocation.trace_id, "Bridge queue full, rejecting invocation");
                return Err(BridgeError::QueueFull {
                    step_id: self.step_id.clone(),
                    capacity: self.config.queue_capacity,
                });
            }
            Err(TryAcquireError::Closed) => return Err(self.closed_error()),
        };

        let _slot = tokio::select! {
            slot = self.slot.lock() => slot,
            _ = self.closed.cancelled() => return Err(self.closed_error()),
            _ = cancel.cancelled() => return Err(BridgeError::Cancelled { step_id: self.step_id.clone() }),
        };
        if self.is_closed() {
            return Err(self.closed_error());
        }

        self.run_worker(invocation, emitter, cancel).await
    }

    /// Kill the worker in flight and reject every further invocation.
    pub async fn shutdown(&self) {
        if !self.closed.is_cancelled() {
            tracing::debug!(step_id = %self.step_id, "Closing bridge session");
        }
        self.closed.cancel();
        self.admission.close();
        // wait for the in-flight invocation to observe the close
        let _ = self.slot.lock().await;
    }

    /// Let every admitted invocation finish, then close the session.
    ///
    /// Invocations admitted while draining are waited for as well. Runtime
    /// cancellation still kills workers, which ends the drain early.
    pub async fn retire(&self) {
        let all = u32::try_from(self.config.queue_capacity.saturating_add(1)).unwrap_or(u32::MAX);
        tracing::debug!(step_id = %self.step_id, "Draining bridge session");
        // every permit back means nothing is queued or running
        let drained = self.admission.acquire_many(all).await;
        self.shutdown().await;
        drop(drained);
    }

    async fn run_worker(
        &self,
        invocation: Invocation,
        emitter: &Emitter,
        cancel: &CancellationToken,
    ) -> Result<BridgeOutcome, BridgeError> {
        let trace_id = invocation.trace_id.clone();
        let payload = serde_json::to_string(&invocation).map_err(|e| self.io_error(e))?;

        let mut cmd = self
            .config
            .runners
            .command(&self.runtime, &self.file, &payload)
            .ok_or_else(|| BridgeError::NoRunner {
                step_id: self.step_id.clone(),
                runtime: self.runtime.clone(),
            })?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| BridgeError::Spawn {
            step_id: self.step_id.clone(),
            message: e.to_string(),
        })?;
        tracing::debug!(step_id = %self.step_id, trace_id = %trace_id, pid = ?child.id(), "Worker spawned");

        if let Some(stderr) = child.stderr.take() {
            let step_id = self.step_id.clone();
            let trace_id = trace_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(step_id = %step_id, trace_id = %trace_id, "{}", line);
                }
            });
        }

        let stdout = child.stdout.take().ok_or_else(|| BridgeError::Io {
            step_id: self.step_id.clone(),
            message: "worker stdout was not captured".to_string(),
        })?;
        let mut lines = BufReader::new(stdout).lines();
        let mut emitted = Vec::new();

        let deadline = async {
            match self.config.timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };

        let finished = tokio::select! {
            finished = async {
                match self.read_until_terminal(&mut lines, emitter, &mut emitted).await? {
                    Some(terminal) => Ok::<_, BridgeError>(Finished::Terminal(terminal)),
                    // stdout is closed but the worker may still be running
                    None => child
                        .wait()
                        .await
                        .map(Finished::Exited)
                        .map_err(|e| self.io_error(e)),
                }
            } => finished,
            _ = deadline => {
                let millis = self.config.timeout.map(|d| d.as_millis() as u64).unwrap_or_default();
                tracing::warn!(step_id = %self.step_id, trace_id = %trace_id, millis, "Worker timed out, killing it");
                kill(&mut child).await;
                return Err(BridgeError::Timeout { step_id: self.step_id.clone(), millis });
            }
            _ = self.closed.cancelled() => {
                kill(&mut child).await;
                return Err(self.closed_error());
            }
            _ = cancel.cancelled() => {
                kill(&mut child).await;
                return Err(BridgeError::Cancelled { step_id: self.step_id.clone() });
            }
        };

        match finished? {
            Finished::Terminal(terminal) => {
                self.drain(lines, child, trace_id);
                match terminal {
                    Terminal::Result(result) => Ok(BridgeOutcome { result, emitted }),
                    Terminal::Error(message) => Err(BridgeError::Worker {
                        step_id: self.step_id.clone(),
                        message,
                    }),
                }
            }
            Finished::Exited(status) => {
                tracing::warn!(step_id = %self.step_id, trace_id = %trace_id, %status, "Worker exited without a result");
                Err(BridgeError::IncompleteExecution {
                    step_id: self.step_id.clone(),
                    exit_code: exit_code(status),
                })
            }
        }
    }

    /// Read messages in arrival order until a terminal one or end of stream.
    async fn read_until_terminal(
        &self,
        lines: &mut Lines<BufReader<ChildStdout>>,
        emitter: &Emitter,
        emitted: &mut Vec<Event>,
    ) -> Result<Option<Terminal>, BridgeError> {
        while let Some(line) = lines.next_line().await.map_err(|e| self.io_error(e))? {
            if line.trim().is_empty() {
                continue;
            }
            match WireMessage::parse(&line) {
                Ok(WireMessage::Emit { event_type, data }) => {
                    let event = emitter.envelope(event_type, data);
                    if emitter.send(event.clone()) {
                        emitted.push(event);
                    }
                }
                Ok(WireMessage::Log { level, message }) => {
                    forward_log(&self.step_id, emitter.trace_id(), &level, &message);
                }
                Ok(WireMessage::Result(value)) => return Ok(Some(Terminal::Result(value))),
                Ok(WireMessage::Error(message)) => return Ok(Some(Terminal::Error(message))),
                Err(e) => {
                    tracing::warn!(
                        step_id = %self.step_id,
                        trace_id = %emitter.trace_id(),
                        error = %e,
                        line = %truncate(&line),
                        "Skipping malformed worker message"
                    );
                }
            }
        }
        Ok(None)
    }

    /// Discard whatever the worker writes after its terminal message, then reap it.
    fn drain(&self, mut lines: Lines<BufReader<ChildStdout>>, mut child: Child, trace_id: String) {
        let step_id = self.step_id.clone();
        tokio::spawn(async move {
            let leftovers = async {
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    tracing::warn!(
                        step_id = %step_id,
                        trace_id = %trace_id,
                        line = %truncate(&line),
                        "Protocol violation: message after completion discarded"
                    );
                }
                child.wait().await
            };
            if tokio::time::timeout(DRAIN_GRACE, leftovers).await.is_err() {
                tracing::warn!(step_id = %step_id, trace_id = %trace_id, "Worker still running after completion, killing it");
                kill(&mut child).await;
            }
        });
    }

    fn closed_error(&self) -> BridgeError {
        BridgeError::SessionClosed {
            step_id: self.step_id.clone(),
        }
    }

    fn io_error(&self, e: impl std::fmt::Display) -> BridgeError {
        BridgeError::Io {
            step_id: self.step_id.clone(),
            message: e.to_string(),
        }
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::debug!("Worker already gone: {}", e);
    }
}

fn exit_code(status: ExitStatus) -> Option<i32> {
    status.code()
}

fn forward_log(step_id: &str, trace_id: &str, level: &str, message: &str) {
    match level {
        "error" => tracing::error!(step_id, trace_id, "{}", message),
        "warn" | "warning" => tracing::warn!(step_id, trace_id, "{}", message),
        "debug" => tracing::debug!(step_id, trace_id, "{}", message),
        _ => tracing::info!(step_id, trace_id, "{}", message),
    }
}

fn truncate(line: &str) -> &str {
    match line.char_indices().nth(200) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}
