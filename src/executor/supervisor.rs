//! Step executor — owns the worker process and multiplexes calls onto it.
//!
//! Each spawned worker is a *generation*. Three tasks serve a generation:
//! a writer draining the outbound envelope queue into the child's stdin, a
//! reader dispatching envelopes from its stdout, and a monitor that waits for
//! the process to exit and reports it to the supervision loop. Exit events
//! carry the generation id so a stale exit never disturbs a newer worker.

use std::process::Stdio;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::calls::CallTable;
use super::state::{Lifecycle, StateTransition, WorkerState};
use crate::broker::{HostBroker, Resolution};
use crate::config::ExecutorConfig;
use crate::error::ExecutionError;
use crate::protocol::{
    Envelope, ExecutionMeta, ExecutionRequest, LogLevel, LogRecord, StepReference, decode_bytes,
    write_envelopes,
};

/// How long `stop` waits for the worker to exit after killing it.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Point-in-time view of the executor.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStatus {
    pub state: WorkerState,
    pub generation: Option<u64>,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub pending_calls: usize,
    /// Restarts performed since the executor was created.
    pub restarts: u32,
}

/// Runs steps in a supervised worker process.
pub struct StepExecutor {
    inner: Arc<Inner>,
}

struct Inner {
    config: ExecutorConfig,
    broker: Arc<HostBroker>,
    state_tx: watch::Sender<WorkerState>,
    shared: Mutex<Shared>,
    events: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct Shared {
    lifecycle: Lifecycle,
    calls: CallTable,
    generation: Option<Generation>,
    next_generation: u64,
    /// Restart attempts since the last worker became ready.
    restart_attempts: u32,
    restarts: u32,
}

struct Generation {
    id: u64,
    pid: Option<u32>,
    outbound: mpsc::UnboundedSender<Envelope>,
    kill: Option<oneshot::Sender<()>>,
}

/// Expires a call whose caller stopped waiting before the outcome arrived.
struct PendingCall {
    inner: Weak<Inner>,
    call_id: u64,
    armed: bool,
}

impl PendingCall {
    fn new(inner: &Arc<Inner>, call_id: u64) -> Self {
        Self {
            inner: Arc::downgrade(inner),
            call_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let call_id = self.call_id;
        runtime.spawn(async move {
            if inner.shared.lock().await.calls.expire(call_id) {
                debug!(call_id, "Caller stopped waiting, call expired");
            }
        });
    }
}

enum Event {
    Exited { generation: u64, status: String },
}

impl StepExecutor {
    /// Create a stopped executor. Must be called inside a Tokio runtime.
    pub fn new(config: ExecutorConfig, broker: Arc<HostBroker>) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(WorkerState::Stopped);
        let inner = Arc::new(Inner {
            config,
            broker,
            state_tx,
            shared: Mutex::new(Shared::default()),
            events,
        });
        tokio::spawn(supervise(Arc::downgrade(&inner), events_rx));
        Self { inner }
    }

    pub fn broker(&self) -> &Arc<HostBroker> {
        &self.inner.broker
    }

    /// Spawn the worker and wait for its ready notice.
    pub async fn start(&self) -> Result<(), ExecutionError> {
        {
            let mut shared = self.inner.shared.lock().await;
            match shared.lifecycle.state {
                WorkerState::Stopped => {}
                WorkerState::Stopping => return Err(ExecutionError::ShuttingDown),
                _ => return Err(ExecutionError::AlreadyRunning),
            }
            shared.restart_attempts = 0;
        }
        self.inner.launch().await
    }

    /// Kill the worker and fail pending calls with a shutting-down error.
    pub async fn stop(&self) {
        {
            let mut shared = self.inner.shared.lock().await;
            match shared.lifecycle.state {
                WorkerState::Stopped => return,
                WorkerState::Stopping => {}
                _ => {
                    self.inner
                        .set_state(&mut shared, WorkerState::Stopping, "stop requested");
                }
            }

            let failed = shared.calls.fail_all(&ExecutionError::ShuttingDown);
            if failed > 0 {
                info!(failed, "Failed pending calls on shutdown");
            }

            match shared.generation.as_mut() {
                Some(generation) => {
                    if let Some(kill) = generation.kill.take() {
                        let _ = kill.send(());
                    }
                }
                None => {
                    self.inner
                        .set_state(&mut shared, WorkerState::Stopped, "no worker process");
                }
            }
        }

        if !self.wait_for_state(WorkerState::Stopped, STOP_TIMEOUT).await {
            warn!(timeout = ?STOP_TIMEOUT, "Worker did not exit after kill");
        }
    }

    /// Kill the current worker without stopping the executor.
    ///
    /// The exit is handled like any other crash: pending calls fail and a
    /// replacement is spawned if auto-restart is on. Returns false if there
    /// was no live worker.
    pub async fn kill_worker(&self) -> bool {
        let mut shared = self.inner.shared.lock().await;
        let Some(kill) = shared.generation.as_mut().and_then(|g| g.kill.take()) else {
            return false;
        };
        warn!("Killing worker on request");
        kill.send(()).is_ok()
    }

    /// Run a step with the configured call timeout.
    pub async fn execute(
        &self,
        input: Value,
        step_reference: StepReference,
        execution_meta: ExecutionMeta,
    ) -> Result<Value, ExecutionError> {
        self.execute_with_timeout(
            input,
            step_reference,
            execution_meta,
            self.inner.config.call_timeout,
        )
        .await
    }

    /// Run a step, giving up after `timeout`.
    ///
    /// A timed-out step keeps running in the worker; its eventual result is
    /// discarded.
    pub async fn execute_with_timeout(
        &self,
        input: Value,
        step_reference: StepReference,
        execution_meta: ExecutionMeta,
        timeout: Duration,
    ) -> Result<Value, ExecutionError> {
        let (call_id, outcome) = {
            let mut shared = self.inner.shared.lock().await;
            if !shared.lifecycle.state.accepts_calls() {
                return Err(ExecutionError::NotRunning);
            }
            let Some(outbound) = shared.generation.as_ref().map(|g| g.outbound.clone()) else {
                return Err(ExecutionError::NotRunning);
            };

            let (call_id, outcome) = shared.calls.open();
            debug!(
                call_id,
                module_id = %step_reference.module_id,
                module_path = %step_reference.module_path,
                "Dispatching step"
            );
            let request = Envelope::Execute(ExecutionRequest {
                call_id,
                input,
                step_reference,
                execution_meta,
            });
            if outbound.send(request).is_err() {
                shared.calls.cancel(call_id);
                return Err(ExecutionError::NotRunning);
            }
            (call_id, outcome)
        };

        let mut pending = PendingCall::new(&self.inner, call_id);
        let waited = tokio::time::timeout(timeout, outcome).await;
        pending.disarm();

        match waited {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ExecutionError::ShuttingDown),
            Err(_) => {
                self.inner.shared.lock().await.calls.expire(call_id);
                warn!(call_id, ?timeout, "Step call timed out, worker left running");
                Err(ExecutionError::Timeout { call_id, timeout })
            }
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.inner.state_tx.borrow()
    }

    pub async fn status(&self) -> ExecutorStatus {
        let shared = self.inner.shared.lock().await;
        ExecutorStatus {
            state: shared.lifecycle.state,
            generation: shared.generation.as_ref().map(|g| g.id),
            pid: shared.generation.as_ref().and_then(|g| g.pid),
            started_at: shared.lifecycle.started_at,
            pending_calls: shared.calls.len(),
            restarts: shared.restarts,
        }
    }

    /// State transitions so far, oldest first.
    pub async fn history(&self) -> Vec<StateTransition> {
        self.inner.shared.lock().await.lifecycle.transitions.clone()
    }

    /// Wait until the worker reaches `state`. Returns false on timeout.
    pub async fn wait_for_state(&self, state: WorkerState, timeout: Duration) -> bool {
        let mut rx = self.inner.state_tx.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| *s == state)).await,
            Ok(Ok(_))
        )
    }
}

impl Inner {
    fn set_state(&self, shared: &mut Shared, to: WorkerState, reason: impl Into<String>) -> bool {
        let from = shared.lifecycle.state;
        match shared.lifecycle.transition_to(to, Some(reason.into())) {
            Ok(()) => {
                self.state_tx.send_replace(to);
                debug!(%from, %to, "Worker state changed");
                true
            }
            Err(e) => {
                warn!(error = %e, "Rejected worker state change");
                false
            }
        }
    }

    /// Kill `generation` if it is still the live worker.
    async fn kill_generation(&self, generation: u64) {
        let mut shared = self.shared.lock().await;
        if let Some(live) = shared.generation.as_mut()
            && live.id == generation
            && let Some(kill) = live.kill.take()
        {
            let _ = kill.send(());
        }
    }

    /// Spawn a new worker generation and wait for it to report ready.
    async fn launch(self: &Arc<Self>) -> Result<(), ExecutionError> {
        let (ready_tx, ready_rx) = oneshot::channel();

        let generation = {
            let mut shared = self.shared.lock().await;
            if !self.set_state(&mut shared, WorkerState::Starting, "spawning worker") {
                return Err(ExecutionError::AlreadyRunning);
            }

            let worker = &self.config.worker;
            let spawned = Command::new(&worker.program)
                .args(&worker.args)
                .envs(worker.env.iter().map(|(k, v)| (k, v)))
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .kill_on_drop(true)
                .spawn();
            let mut child = match spawned {
                Ok(child) => child,
                Err(e) => {
                    let reason = format!("{}: {e}", worker.program.display());
                    error!(error = %reason, "Failed to spawn worker");
                    self.set_state(&mut shared, WorkerState::Stopped, "spawn failed");
                    return Err(ExecutionError::Spawn(reason));
                }
            };
            let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
                self.set_state(&mut shared, WorkerState::Stopped, "spawn failed");
                return Err(ExecutionError::Spawn("worker stdio unavailable".into()));
            };

            shared.next_generation += 1;
            let id = shared.next_generation;
            let pid = child.id();

            let (outbound, outbound_rx) = mpsc::unbounded_channel();
            tokio::spawn(write_envelopes(stdin, outbound_rx));
            tokio::spawn(read_loop(
                Arc::downgrade(self),
                id,
                stdout,
                outbound.clone(),
                ready_tx,
            ));
            let (kill_tx, kill_rx) = oneshot::channel();
            tokio::spawn(monitor(child, kill_rx, id, self.events.clone()));

            shared.generation = Some(Generation {
                id,
                pid,
                outbound,
                kill: Some(kill_tx),
            });
            info!(generation = id, pid, "Worker spawned");
            id
        };

        let ready = tokio::time::timeout(self.config.start_timeout, ready_rx).await;

        let mut shared = self.shared.lock().await;
        let current = shared.generation.as_ref().map(|g| g.id) == Some(generation);
        match ready {
            Ok(Ok(pid)) if current && shared.lifecycle.state == WorkerState::Starting => {
                self.set_state(&mut shared, WorkerState::Running, format!("worker {pid} ready"));
                shared.restart_attempts = 0;
                info!(generation, pid, "Worker running");
                Ok(())
            }
            Ok(Ok(_)) if current => Err(ExecutionError::ShuttingDown),
            Ok(_) => Err(ExecutionError::Crashed {
                reason: "worker exited before it was ready".into(),
            }),
            Err(_) => {
                if current && let Some(kill) = shared.generation.as_mut().and_then(|g| g.kill.take())
                {
                    let _ = kill.send(());
                }
                error!(generation, timeout = ?self.config.start_timeout, "Worker never became ready");
                Err(ExecutionError::Spawn(format!(
                    "worker not ready within {:?}",
                    self.config.start_timeout
                )))
            }
        }
    }

    async fn on_exit(self: &Arc<Self>, generation: u64, status: String) {
        let restart = {
            let mut shared = self.shared.lock().await;
            if shared.generation.as_ref().map(|g| g.id) != Some(generation) {
                debug!(generation, "Ignoring exit of a replaced worker");
                return;
            }
            shared.generation = None;

            match shared.lifecycle.state {
                WorkerState::Stopping => {
                    info!(generation, %status, "Worker stopped");
                    self.set_state(&mut shared, WorkerState::Stopped, status);
                    false
                }
                WorkerState::Starting if shared.restart_attempts == 0 => {
                    error!(generation, %status, "Worker exited during startup");
                    self.set_state(&mut shared, WorkerState::Stopped, status);
                    false
                }
                _ => {
                    error!(generation, %status, "Worker crashed");
                    self.set_state(&mut shared, WorkerState::Crashed, status.clone());
                    let failed = shared.calls.fail_all(&ExecutionError::Crashed {
                        reason: status.clone(),
                    });
                    if failed > 0 {
                        warn!(failed, "Failed pending calls after crash");
                    }

                    if !self.config.auto_restart {
                        self.set_state(&mut shared, WorkerState::Stopped, "auto-restart disabled");
                        false
                    } else if shared.restart_attempts >= self.config.max_restart_attempts {
                        error!(
                            attempts = shared.restart_attempts,
                            "Giving up on restarting worker"
                        );
                        self.set_state(&mut shared, WorkerState::Stopped, "restart limit reached");
                        false
                    } else {
                        shared.restart_attempts += 1;
                        shared.restarts += 1;
                        true
                    }
                }
            }
        };

        if !restart {
            return;
        }

        tokio::time::sleep(self.config.restart_delay).await;
        if self.shared.lock().await.lifecycle.state != WorkerState::Crashed {
            debug!("Restart abandoned, executor is stopping");
            return;
        }
        info!(delay = ?self.config.restart_delay, "Restarting worker");
        if let Err(e) = self.launch().await {
            warn!(error = %e, "Worker restart failed");
        }
    }

    async fn dispatch(
        &self,
        generation: u64,
        envelope: Envelope,
        outbound: &mpsc::UnboundedSender<Envelope>,
        ready: &mut Option<oneshot::Sender<u32>>,
    ) {
        match envelope {
            Envelope::Ready(notice) => match ready.take() {
                Some(tx) => {
                    let _ = tx.send(notice.pid);
                }
                None => warn!(generation, "Duplicate ready notice"),
            },
            Envelope::Result(result) => {
                let call_id = result.call_id;
                match self.shared.lock().await.calls.complete(result) {
                    Ok(Resolution::Delivered) => debug!(call_id, "Step result delivered"),
                    Ok(Resolution::Late) => {
                        warn!(call_id, "Discarding late result of a timed-out call");
                    }
                    Err(e) => error!(generation, error = %e, "Protocol error: unmatched result"),
                }
            }
            Envelope::CapabilityRequest(req) => {
                let broker = Arc::clone(&self.broker);
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    let response = broker.answer_capability(req).await;
                    let _ = outbound.send(Envelope::CapabilityResponse(response));
                });
            }
            Envelope::StorageRequest(req) => {
                // Enqueue now so storage keeps channel order.
                let pending = self.broker.answer_storage(req);
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    let _ = outbound.send(Envelope::StorageResponse(pending.await));
                });
            }
            Envelope::Log(record) => emit_step_log(generation, &record),
            other => warn!(generation, kind = other.type_name(), "Unexpected envelope from worker"),
        }
    }
}

fn emit_step_log(generation: u64, record: &LogRecord) {
    let message = record.message();
    match record.level {
        LogLevel::Debug => debug!(target: "step", generation, "{message}"),
        LogLevel::Info => info!(target: "step", generation, "{message}"),
        LogLevel::Warn => warn!(target: "step", generation, "{message}"),
        LogLevel::Error => error!(target: "step", generation, "{message}"),
    }
}

async fn supervise(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            Event::Exited { generation, status } => inner.on_exit(generation, status).await,
        }
    }
}

async fn read_loop(
    inner: Weak<Inner>,
    generation: u64,
    stdout: ChildStdout,
    outbound: mpsc::UnboundedSender<Envelope>,
    ready: oneshot::Sender<u32>,
) {
    let mut ready = Some(ready);
    let mut reader = BufReader::new(stdout);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(generation, error = %e, "Failed to read from worker, killing it");
                if let Some(inner) = inner.upgrade() {
                    inner.kill_generation(generation).await;
                }
                break;
            }
        }
        if line.trim_ascii().is_empty() {
            continue;
        }
        let envelope = match decode_bytes(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(generation, error = %e, "Dropping malformed envelope from worker");
                continue;
            }
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner
            .dispatch(generation, envelope, &outbound, &mut ready)
            .await;
    }
    debug!(generation, "Worker output closed");
}

async fn monitor(
    mut child: Child,
    kill: oneshot::Receiver<()>,
    generation: u64,
    events: mpsc::UnboundedSender<Event>,
) {
    // A dropped kill sender (executor gone) also kills the worker.
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            if let Err(e) = child.start_kill() {
                warn!(generation, error = %e, "Failed to kill worker");
            }
            child.wait().await
        }
    };
    let status = match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {e}"),
    };
    let _ = events.send(Event::Exited { generation, status });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerCommand;
    use crate::config_service::StaticConfigService;
    use crate::store::MapStore;

    fn executor(program: &str) -> StepExecutor {
        let broker = Arc::new(HostBroker::new(
            Arc::new(StaticConfigService::default()),
            MapStore::in_memory(),
        ));
        StepExecutor::new(ExecutorConfig::new(WorkerCommand::new(program)), broker)
    }

    #[tokio::test]
    async fn execute_before_start_is_not_running() {
        let executor = executor("/nonexistent/worker");
        let err = executor
            .execute(
                Value::Null,
                StepReference::new("builtin", "echo"),
                ExecutionMeta::new("app", "d1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::NotRunning));
        assert_eq!(executor.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn spawn_failure_leaves_executor_stopped() {
        let executor = executor("/nonexistent/worker");
        let err = executor.start().await.unwrap_err();
        assert!(matches!(err, ExecutionError::Spawn(_)));
        assert_eq!(executor.state(), WorkerState::Stopped);

        let history = executor.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].to, WorkerState::Starting);
    }

    #[tokio::test]
    async fn stop_when_stopped_is_a_no_op() {
        let executor = executor("/nonexistent/worker");
        executor.stop().await;
        assert_eq!(executor.state(), WorkerState::Stopped);
        assert!(!executor.kill_worker().await);
    }

    #[tokio::test]
    async fn status_of_idle_executor() {
        let executor = executor("/nonexistent/worker");
        let status = executor.status().await;
        assert_eq!(status.state, WorkerState::Stopped);
        assert_eq!(status.generation, None);
        assert_eq!(status.pending_calls, 0);
        assert_eq!(status.restarts, 0);
    }
}
