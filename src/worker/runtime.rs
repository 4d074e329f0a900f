//! Worker runtime — runs inside the child process.
//!
//! Reads envelopes from the supervisor, runs each `execute` on its own task,
//! and writes exactly one `result` per call. Capability and storage calls
//! made by steps go back over the same channel through a [`WorkerBroker`].

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::log::ChannelLog;
use crate::broker::WorkerBroker;
use crate::config::ContextConfig;
use crate::context::{StepLog, build_context};
use crate::error::{ResolveError, Result};
use crate::protocol::{
    Envelope, ErrorKind, ErrorPayload, ExecutionRequest, ExecutionResult, ReadyNotice, decode_bytes,
    write_envelopes,
};
use crate::steps::{Completion, StepCall, StepOutcome, StepResolver};

pub struct WorkerRuntime {
    resolver: Arc<dyn StepResolver>,
    config: ContextConfig,
}

fn result_envelope(call_id: u64, outcome: StepOutcome) -> Envelope {
    let (err, output) = match outcome {
        Ok(output) => (None, Some(output)),
        Err(err) => (Some(err), None),
    };
    Envelope::Result(ExecutionResult {
        call_id,
        err,
        output,
    })
}

impl WorkerRuntime {
    pub fn new(resolver: Arc<dyn StepResolver>, config: ContextConfig) -> Self {
        Self { resolver, config }
    }

    /// Serve the worker protocol on stdin/stdout.
    pub async fn run_stdio(self) -> Result<()> {
        self.run(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve the worker protocol until `reader` reaches end of stream.
    pub async fn run<R, W>(self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_envelopes(writer, rx));

        let broker = Arc::new(WorkerBroker::new(
            outbound.clone(),
            self.config.capability_timeout,
        ));
        let runtime = Arc::new(self);

        let pid = std::process::id();
        // Receiver lives in the writer task spawned above.
        let _ = outbound.send(Envelope::Ready(ReadyNotice { pid }));
        info!(pid, "Worker ready");

        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                break;
            }
            if line.trim_ascii().is_empty() {
                continue;
            }
            let envelope = match decode_bytes(&line) {
                Ok(envelope) => envelope,
                Err(e) => {
                    error!(error = %e, "Dropping malformed envelope from supervisor");
                    continue;
                }
            };

            match envelope {
                Envelope::Execute(request) => {
                    let runtime = Arc::clone(&runtime);
                    let broker = Arc::clone(&broker);
                    let outbound = outbound.clone();
                    tokio::spawn(async move { runtime.execute(request, broker, outbound).await });
                }
                Envelope::CapabilityResponse(response) => {
                    if let Err(e) = broker.resolve_capability(response).await {
                        error!(error = %e, "Protocol error: unmatched capability response");
                    }
                }
                Envelope::StorageResponse(response) => {
                    if let Err(e) = broker.resolve_storage(response).await {
                        error!(error = %e, "Protocol error: unmatched storage response");
                    }
                }
                other => {
                    warn!(kind = other.type_name(), "Unexpected envelope from supervisor");
                }
            }
        }

        info!("Supervisor channel closed, worker exiting");
        Ok(())
    }

    async fn execute(
        &self,
        request: ExecutionRequest,
        broker: Arc<WorkerBroker>,
        outbound: mpsc::UnboundedSender<Envelope>,
    ) {
        let call_id = request.call_id;
        let reference = request.step_reference;
        let send = |outcome: StepOutcome| {
            if outbound.send(result_envelope(call_id, outcome)).is_err() {
                warn!(call_id, "Result dropped, supervisor channel closed");
            }
        };

        let resolved = match self
            .resolver
            .resolve(&reference.module_id, &reference.module_path)
        {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(call_id, error = %e, "Step resolution failed");
                send(Err(e.to_payload()));
                return;
            }
        };

        if resolved.error_catching != reference.is_error_catching {
            let module_id = reference.module_id.clone();
            let module_path = reference.module_path.clone();
            let e = if reference.is_error_catching {
                ResolveError::NotErrorCatching {
                    module_id,
                    module_path,
                }
            } else {
                ResolveError::ErrorCatchingOnly {
                    module_id,
                    module_path,
                }
            };
            warn!(call_id, error = %e, "Step kind mismatch");
            send(Err(e.to_payload()));
            return;
        }

        let log: Arc<dyn StepLog> = Arc::new(ChannelLog::new(outbound.clone(), call_id));
        let ctx = build_context(
            broker.clone(),
            broker,
            &reference.module_id,
            &request.execution_meta,
            log,
        );
        let call = StepCall {
            call_id,
            input: request.input,
            catchable_error: reference
                .is_error_catching
                .then(|| reference.catchable_error.clone())
                .flatten(),
        };

        let (done, outcome) = Completion::new(call_id);
        let guard = done.clone();
        let step = resolved.step;
        debug!(call_id, module_path = %reference.module_path, "Running step");
        let handle = tokio::spawn(async move { step.run(call, ctx, done).await });

        // Report a panicking step instead of leaving the caller to time out.
        tokio::spawn(async move {
            if let Err(e) = handle.await
                && e.is_panic()
                && !guard.is_completed()
            {
                error!(call_id, "Step panicked");
                guard.fail(ErrorPayload::new(ErrorKind::Step, "step panicked"));
            }
        });

        match outcome.await {
            Ok(outcome) => {
                debug!(call_id, ok = outcome.is_ok(), "Step completed");
                send(outcome);
            }
            Err(_) => {
                warn!(call_id, "Step dropped its completion without finishing; no result sent");
            }
        }
    }
}
