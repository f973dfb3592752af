//! Device registration and operation-status polling.

use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    config::Identity,
    error::PipelineError,
    models::RegistrationResult,
    pipeline::{
        OpId,
        OpKind,
        OpOutput,
        OpResult,
        Operation,
        RequestSpec,
        RequestType,
        Response,
        Stage,
        StageContext,
        StageTimer,
        TimerId,
    },
};

/// How a provisioning response moves an exchange forward.
#[derive(Debug)]
enum Verdict {
    Assigned(RegistrationResult),
    Failed(PipelineError),
    RetryAfter(Duration),
    Assigning { operation_id: String, retry_after: Duration },
}

fn interpret(response: &Response, polling_interval: Duration) -> Verdict {
    let body = || String::from_utf8_lossy(&response.body).into_owned();
    match response.status {
        300..429 => return Verdict::Failed(PipelineError::service(response.status, body())),
        429.. => return Verdict::RetryAfter(response.retry_after.unwrap_or(polling_interval)),
        _ => {}
    }
    let result: RegistrationResult = match serde_json::from_slice(&response.body) {
        Ok(result) => result,
        Err(err) => {
            return Verdict::Failed(PipelineError::Protocol(format!(
                "malformed registration response: {err}"
            )));
        }
    };
    match result.status.as_str() {
        "assigned" => Verdict::Assigned(result),
        "assigning" => Verdict::Assigning {
            operation_id: result.operation_id,
            retry_after: response.retry_after.unwrap_or(polling_interval),
        },
        "failed" => Verdict::Failed(PipelineError::Service {
            status: Some(response.status),
            message: format!("registration failed: {}", body()),
        }),
        other => Verdict::Failed(PipelineError::Service {
            status: Some(response.status),
            message: format!("unexpected registration status '{other}'"),
        }),
    }
}

fn timed_out() -> PipelineError {
    PipelineError::Service {
        status: None,
        message: "operation timed out before the provisioning service responded".into(),
    }
}

#[derive(Debug)]
struct Pending {
    op: Operation,
    spec: RequestSpec,
    timeout: StageTimer,
    retry: Option<StageTimer>,
}

/// Exchanges in flight, keyed by the operation that started them.
///
/// The operation stays here while a delegate request goes down, so the
/// overall timeout can complete it even if the request never returns. Late
/// request completions for a finished exchange are dropped.
#[derive(Debug, Default)]
struct Exchanges {
    pending: HashMap<OpId, Pending>,
}

impl Exchanges {
    fn begin(&mut self, op: Operation, spec: RequestSpec, ctx: &mut StageContext<'_>) {
        let timeout = ctx.start_timer(ctx.config().provisioning_timeout);
        send_request(spec.clone(), op.id, ctx);
        self.pending.insert(
            op.id,
            Pending {
                op,
                spec,
                timeout,
                retry: None,
            },
        );
    }

    fn finish(&mut self, origin: Option<OpId>, result: OpResult, ctx: &mut StageContext<'_>) {
        match origin.and_then(|id| self.pending.remove(&id)) {
            Some(pending) => ctx.complete(pending.op, result),
            None => debug!("dropping completion for a finished exchange"),
        }
    }

    fn retry_after(&mut self, origin: Option<OpId>, delay: Duration, ctx: &mut StageContext<'_>) {
        let Some(pending) = origin.and_then(|id| self.pending.get_mut(&id)) else {
            return;
        };
        debug!(delay_ms = delay.as_millis(), op = %pending.op.id, "provisioning request deferred");
        pending.retry = Some(ctx.start_timer(delay));
    }

    fn take(&mut self) -> Vec<Operation> { self.pending.drain().map(|(_, pending)| pending.op).collect() }

    /// Returns `false` when no exchange owns the timer.
    fn on_timer(&mut self, id: TimerId, ctx: &mut StageContext<'_>) -> bool {
        let expired = self
            .pending
            .iter()
            .find(|(_, pending)| pending.timeout.is(id))
            .map(|(op_id, _)| *op_id);
        if let Some(op_id) = expired {
            if let Some(pending) = self.pending.remove(&op_id) {
                warn!(op = %op_id, "provisioning exchange timed out");
                ctx.complete(pending.op, Err(timed_out()));
            }
            return true;
        }
        let due = self
            .pending
            .values_mut()
            .find(|pending| pending.retry.as_ref().is_some_and(|timer| timer.is(id)));
        let Some(pending) = due else {
            return false;
        };
        pending.retry = None;
        let (spec, origin) = (pending.spec.clone(), pending.op.id);
        send_request(spec, origin, ctx);
        true
    }
}

fn send_request(spec: RequestSpec, origin: OpId, ctx: &mut StageContext<'_>) {
    ctx.send_down_intercepted(Operation::delegate(OpKind::RequestAndResponse(spec), origin));
}

fn response_of(result: OpResult) -> Result<Response, PipelineError> {
    match result? {
        OpOutput::Response(response) => Ok(response),
        other => Err(PipelineError::Protocol(format!(
            "expected a provisioning response, got {other:?}"
        ))),
    }
}

/// Runs `Register`: sends the registration request, waits out throttling and
/// hands `assigning` registrations to the polling stage below.
#[derive(Debug, Default)]
pub(crate) struct RegistrationStage {
    exchanges: Exchanges,
}

impl Stage for RegistrationStage {
    fn name(&self) -> &'static str { "registration" }

    fn run_op(&mut self, op: Operation, ctx: &mut StageContext<'_>) {
        let OpKind::Register { payload } = &op.kind else {
            ctx.send_down(op);
            return;
        };
        let config = ctx.config();
        let Identity::Registration {
            registration_id, ..
        } = &config.identity
        else {
            ctx.complete(
                op,
                Err(PipelineError::Client("registration requires a registration identity".into())),
            );
            return;
        };
        let body = json!({ "registrationId": registration_id, "payload": payload });
        let spec = RequestSpec {
            request_type: RequestType::Register,
            method: "PUT",
            resource_location: "/",
            body: Bytes::from(body.to_string()),
        };
        info!(%registration_id, "registering");
        self.exchanges.begin(op, spec, ctx);
    }

    fn on_op_complete(&mut self, worker: Operation, result: OpResult, ctx: &mut StageContext<'_>) {
        let origin = worker.origin;
        let polled = matches!(worker.kind, OpKind::PollStatus { .. });
        ctx.complete(worker, result.clone());
        if polled {
            self.exchanges.finish(origin, result, ctx);
            return;
        }
        let response = match response_of(result) {
            Ok(response) => response,
            Err(err) => {
                self.exchanges.finish(origin, Err(err), ctx);
                return;
            }
        };
        match interpret(&response, ctx.config().polling_interval) {
            Verdict::Assigned(result) => {
                self.exchanges
                    .finish(origin, Ok(OpOutput::Registration(result)), ctx);
            }
            Verdict::Failed(err) => self.exchanges.finish(origin, Err(err), ctx),
            Verdict::RetryAfter(delay) => self.exchanges.retry_after(origin, delay, ctx),
            Verdict::Assigning { operation_id, .. } => {
                let Some(origin) = origin else {
                    return;
                };
                debug!(%operation_id, "registration assigning; polling status");
                ctx.send_down_intercepted(Operation::delegate(
                    OpKind::PollStatus { operation_id },
                    origin,
                ));
            }
        }
    }

    fn take_pending(&mut self) -> Vec<Operation> { self.exchanges.take() }

    fn on_timer(&mut self, id: TimerId, ctx: &mut StageContext<'_>) {
        if !self.exchanges.on_timer(id, ctx) {
            debug!(id, "ignoring stale registration timer");
        }
    }
}

/// Runs `PollStatus`: queries the operation status until the registration
/// settles, waiting `retry-after` between queries.
#[derive(Debug, Default)]
pub(crate) struct PollingStatusStage {
    exchanges: Exchanges,
}

impl Stage for PollingStatusStage {
    fn name(&self) -> &'static str { "polling_status" }

    fn run_op(&mut self, op: Operation, ctx: &mut StageContext<'_>) {
        let OpKind::PollStatus { operation_id } = &op.kind else {
            ctx.send_down(op);
            return;
        };
        let spec = RequestSpec {
            request_type: RequestType::Query {
                operation_id: operation_id.clone(),
            },
            method: "GET",
            resource_location: "/",
            body: Bytes::from_static(b" "),
        };
        self.exchanges.begin(op, spec, ctx);
    }

    fn on_op_complete(&mut self, worker: Operation, result: OpResult, ctx: &mut StageContext<'_>) {
        let origin = worker.origin;
        ctx.complete(worker, result.clone());
        let response = match response_of(result) {
            Ok(response) => response,
            Err(err) => {
                self.exchanges.finish(origin, Err(err), ctx);
                return;
            }
        };
        match interpret(&response, ctx.config().polling_interval) {
            Verdict::Assigned(result) => {
                self.exchanges
                    .finish(origin, Ok(OpOutput::Registration(result)), ctx);
            }
            Verdict::Failed(err) => self.exchanges.finish(origin, Err(err), ctx),
            Verdict::RetryAfter(delay) | Verdict::Assigning { retry_after: delay, .. } => {
                self.exchanges.retry_after(origin, delay, ctx);
            }
        }
    }

    fn take_pending(&mut self) -> Vec<Operation> { self.exchanges.take() }

    fn on_timer(&mut self, id: TimerId, ctx: &mut StageContext<'_>) {
        if !self.exchanges.on_timer(id, ctx) {
            debug!(id, "ignoring stale polling timer");
        }
    }
}
