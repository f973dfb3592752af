//! Re-issues broker operations that fail transiently.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::{
    error::PipelineError,
    metrics,
    pipeline::{Event, OpId, OpKind, OpOutput, OpResult, Operation, Stage, StageContext, StageTimer, TimerId},
};

const DROPPED: &str = "connection dropped and connection retry is disabled";

#[derive(Debug)]
struct Retrying {
    op: Operation,
    timer: Option<StageTimer>,
}

/// Retries publishes, subscribes and unsubscribes with backoff.
///
/// A stand-in goes down for each attempt while the original waits here. A
/// transient failure schedules another attempt after the policy's jittered
/// delay, until the policy's failure timeout has passed since the first
/// attempt or the application no longer wants a connection. Anything else
/// completes the original. When the connection drops and connection retry is
/// off, nothing will bring it back, so every waiting operation is cancelled.
#[derive(Debug, Default)]
pub(crate) struct RetryStage {
    pending: HashMap<OpId, Retrying>,
}

fn stand_in(kind: &OpKind) -> Option<OpKind> {
    match kind {
        OpKind::Publish { topic, payload } => Some(OpKind::Publish {
            topic: topic.clone(),
            payload: payload.clone(),
        }),
        OpKind::Subscribe { topic } => Some(OpKind::Subscribe {
            topic: topic.clone(),
        }),
        OpKind::Unsubscribe { topic } => Some(OpKind::Unsubscribe {
            topic: topic.clone(),
        }),
        _ => None,
    }
}

impl RetryStage {
    fn attempt(op: &Operation, ctx: &mut StageContext<'_>) {
        if let Some(kind) = stand_in(&op.kind) {
            ctx.send_down_intercepted(Operation::delegate(kind, op.id));
        }
    }

    fn should_retry(op: &mut Operation, err: &PipelineError, ctx: &StageContext<'_>) -> bool {
        err.is_transient()
            && ctx.desired_connection()
            && ctx.config().backoff.within_budget(op.elapsed_since_first_attempt())
    }

    fn cancel_all(&mut self, reason: &str, ctx: &mut StageContext<'_>) {
        let mut pending: Vec<_> = self.pending.drain().map(|(_, retrying)| retrying.op).collect();
        pending.sort_by_key(|op| op.id);
        for op in pending {
            ctx.complete(op, Err(PipelineError::OperationCancelled(reason.to_owned())));
        }
    }
}

impl Stage for RetryStage {
    fn name(&self) -> &'static str { "retry" }

    fn run_op(&mut self, mut op: Operation, ctx: &mut StageContext<'_>) {
        if matches!(op.kind, OpKind::Disconnect) {
            self.cancel_all("disconnect requested", ctx);
            ctx.send_down(op);
            return;
        }
        if stand_in(&op.kind).is_none() {
            ctx.send_down(op);
            return;
        }
        op.elapsed_since_first_attempt();
        Self::attempt(&op, ctx);
        self.pending.insert(op.id, Retrying { op, timer: None });
    }

    fn on_op_complete(&mut self, worker: Operation, result: OpResult, ctx: &mut StageContext<'_>) {
        let origin = worker.origin;
        ctx.complete(worker, Ok(OpOutput::Done));
        let Some(id) = origin else {
            return;
        };
        let Some(mut retrying) = self.pending.remove(&id) else {
            debug!(op = %id, "dropping result for an abandoned operation");
            return;
        };
        let err = match result {
            Ok(output) => {
                ctx.complete(retrying.op, Ok(output));
                return;
            }
            Err(PipelineError::ConnectionDropped(_)) if !ctx.config().connection_retry => {
                ctx.complete(retrying.op, Err(PipelineError::OperationCancelled(DROPPED.into())));
                return;
            }
            Err(err) => err,
        };
        if !Self::should_retry(&mut retrying.op, &err, ctx) {
            ctx.complete(retrying.op, Err(err));
            return;
        }
        let delay = ctx.config().backoff.jittered_delay(retrying.op.attempts);
        retrying.op.attempts += 1;
        metrics::inc_retries();
        info!(
            op = retrying.op.name(),
            id = %id,
            attempt = retrying.op.attempts,
            delay_ms = delay.as_millis(),
            error = %err,
            "retrying after transient failure"
        );
        retrying.timer = Some(ctx.start_timer(delay));
        self.pending.insert(id, retrying);
    }

    fn handle_event(&mut self, event: Event, ctx: &mut StageContext<'_>) {
        if matches!(event, Event::Disconnected) && !ctx.config().connection_retry && !self.pending.is_empty() {
            debug!(count = self.pending.len(), "cancelling operations awaiting a retry");
            self.cancel_all(DROPPED, ctx);
        }
        ctx.send_up(event);
    }

    fn take_pending(&mut self) -> Vec<Operation> {
        self.pending.drain().map(|(_, retrying)| retrying.op).collect()
    }

    fn on_timer(&mut self, id: TimerId, ctx: &mut StageContext<'_>) {
        let due = self
            .pending
            .values_mut()
            .find(|retrying| retrying.timer.as_ref().is_some_and(|timer| timer.is(id)));
        let Some(retrying) = due else {
            debug!(id, "ignoring stale retry timer");
            return;
        };
        retrying.timer = None;
        Self::attempt(&retrying.op, ctx);
    }
}
