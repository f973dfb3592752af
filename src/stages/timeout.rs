//! Deadlines for subscribe and unsubscribe.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::{
    error::PipelineError,
    pipeline::{OpId, OpKind, OpResult, Operation, Stage, StageContext, StageTimer, TimerId},
};

/// Fails subscribes and unsubscribes the broker never acknowledges.
///
/// The original operation stays here while a stand-in goes down; whichever
/// of the acknowledgement and the deadline comes first completes it. A late
/// acknowledgement is dropped.
#[derive(Debug, Default)]
pub(crate) struct OpTimeoutStage {
    pending: HashMap<OpId, (Operation, StageTimer)>,
}

fn stand_in(kind: &OpKind) -> Option<OpKind> {
    match kind {
        OpKind::Subscribe { topic } => Some(OpKind::Subscribe {
            topic: topic.clone(),
        }),
        OpKind::Unsubscribe { topic } => Some(OpKind::Unsubscribe {
            topic: topic.clone(),
        }),
        _ => None,
    }
}

impl Stage for OpTimeoutStage {
    fn name(&self) -> &'static str { "op_timeout" }

    fn run_op(&mut self, op: Operation, ctx: &mut StageContext<'_>) {
        let Some(kind) = stand_in(&op.kind) else {
            ctx.send_down(op);
            return;
        };
        let timer = ctx.start_timer(ctx.config().operation_timeout);
        ctx.send_down_intercepted(Operation::delegate(kind, op.id));
        self.pending.insert(op.id, (op, timer));
    }

    fn on_op_complete(&mut self, worker: Operation, result: OpResult, ctx: &mut StageContext<'_>) {
        let origin = worker.origin;
        ctx.complete(worker, result.clone());
        match origin.and_then(|id| self.pending.remove(&id)) {
            Some((op, _timer)) => ctx.complete(op, result),
            None => debug!("acknowledgement arrived after the deadline"),
        }
    }

    fn on_timer(&mut self, id: TimerId, ctx: &mut StageContext<'_>) {
        let expired = self
            .pending
            .iter()
            .find(|(_, (_, timer))| timer.is(id))
            .map(|(op_id, _)| *op_id);
        let Some((op, _)) = expired.and_then(|op_id| self.pending.remove(&op_id)) else {
            debug!(id, "ignoring stale deadline");
            return;
        };
        let timeout = ctx.config().operation_timeout;
        warn!(op = op.name(), id = %op.id, ?timeout, "operation timed out");
        let err = PipelineError::OperationTimeout(format!(
            "{} not acknowledged within {timeout:?}",
            op.name()
        ));
        ctx.complete(op, Err(err));
    }
}
