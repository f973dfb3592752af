//! Serialization of connect, disconnect and reauthorize.

use std::collections::VecDeque;

use tracing::debug;

use crate::pipeline::{OpKind, OpOutput, OpResult, Operation, Stage, StageContext};

/// Lets one connection operation through at a time.
///
/// Connection operations arriving while one is in flight wait here and are
/// replayed in order once it completes. A connect while connected, or a
/// disconnect while disconnected, completes at once.
#[derive(Debug, Default)]
pub(crate) struct ConnectionLockStage {
    busy: bool,
    waiting: VecDeque<Operation>,
}

impl Stage for ConnectionLockStage {
    fn name(&self) -> &'static str { "connection_lock" }

    fn run_op(&mut self, op: Operation, ctx: &mut StageContext<'_>) {
        if !op.kind.is_connection_op() {
            ctx.send_down(op);
            return;
        }
        if self.busy {
            debug!(op = op.name(), queued = self.waiting.len() + 1, "connection operation queued");
            self.waiting.push_back(op);
            return;
        }
        let redundant = match op.kind {
            OpKind::Connect => ctx.connected(),
            OpKind::Disconnect => !ctx.connected(),
            _ => false,
        };
        if redundant {
            debug!(op = op.name(), "already in the requested state");
            ctx.complete(op, Ok(OpOutput::Done));
            return;
        }
        self.busy = true;
        ctx.send_down_intercepted(op);
    }

    fn take_pending(&mut self) -> Vec<Operation> { self.waiting.drain(..).collect() }

    fn on_op_complete(&mut self, op: Operation, result: OpResult, ctx: &mut StageContext<'_>) {
        ctx.complete(op, result);
        self.busy = false;
        for next in self.waiting.drain(..) {
            ctx.rerun(next);
        }
    }
}
