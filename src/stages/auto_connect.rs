//! On-demand connection for operations that need one.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, info};

use crate::{
    error::PipelineError,
    pipeline::{ConnectionState, Event, OpId, OpKind, OpResult, Operation, Stage, StageContext},
};

/// Makes sure operations needing a connection have one.
///
/// While disconnected such an operation either triggers a connect first
/// (when auto-connect is on), waits for a connection already being
/// re-established, or fails at once with [`PipelineError::NoConnection`].
#[derive(Debug)]
pub(crate) struct AutoConnectStage {
    enabled: bool,
    awaiting_connect: HashMap<OpId, Operation>,
    blocked: VecDeque<Operation>,
}

impl AutoConnectStage {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            awaiting_connect: HashMap::new(),
            blocked: VecDeque::new(),
        }
    }

    fn fail_blocked(&mut self, ctx: &mut StageContext<'_>) {
        for op in self.blocked.drain(..) {
            ctx.complete(
                op,
                Err(PipelineError::NoConnection("connection was not re-established".into())),
            );
        }
    }
}

impl Stage for AutoConnectStage {
    fn name(&self) -> &'static str { "auto_connect" }

    fn run_op(&mut self, op: Operation, ctx: &mut StageContext<'_>) {
        if !op.needs_connection() || ctx.connected() {
            ctx.send_down(op);
            return;
        }
        if self.enabled {
            debug!(op = op.name(), "connecting on demand");
            ctx.send_down_intercepted(Operation::delegate(OpKind::Connect, op.id));
            self.awaiting_connect.insert(op.id, op);
        } else if ctx.desired_connection() {
            debug!(op = op.name(), "waiting for the connection to be re-established");
            self.blocked.push_back(op);
        } else {
            let err = PipelineError::NoConnection(format!(
                "{} needs a connection and auto-connect is disabled",
                op.name()
            ));
            ctx.complete(op, Err(err));
        }
    }

    fn on_op_complete(&mut self, worker: Operation, result: OpResult, ctx: &mut StageContext<'_>) {
        let origin = worker.origin;
        ctx.complete(worker, result.clone());
        let Some(op) = origin.and_then(|id| self.awaiting_connect.remove(&id)) else {
            return;
        };
        match result {
            Ok(_) => ctx.send_down(op),
            Err(err) => ctx.complete(op, Err(err)),
        }
    }

    fn take_pending(&mut self) -> Vec<Operation> {
        let mut held: Vec<_> = self.awaiting_connect.drain().map(|(_, op)| op).collect();
        held.extend(self.blocked.drain(..));
        held
    }

    fn handle_event(&mut self, event: Event, ctx: &mut StageContext<'_>) {
        match &event {
            Event::Connected if !self.blocked.is_empty() => {
                info!(count = self.blocked.len(), "releasing operations held for the connection");
                for op in self.blocked.drain(..) {
                    ctx.send_down(op);
                }
            }
            Event::StateChanged(ConnectionState::Disconnected) => self.fail_blocked(ctx),
            _ => {}
        }
        ctx.send_up(event);
    }
}
