//! The single-writer context that runs every stage callback.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use super::{
    Command,
    Dispatcher,
    event::{ClientEvent, Inbound},
    operation::{OpOutput, OpResult, Operation},
    stage::{Action, Stage, StageContext},
    state::Nucleus,
};
use crate::{
    error::PipelineError,
    metrics::{self, Outcome},
};

/// Owns the stages and drives them from a command channel.
///
/// Every stage callback runs here, so no stage needs its own locking.
/// Callbacks never call each other directly; they queue [`Action`]s which are
/// drained to completion before the next command is taken.
pub(crate) struct PipelineContext {
    stages: Vec<Box<dyn Stage>>,
    nucleus: Nucleus,
    queue: VecDeque<Action>,
    dispatcher: Dispatcher,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl PipelineContext {
    pub(crate) fn new(
        stages: Vec<Box<dyn Stage>>,
        nucleus: Nucleus,
        dispatcher: Dispatcher,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        Self {
            stages,
            nucleus,
            queue: VecDeque::new(),
            dispatcher,
            commands,
        }
    }

    /// Process commands until shutdown or until every sender is gone.
    pub(crate) async fn run(mut self) {
        info!(stages = self.stages.len(), "pipeline context started");
        while let Some(command) = self.commands.recv().await {
            if !self.handle(command) {
                break;
            }
        }
        self.stop();
    }

    /// Apply one command and drain the resulting work. Returns `false` on
    /// shutdown.
    pub(crate) fn handle(&mut self, command: Command) -> bool {
        let action = match command {
            Command::Submit(op) => Action::RunOp { stage: 0, op },
            Command::Transport(event) => Action::Transport(event),
            Command::Timer { stage, id } => Action::Timer { stage, id },
            Command::Shutdown => return false,
        };
        self.queue.push_back(action);
        self.drain();
        true
    }

    /// Handle every command already waiting, without blocking.
    #[cfg(test)]
    pub(crate) fn pump(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            if !self.handle(command) {
                break;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn nucleus(&self) -> &Nucleus { &self.nucleus }

    fn drain(&mut self) {
        while let Some(action) = self.queue.pop_front() {
            self.dispatch(action);
        }
    }

    fn dispatch(&mut self, action: Action) {
        match action {
            Action::RunOp { stage, op } => self.run_op(stage, op),
            Action::Event { stage, event } => {
                let Some(target) = self.stages.get_mut(stage) else {
                    warn!(stage, event = event.name(), "event addressed past the pipeline");
                    return;
                };
                trace!(stage = target.name(), event = event.name(), "handle_event");
                let mut ctx = StageContext::new(
                    stage,
                    target.name(),
                    &mut self.queue,
                    &mut self.nucleus,
                    &self.dispatcher,
                );
                target.handle_event(event, &mut ctx);
            }
            Action::Complete { op, result } => self.complete(op, result),
            Action::Timer { stage, id } => {
                let Some(target) = self.stages.get_mut(stage) else {
                    warn!(stage, id, "timer addressed past the pipeline");
                    return;
                };
                trace!(stage = target.name(), id, "on_timer");
                let mut ctx = StageContext::new(
                    stage,
                    target.name(),
                    &mut self.queue,
                    &mut self.nucleus,
                    &self.dispatcher,
                );
                target.on_timer(id, &mut ctx);
            }
            Action::Transport(event) => {
                let Some(index) = self.stages.len().checked_sub(1) else {
                    return;
                };
                let target = &mut self.stages[index];
                trace!(stage = target.name(), event = event.name(), "on_transport_event");
                let mut ctx = StageContext::new(
                    index,
                    target.name(),
                    &mut self.queue,
                    &mut self.nucleus,
                    &self.dispatcher,
                );
                target.on_transport_event(event, &mut ctx);
            }
        }
    }

    fn run_op(&mut self, stage: usize, op: Operation) {
        if stage >= self.stages.len() {
            let last = self.stages.last().map_or("pipeline", |last| last.name());
            let err = PipelineError::Unhandled {
                op: op.name(),
                stage: last,
            };
            error!(op = op.name(), stage = last, "operation fell off the bottom of the pipeline");
            self.queue.push_back(Action::Complete {
                op,
                result: Err(err),
            });
            return;
        }
        let target = &mut self.stages[stage];
        trace!(stage = target.name(), op = op.name(), id = %op.id, "run_op");
        let mut ctx = StageContext::new(
            stage,
            target.name(),
            &mut self.queue,
            &mut self.nucleus,
            &self.dispatcher,
        );
        target.run_op(op, &mut ctx);
    }

    fn complete(&mut self, mut op: Operation, result: OpResult) {
        if op.is_completed() {
            error!(op = op.name(), id = %op.id, "operation completed more than once");
            return;
        }
        if let Some(stage) = op.pop_interceptor() {
            if let Some(target) = self.stages.get_mut(stage) {
                trace!(stage = target.name(), op = op.name(), "on_op_complete");
                let mut ctx = StageContext::new(
                    stage,
                    target.name(),
                    &mut self.queue,
                    &mut self.nucleus,
                    &self.dispatcher,
                );
                target.on_op_complete(op, result, &mut ctx);
                return;
            }
        }
        if let Some(parent) = op.take_parent() {
            // Worker completions are internal; the parent carries the result.
            let _ = op.fire(Ok(OpOutput::Done));
            self.queue.push_back(Action::Complete {
                op: parent,
                result,
            });
            return;
        }
        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(err) if err.is_transient() => Outcome::Transient,
            Err(_) => Outcome::Fatal,
        };
        match &result {
            Ok(_) => debug!(op = op.name(), id = %op.id, "operation succeeded"),
            Err(err) => debug!(op = op.name(), id = %op.id, error = %err, "operation failed"),
        }
        match op.fire(result) {
            Ok(true) => metrics::inc_completed(outcome),
            Ok(false) => error!(op = op.name(), id = %op.id, "operation completed more than once"),
            Err(err) => {
                error!(op = op.name(), error = %err, "completion callback panicked");
                metrics::inc_background_errors();
                self.nucleus
                    .deliver(Inbound::Client(ClientEvent::BackgroundError(err)));
            }
        }
    }

    fn stop(&mut self) {
        const REASON: &str = "pipeline shut down";
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Submit(op) = command {
                op.cancel(REASON);
            }
        }
        for action in self.queue.drain(..) {
            if let Action::RunOp { op, .. } | Action::Complete { op, .. } = action {
                op.cancel(REASON);
            }
        }
        let held: Vec<_> = self.stages.iter_mut().flat_map(|stage| stage.take_pending()).collect();
        if !held.is_empty() {
            debug!(count = held.len(), "cancelling operations held by stages");
        }
        for op in held {
            op.cancel(REASON);
        }
        self.stages.clear();
        info!("pipeline context stopped");
    }
}
