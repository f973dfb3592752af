//! The [`Stage`] trait and the context handed to each stage callback.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use tracing::{error, warn};

use super::{
    Dispatcher,
    event::{ClientEvent, Event, Inbound},
    operation::{OpResult, Operation},
    state::Nucleus,
};
use crate::{
    config::PipelineConfig,
    error::PipelineError,
    timer::Timer,
    transport::{TransportEvent, TransportEventSink},
};

/// Identifies one timer started by a stage.
pub(crate) type TimerId = u64;

/// Posts a timer expiry to the pipeline context.
pub(crate) type TimerTrigger = Box<dyn FnOnce() + Send + 'static>;

/// Unit of work on the pipeline context's queue.
pub(crate) enum Action {
    RunOp { stage: usize, op: Operation },
    Event { stage: usize, event: Event },
    Complete { op: Operation, result: OpResult },
    Timer { stage: usize, id: TimerId },
    Transport(TransportEvent),
}

/// One link of the pipeline.
///
/// Operations enter at the top and flow down through `run_op`; events enter
/// at the bottom and flow up through `handle_event`. Every callback runs on
/// the pipeline context, one at a time, so stages hold plain mutable state.
/// The defaults pass everything through untouched.
pub(crate) trait Stage: Send {
    fn name(&self) -> &'static str;

    fn run_op(&mut self, op: Operation, ctx: &mut StageContext<'_>) { ctx.send_down(op); }

    fn handle_event(&mut self, event: Event, ctx: &mut StageContext<'_>) { ctx.send_up(event); }

    /// Called for operations this stage sent down with
    /// [`StageContext::send_down_intercepted`].
    fn on_op_complete(&mut self, op: Operation, result: OpResult, ctx: &mut StageContext<'_>) {
        ctx.complete(op, result);
    }

    /// Operations the stage is holding, handed over when the pipeline stops.
    fn take_pending(&mut self) -> Vec<Operation> { Vec::new() }

    fn on_timer(&mut self, id: TimerId, _ctx: &mut StageContext<'_>) {
        warn!(stage = self.name(), id, "timer fired for a stage that starts none");
    }

    /// Only the bottom stage receives transport events.
    fn on_transport_event(&mut self, event: TransportEvent, _ctx: &mut StageContext<'_>) {
        error!(stage = self.name(), event = event.name(), "transport event reached a non-transport stage");
    }
}

/// A timer owned by a stage. Dropping it cancels the timer.
#[derive(Debug)]
pub(crate) struct StageTimer {
    id: TimerId,
    _timer: Timer,
}

impl StageTimer {
    pub(crate) fn is(&self, id: TimerId) -> bool { self.id == id }
}

/// A stage's view of the pipeline for the duration of one callback.
pub(crate) struct StageContext<'a> {
    index: usize,
    stage: &'static str,
    queue: &'a mut VecDeque<Action>,
    nucleus: &'a mut Nucleus,
    dispatcher: &'a Dispatcher,
}

impl<'a> StageContext<'a> {
    pub(crate) fn new(
        index: usize,
        stage: &'static str,
        queue: &'a mut VecDeque<Action>,
        nucleus: &'a mut Nucleus,
        dispatcher: &'a Dispatcher,
    ) -> Self {
        Self {
            index,
            stage,
            queue,
            nucleus,
            dispatcher,
        }
    }

    pub(crate) fn nucleus(&self) -> &Nucleus { self.nucleus }

    pub(crate) fn nucleus_mut(&mut self) -> &mut Nucleus { self.nucleus }

    pub(crate) fn config(&self) -> Arc<PipelineConfig> { Arc::clone(&self.nucleus.config) }

    pub(crate) fn connected(&self) -> bool { self.nucleus.connected }

    pub(crate) fn desired_connection(&self) -> bool { self.nucleus.desired_connection }

    /// Pass `op` to the next stage down.
    pub(crate) fn send_down(&mut self, op: Operation) {
        self.queue.push_back(Action::RunOp {
            stage: self.index + 1,
            op,
        });
    }

    /// Pass `op` down and have its result routed back to this stage's
    /// `on_op_complete`.
    pub(crate) fn send_down_intercepted(&mut self, mut op: Operation) {
        op.push_interceptor(self.index);
        self.send_down(op);
    }

    /// Run `op` through this stage again.
    pub(crate) fn rerun(&mut self, op: Operation) {
        self.queue.push_back(Action::RunOp {
            stage: self.index,
            op,
        });
    }

    /// Pass `event` to the next stage up.
    pub(crate) fn send_up(&mut self, event: Event) {
        if self.index == 0 {
            warn!(event = event.name(), "event reached the top of the pipeline unhandled");
            return;
        }
        self.queue.push_back(Action::Event {
            stage: self.index - 1,
            event,
        });
    }

    /// Finish `op` with `result`, unwinding through any remaining
    /// interceptors above this stage.
    pub(crate) fn complete(&mut self, op: Operation, result: OpResult) {
        self.queue.push_back(Action::Complete { op, result });
    }

    /// Start a timer whose expiry calls this stage's `on_timer`.
    pub(crate) fn start_timer(&mut self, delay: Duration) -> StageTimer {
        let (id, fire) = self.timer_trigger();
        StageTimer {
            id,
            _timer: Timer::start(delay, fire),
        }
    }

    /// A callback that, when invoked, posts a timer expiry for this stage.
    /// Used by components that own their own [`Timer`].
    pub(crate) fn timer_trigger(&mut self) -> (TimerId, TimerTrigger) {
        let id = self.nucleus.next_timer_id();
        let stage = self.index;
        let dispatcher = self.dispatcher.clone();
        (id, Box::new(move || dispatcher.timer_fired(stage, id)))
    }

    /// Sink a transport built from this context reports through.
    pub(crate) fn transport_sink(&self) -> TransportEventSink { TransportEventSink::new(self.dispatcher.clone()) }

    /// Report a failure no caller is waiting on.
    pub(crate) fn background_error(&mut self, err: PipelineError) {
        error!(stage = self.stage, error = %err, "background error");
        crate::metrics::inc_background_errors();
        self.nucleus
            .deliver(Inbound::Client(ClientEvent::BackgroundError(err)));
    }
}
