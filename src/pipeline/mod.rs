//! The pipeline: an ordered chain of stages driven by one context.
//!
//! Application calls become [`Operation`]s submitted at the top of the chain.
//! Transport activity enters at the bottom as events. Both are posted to a
//! [`PipelineContext`] that owns every stage and processes one command at a
//! time, so stage state never needs a lock. The same context backs both the
//! blocking and the async client; only the thread it runs on differs.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::error;

mod context;
mod event;
mod operation;
mod stage;
mod state;

pub(crate) use context::PipelineContext;
pub use event::{ClientEvent, EventSink, Inbound};
pub(crate) use event::Event;
pub use operation::Feature;
pub(crate) use operation::{
    OpId,
    OpKind,
    OpOutput,
    OpResult,
    Operation,
    RequestSpec,
    RequestType,
    Response,
};
pub(crate) use stage::{Stage, StageContext, StageTimer, TimerId};
pub use state::ConnectionState;
pub(crate) use state::Nucleus;

use crate::{
    config::PipelineConfig,
    error::PipelineError,
    stages,
    transport::{TransportEvent, TransportFactory},
};

/// Message posted to the pipeline context.
pub(crate) enum Command {
    Submit(Operation),
    Transport(TransportEvent),
    Timer { stage: usize, id: TimerId },
    Shutdown,
}

/// Posts commands to a pipeline context from any thread.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    tx: mpsc::UnboundedSender<Command>,
}

impl Dispatcher {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Submit `op`. If the pipeline has stopped the operation is completed
    /// with [`PipelineError::OperationCancelled`] instead.
    pub(crate) fn submit(&self, op: Operation) {
        if let Err(mpsc::error::SendError(command)) = self.tx.send(Command::Submit(op)) {
            if let Command::Submit(mut op) = command {
                let _ = op.fire(Err(PipelineError::OperationCancelled(
                    "pipeline has shut down".into(),
                )));
            }
        }
    }

    pub(crate) fn transport_event(&self, event: TransportEvent) -> bool {
        self.tx.send(Command::Transport(event)).is_ok()
    }

    pub(crate) fn timer_fired(&self, stage: usize, id: TimerId) {
        if self.tx.send(Command::Timer { stage, id }).is_err() {
            error!(stage, id, "timer fired after pipeline teardown");
            crate::metrics::inc_leaked_timers();
        }
    }

    pub(crate) fn shutdown(&self) { let _ = self.tx.send(Command::Shutdown); }
}

/// Which service a pipeline speaks to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PipelineKind {
    IoTHub,
    Provisioning,
}

/// Build the stage chain for `kind` and a handle to drive it.
///
/// The returned context does nothing until it is run; the caller chooses the
/// runtime it runs on.
pub(crate) fn assemble(
    kind: PipelineKind,
    config: Arc<PipelineConfig>,
    factory: Arc<dyn TransportFactory>,
    sink: Arc<dyn EventSink>,
) -> (PipelineHandle, PipelineContext) {
    let stages = match kind {
        PipelineKind::IoTHub => stages::iothub(&config, factory),
        PipelineKind::Provisioning => stages::provisioning(&config, factory),
    };
    let nucleus = Nucleus::new(config, sink);
    let state = nucleus.subscribe_state();
    let (dispatcher, commands) = Dispatcher::channel();
    let context = PipelineContext::new(stages, nucleus, dispatcher.clone(), commands);
    (PipelineHandle { dispatcher, state }, context)
}

/// Cloneable front door to a running pipeline.
#[derive(Clone)]
pub(crate) struct PipelineHandle {
    dispatcher: Dispatcher,
    state: watch::Receiver<ConnectionState>,
}

impl PipelineHandle {
    /// Submit `kind` and wait for its result.
    pub(crate) async fn run(&self, kind: OpKind) -> OpResult {
        let (op, rx) = Operation::with_caller(kind);
        self.dispatcher.submit(op);
        rx.await.unwrap_or_else(|_| Err(dropped()))
    }

    /// Submit `kind`, handing its result to `callback` on the pipeline
    /// context.
    pub(crate) fn run_with_callback(&self, kind: OpKind, callback: impl FnOnce(OpResult) + Send + 'static) {
        self.dispatcher.submit(Operation::with_callback(kind, callback));
    }

    pub(crate) fn state(&self) -> ConnectionState { *self.state.borrow() }

    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectionState> { self.state.clone() }

    pub(crate) fn shutdown(&self) { self.dispatcher.shutdown(); }
}

fn dropped() -> PipelineError { PipelineError::OperationCancelled("pipeline dropped the operation".into()) }
