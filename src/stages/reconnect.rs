//! The connection state machine and automatic reconnection.

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    error::PipelineError,
    metrics,
    pipeline::{
        ConnectionState,
        Event,
        OpId,
        OpKind,
        OpOutput,
        OpResult,
        Operation,
        Stage,
        StageContext,
        StageTimer,
        TimerId,
    },
};

/// Reconciles the desired connection with the actual one.
///
/// Connect operations never go down themselves. They wait here while the
/// stage sends its own connect attempt, and every waiting connect completes
/// with the outcome of that attempt. When the transport drops a wanted
/// connection and connection retry is enabled, a reconnect is scheduled with
/// the reconnect backoff policy; connects arriving meanwhile join the wait.
///
/// A failed attempt keeps the connection wanted only when the pipeline has
/// connected before, the error is transient and connection retry is on.
/// Otherwise the desired connection is dropped and the waiting connects
/// fail. Every transition is published as a state change.
#[derive(Debug, Default)]
pub(crate) struct ReconnectStage {
    timer: Option<StageTimer>,
    attempts: u32,
    dropped_at: Option<Instant>,
    attempt: Option<Attempt>,
    waiting: Vec<Operation>,
    connected_once: bool,
}

#[derive(Debug, Clone, Copy)]
struct Attempt {
    id: OpId,
    automatic: bool,
}

impl ReconnectStage {
    fn transition(state: ConnectionState, ctx: &mut StageContext<'_>) {
        let from = ctx.nucleus().state();
        if from != state {
            debug!(%from, to = %state, "connection state change");
        }
        ctx.nucleus_mut().publish_state(state);
        ctx.send_up(Event::StateChanged(state));
    }

    fn reconnect_pending(&self) -> bool { self.timer.is_some() || self.attempt.is_some() }

    fn reset(&mut self) {
        self.timer = None;
        self.attempts = 0;
        self.dropped_at = None;
    }

    fn release_waiting(&mut self, result: &OpResult, ctx: &mut StageContext<'_>) {
        if !self.waiting.is_empty() {
            debug!(count = self.waiting.len(), ok = result.is_ok(), "releasing waiting connects");
        }
        for op in self.waiting.drain(..) {
            ctx.complete(op, result.clone());
        }
    }

    fn send_attempt(&mut self, automatic: bool, ctx: &mut StageContext<'_>) {
        if !ctx.connected() {
            Self::transition(ConnectionState::Connecting, ctx);
        }
        let op = Operation::internal(OpKind::Connect);
        self.attempt = Some(Attempt {
            id: op.id,
            automatic,
        });
        ctx.send_down_intercepted(op);
    }

    fn schedule_reconnect(&mut self, ctx: &mut StageContext<'_>) {
        let policy = ctx.config().reconnect_policy();
        let delay = policy.jittered_delay(self.attempts);
        self.attempts += 1;
        let since = self.dropped_at.get_or_insert_with(Instant::now).elapsed();
        info!(
            attempt = self.attempts,
            delay_ms = delay.as_millis(),
            disconnected_for_ms = since.as_millis(),
            "reconnect scheduled"
        );
        self.timer = Some(ctx.start_timer(delay));
        Self::transition(ConnectionState::ReconnectPending, ctx);
    }

    fn abandon(&mut self, err: PipelineError, automatic: bool, ctx: &mut StageContext<'_>) {
        if automatic {
            warn!(error = %err, attempts = self.attempts, "abandoning reconnection");
        } else {
            debug!(error = %err, "connect failed");
        }
        self.reset();
        ctx.nucleus_mut().desired_connection = false;
        Self::transition(ConnectionState::Disconnected, ctx);
        self.release_waiting(&Err(err.clone()), ctx);
        if automatic {
            ctx.background_error(err);
        }
    }

    fn on_attempt_failed(&mut self, err: PipelineError, automatic: bool, ctx: &mut StageContext<'_>) {
        if !ctx.desired_connection() {
            debug!(error = %err, "connect failed after disconnect was requested");
            self.release_waiting(&Err(err), ctx);
            return;
        }
        let retry = self.connected_once && err.is_transient() && ctx.config().connection_retry;
        if retry {
            warn!(error = %err, "connect attempt failed");
            self.schedule_reconnect(ctx);
        } else {
            self.abandon(err, automatic, ctx);
        }
    }
}

impl Stage for ReconnectStage {
    fn name(&self) -> &'static str { "reconnect" }

    fn run_op(&mut self, op: Operation, ctx: &mut StageContext<'_>) {
        match op.kind {
            OpKind::Connect => {
                ctx.nucleus_mut().desired_connection = true;
                let pending = self.reconnect_pending();
                self.waiting.push(op);
                if pending {
                    debug!(waiting = self.waiting.len(), "connect joins the pending attempt");
                } else {
                    self.send_attempt(false, ctx);
                }
            }
            OpKind::Disconnect => {
                ctx.nucleus_mut().desired_connection = false;
                if self.timer.is_some() {
                    self.release_waiting(
                        &Err(PipelineError::OperationCancelled("disconnect requested".into())),
                        ctx,
                    );
                }
                self.reset();
                if ctx.connected() {
                    Self::transition(ConnectionState::Disconnecting, ctx);
                } else {
                    Self::transition(ConnectionState::Disconnected, ctx);
                }
                ctx.send_down_intercepted(op);
            }
            _ => ctx.send_down(op),
        }
    }

    fn on_op_complete(&mut self, op: Operation, result: OpResult, ctx: &mut StageContext<'_>) {
        match op.kind {
            OpKind::Connect => {
                let attempt = self.attempt.filter(|attempt| attempt.id == op.id);
                ctx.complete(op, result.clone());
                let Some(attempt) = attempt else {
                    debug!("ignoring a superseded connect attempt");
                    return;
                };
                self.attempt = None;
                match result {
                    Ok(output) => {
                        if ctx.connected() {
                            self.connected_once = true;
                            Self::transition(ConnectionState::Connected, ctx);
                        }
                        self.release_waiting(&Ok(output), ctx);
                    }
                    Err(err) => self.on_attempt_failed(err, attempt.automatic, ctx),
                }
            }
            OpKind::Disconnect => {
                Self::transition(ConnectionState::Disconnected, ctx);
                ctx.complete(op, result);
            }
            _ => ctx.complete(op, result),
        }
    }

    fn handle_event(&mut self, event: Event, ctx: &mut StageContext<'_>) {
        match event {
            Event::Connected => {
                if self.attempts > 0 {
                    info!(attempts = self.attempts, "reconnected");
                }
                self.reset();
                self.connected_once = true;
                Self::transition(ConnectionState::Connected, ctx);
                self.release_waiting(&Ok(OpOutput::Done), ctx);
                ctx.send_up(Event::Connected);
            }
            Event::Disconnected => {
                let config = ctx.config();
                if ctx.desired_connection() && config.connection_retry {
                    self.schedule_reconnect(ctx);
                } else {
                    if ctx.desired_connection() {
                        info!("connection dropped and connection retry is disabled");
                        ctx.nucleus_mut().desired_connection = false;
                    }
                    Self::transition(ConnectionState::Disconnected, ctx);
                }
                ctx.send_up(Event::Disconnected);
            }
            other => ctx.send_up(other),
        }
    }

    fn take_pending(&mut self) -> Vec<Operation> { std::mem::take(&mut self.waiting) }

    fn on_timer(&mut self, id: TimerId, ctx: &mut StageContext<'_>) {
        if !self.timer.as_ref().is_some_and(|timer| timer.is(id)) {
            debug!(id, "ignoring stale reconnect timer");
            return;
        }
        self.timer = None;
        if !ctx.desired_connection() || ctx.connected() {
            return;
        }
        metrics::inc_reconnect_attempts();
        info!(attempt = self.attempts, "reconnecting");
        self.send_attempt(true, ctx);
    }
}
