//! Bottom of the pipeline: binds operations to a [`Transport`].

use std::{collections::HashMap, sync::Arc};

use tracing::{debug, error, info, warn};

use crate::{
    error::{PipelineError, TransportError},
    metrics,
    pipeline::{Event, OpKind, OpOutput, Operation, Stage, StageContext},
    transport::{MessageId, Transport, TransportEvent, TransportFactory},
};

/// Owns the transport and maps operations onto its calls.
///
/// The transport is created when connection arguments arrive. Connect and
/// disconnect complete when the transport reports the matching event;
/// publishes, subscribes and unsubscribes complete on acknowledgement.
/// Reauthorization is a disconnect followed by a connect with the current
/// token, hidden from the stages above.
pub(crate) struct TransportStage {
    factory: Arc<dyn TransportFactory>,
    transport: Option<Box<dyn Transport>>,
    pending_connect: Option<Operation>,
    pending_disconnect: Option<Operation>,
    pending_reauth: Option<Operation>,
    reauthorizing: bool,
    in_flight: HashMap<MessageId, Operation>,
}

impl TransportStage {
    pub(crate) fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            transport: None,
            pending_connect: None,
            pending_disconnect: None,
            pending_reauth: None,
            reauthorizing: false,
            in_flight: HashMap::new(),
        }
    }

    fn password(ctx: &StageContext<'_>) -> Option<String> {
        ctx.config()
            .credential
            .sas_token()
            .map(crate::auth::SharedSasToken::current)
    }

    fn start_connect(&mut self, op: Operation, ctx: &mut StageContext<'_>) {
        let Some(transport) = self.transport.as_mut() else {
            ctx.complete(op, Err(no_transport()));
            return;
        };
        if let Some(previous) = self.pending_connect.take() {
            ctx.complete(
                previous,
                Err(PipelineError::OperationCancelled("superseded by a newer connect".into())),
            );
        }
        let password = Self::password(ctx);
        match transport.connect(password.as_deref()) {
            Ok(()) => {
                debug!(op = %op.id, "connect started");
                self.pending_connect = Some(op);
            }
            Err(err) => ctx.complete(op, Err(PipelineError::from_transport(err))),
        }
    }

    fn start_message_op(&mut self, op: Operation, ctx: &mut StageContext<'_>) {
        let Some(transport) = self.transport.as_mut().filter(|_| ctx.connected()) else {
            let err = PipelineError::NoConnection(format!("{} needs a connection", op.name()));
            ctx.complete(op, Err(err));
            return;
        };
        let started = match &op.kind {
            OpKind::Publish { topic, payload } => transport.publish(topic, payload.clone()),
            OpKind::Subscribe { topic } => transport.subscribe(topic),
            OpKind::Unsubscribe { topic } => transport.unsubscribe(topic),
            _ => {
                ctx.send_down(op);
                return;
            }
        };
        match started {
            Ok(mid) => {
                debug!(op = op.name(), mid, "awaiting acknowledgement");
                self.in_flight.insert(mid, op);
            }
            Err(err) => ctx.complete(op, Err(PipelineError::from_transport(err))),
        }
    }

    fn fail_in_flight(&mut self, err: &PipelineError, ctx: &mut StageContext<'_>) {
        if !self.in_flight.is_empty() {
            debug!(count = self.in_flight.len(), error = %err, "failing unacknowledged operations");
        }
        let mut pending: Vec<_> = self.in_flight.drain().collect();
        pending.sort_by_key(|(mid, _)| *mid);
        for (_, op) in pending {
            ctx.complete(op, Err(err.clone()));
        }
    }

    fn set_connected(connected: bool, ctx: &mut StageContext<'_>) {
        ctx.nucleus_mut().connected = connected;
        metrics::set_connected(connected);
    }

    fn on_connected(&mut self, ctx: &mut StageContext<'_>) {
        info!("transport connected");
        Self::set_connected(true, ctx);
        self.reauthorizing = false;
        // Upper stages see the connection before any caller is released.
        ctx.send_up(Event::Connected);
        if let Some(op) = self.pending_connect.take() {
            ctx.complete(op, Ok(OpOutput::Done));
        }
    }

    fn on_connection_failed(&mut self, err: TransportError, ctx: &mut StageContext<'_>) {
        warn!(error = %err, "connection attempt failed");
        Self::set_connected(false, ctx);
        let err = PipelineError::from_transport(err);
        match self.pending_connect.take() {
            Some(op) => ctx.complete(op, Err(err)),
            None => ctx.background_error(err),
        }
        if std::mem::take(&mut self.reauthorizing) {
            // The old session is gone; let the reconnect policy take over.
            ctx.send_up(Event::Disconnected);
        }
    }

    fn on_disconnected(&mut self, cause: Option<TransportError>, ctx: &mut StageContext<'_>) {
        let was_connected = ctx.connected();
        Self::set_connected(false, ctx);
        let reauth = self.pending_reauth.take();
        if was_connected && reauth.is_none() {
            ctx.send_up(Event::Disconnected);
        }
        if let Some(op) = self.pending_disconnect.take() {
            info!("transport disconnected");
            self.fail_in_flight(
                &PipelineError::OperationCancelled("connection closed by request".into()),
                ctx,
            );
            ctx.complete(op, Ok(OpOutput::Done));
        } else {
            let reason = cause
                .as_ref()
                .map_or_else(|| "connection closed".to_owned(), ToString::to_string);
            self.fail_in_flight(&PipelineError::ConnectionDropped(reason.clone()), ctx);
            if let Some(op) = self.pending_connect.take() {
                ctx.complete(
                    op,
                    Err(PipelineError::ConnectionFailed(
                        cause.clone().unwrap_or(TransportError::Other(reason)),
                    )),
                );
            }
        }
        if let Some(op) = reauth {
            info!("reconnecting with refreshed credentials");
            self.reauthorizing = true;
            self.start_connect(op, ctx);
            return;
        }
        if let Some(err) = cause {
            error!(error = %err, "connection dropped");
            ctx.background_error(PipelineError::ConnectionDropped(err.to_string()));
        }
    }
}

impl Stage for TransportStage {
    fn name(&self) -> &'static str { "transport" }

    fn run_op(&mut self, op: Operation, ctx: &mut StageContext<'_>) {
        match &op.kind {
            OpKind::SetConnectionArgs(args) => {
                info!(client_id = %args.client_id, hostname = %args.hostname, "creating transport");
                match self.factory.create(args, ctx.transport_sink()) {
                    Ok(transport) => {
                        self.transport = Some(transport);
                        ctx.complete(op, Ok(OpOutput::Done));
                    }
                    Err(err) => ctx.complete(op, Err(PipelineError::from_transport(err))),
                }
            }
            OpKind::Connect => self.start_connect(op, ctx),
            OpKind::Disconnect => {
                if let Some(connecting) = self.pending_connect.take() {
                    ctx.complete(
                        connecting,
                        Err(PipelineError::OperationCancelled("disconnect requested".into())),
                    );
                }
                let Some(transport) = self.transport.as_mut() else {
                    ctx.complete(op, Ok(OpOutput::Done));
                    return;
                };
                match transport.disconnect() {
                    Ok(()) => self.pending_disconnect = Some(op),
                    Err(err) => ctx.complete(op, Err(PipelineError::from_transport(err))),
                }
            }
            OpKind::Reauthorize => {
                if !ctx.connected() {
                    self.start_connect(op, ctx);
                    return;
                }
                let Some(transport) = self.transport.as_mut() else {
                    ctx.complete(op, Err(no_transport()));
                    return;
                };
                info!("reauthorizing connection");
                match transport.disconnect() {
                    Ok(()) => self.pending_reauth = Some(op),
                    Err(err) => ctx.complete(op, Err(PipelineError::from_transport(err))),
                }
            }
            OpKind::Publish { .. } | OpKind::Subscribe { .. } | OpKind::Unsubscribe { .. } => {
                self.start_message_op(op, ctx);
            }
            _ => ctx.send_down(op),
        }
    }

    fn take_pending(&mut self) -> Vec<Operation> {
        let mut held: Vec<_> = [
            self.pending_connect.take(),
            self.pending_disconnect.take(),
            self.pending_reauth.take(),
        ]
        .into_iter()
        .flatten()
        .collect();
        held.extend(self.in_flight.drain().map(|(_, op)| op));
        held
    }

    fn on_transport_event(&mut self, event: TransportEvent, ctx: &mut StageContext<'_>) {
        match event {
            TransportEvent::Connected => self.on_connected(ctx),
            TransportEvent::ConnectionFailed(err) => self.on_connection_failed(err, ctx),
            TransportEvent::Disconnected(cause) => self.on_disconnected(cause, ctx),
            TransportEvent::MessageReceived { topic, payload } => {
                ctx.send_up(Event::IncomingMessage { topic, payload });
            }
            TransportEvent::Published(mid)
            | TransportEvent::Subscribed(mid)
            | TransportEvent::Unsubscribed(mid) => match self.in_flight.remove(&mid) {
                Some(op) => ctx.complete(op, Ok(OpOutput::Done)),
                None => warn!(mid, "acknowledgement for unknown message id"),
            },
        }
    }
}

fn no_transport() -> PipelineError {
    PipelineError::Client("connection arguments have not been set".into())
}
