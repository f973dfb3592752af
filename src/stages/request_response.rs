//! Correlation of requests with responses that arrive as events.

use std::collections::HashMap;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pipeline::{Event, OpKind, OpOutput, OpResult, Operation, Stage, StageContext};

/// Matches responses to the requests that caused them.
///
/// Each `RequestAndResponse` operation is given a fresh request id and kept
/// until an event carrying that id arrives. The outgoing `Request` is a
/// separate worker; if it cannot be sent the original fails with its error.
/// Requests still pending when the connection comes back are sent again.
#[derive(Debug, Default)]
pub(crate) struct CoordinateRequestAndResponseStage {
    pending: HashMap<String, Operation>,
}

impl CoordinateRequestAndResponseStage {
    fn send_request(request_id: &str, op: &Operation, ctx: &mut StageContext<'_>) {
        let OpKind::RequestAndResponse(spec) = &op.kind else {
            return;
        };
        let mut worker = Operation::internal(OpKind::Request {
            request_id: request_id.to_owned(),
            spec: spec.clone(),
        });
        worker.origin = Some(op.id);
        ctx.send_down_intercepted(worker);
    }
}

impl Stage for CoordinateRequestAndResponseStage {
    fn name(&self) -> &'static str { "coordinate_request_and_response" }

    fn run_op(&mut self, op: Operation, ctx: &mut StageContext<'_>) {
        if !matches!(op.kind, OpKind::RequestAndResponse(_)) {
            ctx.send_down(op);
            return;
        }
        let request_id = Uuid::new_v4().to_string();
        debug!(%request_id, op = %op.id, "sending correlated request");
        Self::send_request(&request_id, &op, ctx);
        self.pending.insert(request_id, op);
    }

    fn on_op_complete(&mut self, op: Operation, result: OpResult, ctx: &mut StageContext<'_>) {
        if let (Err(err), OpKind::Request { request_id, .. }) = (&result, &op.kind) {
            if let Some(original) = self.pending.remove(request_id) {
                ctx.complete(original, Err(err.clone()));
            }
        }
        ctx.complete(op, result);
    }

    fn take_pending(&mut self) -> Vec<Operation> { self.pending.drain().map(|(_, op)| op).collect() }

    fn handle_event(&mut self, event: Event, ctx: &mut StageContext<'_>) {
        match event {
            Event::Response {
                request_id,
                response,
            } => match self.pending.remove(&request_id) {
                Some(op) => ctx.complete(op, Ok(OpOutput::Response(response))),
                None => warn!(%request_id, "dropping response to unknown request"),
            },
            Event::Connected => {
                ctx.send_up(Event::Connected);
                if !self.pending.is_empty() {
                    info!(count = self.pending.len(), "resending requests after reconnect");
                }
                for (request_id, op) in &self.pending {
                    Self::send_request(request_id, op, ctx);
                }
            }
            other => ctx.send_up(other),
        }
    }
}
