//! Twin requests and desired-property recovery.

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    error::PipelineError,
    pipeline::{
        Event,
        Feature,
        OpKind,
        OpOutput,
        OpResult,
        Operation,
        RequestSpec,
        RequestType,
        Stage,
        StageContext,
    },
};

const GET_RESOURCE: &str = "/";
const PATCH_RESOURCE: &str = "/properties/reported/";

/// Turns twin operations into correlated requests and interprets the
/// responses.
#[derive(Debug, Default)]
pub(crate) struct TwinRequestResponseStage;

impl TwinRequestResponseStage {
    fn interpret(method: &str, result: OpResult) -> OpResult {
        let response = match result? {
            OpOutput::Response(response) => response,
            other => return Ok(other),
        };
        if response.status >= 300 {
            let body = String::from_utf8_lossy(&response.body).into_owned();
            return Err(PipelineError::service(
                response.status,
                format!("twin {method} failed: {body}"),
            ));
        }
        if method == "GET" {
            let twin: Value = serde_json::from_slice(&response.body)
                .map_err(|err| PipelineError::Protocol(format!("malformed twin document: {err}")))?;
            Ok(OpOutput::Twin(twin))
        } else {
            Ok(OpOutput::Done)
        }
    }
}

impl Stage for TwinRequestResponseStage {
    fn name(&self) -> &'static str { "twin_request_response" }

    fn run_op(&mut self, op: Operation, ctx: &mut StageContext<'_>) {
        let spec = match &op.kind {
            OpKind::GetTwin => RequestSpec {
                request_type: RequestType::Twin,
                method: "GET",
                resource_location: GET_RESOURCE,
                body: Bytes::from_static(b" "),
            },
            OpKind::PatchTwinReportedProperties(patch) => match serde_json::to_vec(patch) {
                Ok(body) => RequestSpec {
                    request_type: RequestType::Twin,
                    method: "PATCH",
                    resource_location: PATCH_RESOURCE,
                    body: Bytes::from(body),
                },
                Err(err) => {
                    ctx.complete(op, Err(PipelineError::Client(err.to_string())));
                    return;
                }
            },
            _ => {
                ctx.send_down(op);
                return;
            }
        };
        ctx.send_down_intercepted(Operation::worker(OpKind::RequestAndResponse(spec), op));
    }

    fn on_op_complete(&mut self, op: Operation, result: OpResult, ctx: &mut StageContext<'_>) {
        let method = match &op.kind {
            OpKind::RequestAndResponse(spec) => spec.method,
            _ => "",
        };
        let result = Self::interpret(method, result);
        ctx.complete(op, result);
    }
}

/// Re-fetches the twin after a reconnect so desired-property changes made
/// while offline are not lost.
///
/// Armed once twin patches are enabled, after which every reconnect fetches
/// the twin. It remembers the last desired `$version` seen; when a fetched
/// twin reports a different version, or no patch has been seen yet, the
/// desired section is delivered as a patch.
#[derive(Debug)]
pub(crate) struct EnsureDesiredPropertiesStage {
    enabled: bool,
    armed: bool,
    last_version: Option<u64>,
    fetching: bool,
}

impl EnsureDesiredPropertiesStage {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            armed: false,
            last_version: None,
            fetching: false,
        }
    }

    fn fetch(&mut self, ctx: &mut StageContext<'_>) {
        self.fetching = true;
        ctx.send_down_intercepted(Operation::internal(OpKind::GetTwin));
    }

    fn on_twin(&mut self, twin: &Value, ctx: &mut StageContext<'_>) {
        let desired = twin.get("desired").cloned().unwrap_or(Value::Null);
        let version = desired.get("$version").and_then(Value::as_u64);
        if version == self.last_version {
            debug!(?version, "desired properties unchanged across reconnect");
            return;
        }
        info!(previous = ?self.last_version, current = ?version, "desired properties changed while disconnected");
        self.last_version = version;
        ctx.send_up(Event::TwinPatch(desired));
    }
}

impl Stage for EnsureDesiredPropertiesStage {
    fn name(&self) -> &'static str { "ensure_desired_properties" }

    fn run_op(&mut self, op: Operation, ctx: &mut StageContext<'_>) {
        match &op.kind {
            OpKind::EnableFeature(Feature::TwinPatches) if self.enabled => ctx.send_down_intercepted(op),
            OpKind::DisableFeature(Feature::TwinPatches) => {
                self.armed = false;
                ctx.send_down(op);
            }
            _ => ctx.send_down(op),
        }
    }

    fn handle_event(&mut self, event: Event, ctx: &mut StageContext<'_>) {
        match &event {
            Event::TwinPatch(patch) => {
                if let Some(version) = patch.get("$version").and_then(Value::as_u64) {
                    self.last_version = Some(version);
                }
                ctx.send_up(event);
            }
            Event::Connected => {
                ctx.send_up(event);
                if self.armed && !self.fetching {
                    self.fetch(ctx);
                }
            }
            _ => ctx.send_up(event),
        }
    }

    fn on_op_complete(&mut self, op: Operation, result: OpResult, ctx: &mut StageContext<'_>) {
        match (&op.kind, &result) {
            (OpKind::EnableFeature(_), Ok(_)) => self.armed = true,
            (OpKind::GetTwin, Ok(OpOutput::Twin(twin))) => {
                self.fetching = false;
                self.on_twin(twin, ctx);
            }
            (OpKind::GetTwin, outcome) => {
                self.fetching = false;
                if let Err(err) = outcome {
                    if ctx.connected() {
                        warn!(error = %err, "twin fetch after reconnect failed; retrying");
                        self.fetch(ctx);
                    } else {
                        debug!(error = %err, "twin fetch abandoned while disconnected");
                    }
                }
            }
            _ => {}
        }
        ctx.complete(op, result);
    }
}
