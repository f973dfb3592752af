//! Translation between hub operations and MQTT publishes and subscriptions.

use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use crate::{
    config::{Credential, Identity, PipelineConfig},
    error::PipelineError,
    models::MethodRequest,
    pipeline::{
        Event,
        Feature,
        OpKind,
        Operation,
        RequestType,
        Response,
        Stage,
        StageContext,
    },
    topic::{encode, hub, hub::HubTopics},
    transport::ConnectionArgs,
};

/// Hub API version sent in the MQTT username.
pub(crate) const IOTHUB_API_VERSION: &str = "2019-10-01";

/// User agent reported to the hub, before any application product info.
pub(crate) const USER_AGENT: &str = concat!("hubwire/", env!("CARGO_PKG_VERSION"));

/// Maps hub operations onto MQTT operations and MQTT messages back onto hub
/// events, according to the topic they arrived on.
#[derive(Debug)]
pub(crate) struct HubTranslationStage {
    topics: Option<HubTopics>,
}

impl HubTranslationStage {
    pub(crate) fn new(config: &PipelineConfig) -> Self {
        let topics = match &config.identity {
            Identity::Device {
                device_id,
                module_id,
            } => Some(HubTopics::new(device_id, module_id.as_deref())),
            Identity::Registration { .. } => None,
        };
        Self { topics }
    }

    fn translate(&self, kind: &OpKind, ctx: &StageContext<'_>) -> Result<Option<OpKind>, PipelineError> {
        let topics = self
            .topics
            .as_ref()
            .ok_or_else(|| PipelineError::Client("hub pipeline requires a device identity".into()))?;
        let translated = match kind {
            OpKind::Initialize => OpKind::SetConnectionArgs(connection_args(&ctx.config())?),
            OpKind::SendTelemetry(message) => OpKind::Publish {
                topic: topics.telemetry(message),
                payload: message.data.clone(),
            },
            OpKind::SendOutputMessage(message) => {
                if !topics.is_module() {
                    return Err(PipelineError::Client("output messages require a module identity".into()));
                }
                if message.output_name.is_none() {
                    return Err(PipelineError::Client("output message has no output name".into()));
                }
                OpKind::Publish {
                    topic: topics.telemetry(message),
                    payload: message.data.clone(),
                }
            }
            OpKind::SendMethodResponse(response) => {
                let payload = serde_json::to_vec(response.payload.as_ref().unwrap_or(&Value::Null))
                    .map_err(|err| PipelineError::Client(err.to_string()))?;
                OpKind::Publish {
                    topic: hub::method_response(&response.request_id, response.status),
                    payload: Bytes::from(payload),
                }
            }
            OpKind::EnableFeature(feature) => OpKind::Subscribe {
                topic: feature_topic(topics, *feature)?,
            },
            OpKind::DisableFeature(feature) => OpKind::Unsubscribe {
                topic: feature_topic(topics, *feature)?,
            },
            OpKind::Request { request_id, spec } => {
                if spec.request_type != RequestType::Twin {
                    return Err(PipelineError::OperationError(format!(
                        "request type {} not supported by the hub",
                        spec.request_type.as_str()
                    )));
                }
                OpKind::Publish {
                    topic: hub::twin_request(spec.method, spec.resource_location, request_id),
                    payload: spec.body.clone(),
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(translated))
    }

    fn translate_message(&self, topic: &str, payload: Bytes) -> Result<Option<Event>, PipelineError> {
        let Some(topics) = self.topics.as_ref() else {
            return Ok(None);
        };
        let event = if topics.is_c2d(topic) {
            Event::Message(topics.parse_c2d(topic, payload)?)
        } else if topics.is_input(topic) {
            Event::Message(topics.parse_input(topic, payload)?)
        } else if hub::is_method_request(topic) {
            let (name, request_id) = hub::parse_method_request(topic)?;
            Event::MethodRequest(MethodRequest {
                request_id,
                name,
                payload: parse_json(&payload)?,
            })
        } else if hub::is_twin_response(topic) {
            let (status, request_id) = hub::parse_twin_response(topic)?;
            Event::Response {
                request_id,
                response: Response {
                    status,
                    body: payload,
                    retry_after: None,
                },
            }
        } else if hub::is_twin_patch(topic) {
            Event::TwinPatch(parse_json(&payload)?.unwrap_or(Value::Null))
        } else {
            return Ok(None);
        };
        Ok(Some(event))
    }
}

impl Stage for HubTranslationStage {
    fn name(&self) -> &'static str { "hub_translation" }

    fn run_op(&mut self, op: Operation, ctx: &mut StageContext<'_>) {
        match self.translate(&op.kind, ctx) {
            Ok(Some(kind)) => ctx.send_down(Operation::worker(kind, op)),
            Ok(None) => ctx.send_down(op),
            Err(err) => ctx.complete(op, Err(err)),
        }
    }

    fn handle_event(&mut self, event: Event, ctx: &mut StageContext<'_>) {
        let Event::IncomingMessage { topic, payload } = event else {
            ctx.send_up(event);
            return;
        };
        match self.translate_message(&topic, payload.clone()) {
            Ok(Some(translated)) => ctx.send_up(translated),
            Ok(None) => {
                debug!(%topic, "unknown topic; passing up");
                ctx.send_up(Event::IncomingMessage { topic, payload });
            }
            Err(err) => ctx.background_error(err),
        }
    }
}

fn feature_topic(topics: &HubTopics, feature: Feature) -> Result<String, PipelineError> {
    match feature {
        Feature::C2dMessages => Ok(topics.c2d_subscribe()),
        Feature::InputMessages => topics
            .input_subscribe()
            .ok_or_else(|| PipelineError::Client("input messages require a module identity".into())),
        Feature::Methods => Ok(hub::METHOD_SUBSCRIBE.to_owned()),
        Feature::TwinResponses => Ok(hub::TWIN_RESPONSE_SUBSCRIBE.to_owned()),
        Feature::TwinPatches => Ok(hub::TWIN_PATCH_SUBSCRIBE.to_owned()),
        Feature::ProvisioningResponses => Err(PipelineError::Client(format!(
            "feature {feature} is not available on the hub"
        ))),
    }
}

fn parse_json(payload: &[u8]) -> Result<Option<Value>, PipelineError> {
    if payload.is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(payload)
        .map(Some)
        .map_err(|err| PipelineError::Protocol(format!("malformed json payload: {err}")))
}

/// MQTT connection arguments for a device or module identity.
pub(crate) fn connection_args(config: &PipelineConfig) -> Result<ConnectionArgs, PipelineError> {
    let Identity::Device {
        device_id,
        module_id,
    } = &config.identity
    else {
        return Err(PipelineError::Client("hub pipeline requires a device identity".into()));
    };
    let client_id = match module_id {
        Some(module_id) => format!("{device_id}/{module_id}"),
        None => device_id.clone(),
    };
    let user_agent = format!("{USER_AGENT}{}", config.product_info);
    let username = format!(
        "{}/{client_id}/?api-version={IOTHUB_API_VERSION}&DeviceClientType={}",
        config.hostname,
        encode(&user_agent)
    );
    Ok(ConnectionArgs {
        client_id,
        hostname: config
            .gateway_hostname
            .clone()
            .unwrap_or_else(|| config.hostname.clone()),
        username,
        server_verification_cert: config.server_verification_cert.clone(),
        client_certificate: match &config.credential {
            Credential::X509(cert) => Some(cert.clone()),
            Credential::SasToken(_) => None,
        },
        websockets: config.websockets,
        cipher: config.cipher.clone(),
        proxy_options: config.proxy_options.clone(),
        keep_alive: config.keep_alive,
    })
}
