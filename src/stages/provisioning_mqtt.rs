//! Translation between provisioning operations and MQTT.

use tracing::{info, warn};

use super::hub_mqtt::USER_AGENT;
use crate::{
    config::{Credential, Identity, PipelineConfig},
    error::PipelineError,
    pipeline::{Event, Feature, OpKind, Operation, RequestType, Response, Stage, StageContext},
    topic::{encode, provisioning},
    transport::ConnectionArgs,
};

/// Provisioning API version sent in the MQTT username.
pub(crate) const PROVISIONING_API_VERSION: &str = "2019-03-31";

/// Maps registration requests onto provisioning topics and provisioning
/// responses back onto correlated response events.
#[derive(Debug, Default)]
pub(crate) struct ProvisioningTranslationStage;

impl ProvisioningTranslationStage {
    fn translate(kind: &OpKind, ctx: &StageContext<'_>) -> Result<Option<OpKind>, PipelineError> {
        let translated = match kind {
            OpKind::Initialize => OpKind::SetConnectionArgs(connection_args(&ctx.config())?),
            OpKind::EnableFeature(Feature::ProvisioningResponses) => OpKind::Subscribe {
                topic: provisioning::RESPONSE_SUBSCRIBE.to_owned(),
            },
            OpKind::DisableFeature(Feature::ProvisioningResponses) => OpKind::Unsubscribe {
                topic: provisioning::RESPONSE_SUBSCRIBE.to_owned(),
            },
            OpKind::EnableFeature(feature) | OpKind::DisableFeature(feature) => {
                return Err(PipelineError::Client(format!(
                    "feature {feature} is not available on the provisioning service"
                )));
            }
            OpKind::Request { request_id, spec } => {
                let topic = match &spec.request_type {
                    RequestType::Register => provisioning::register(request_id),
                    RequestType::Query { operation_id } => provisioning::query(request_id, operation_id),
                    RequestType::Twin => {
                        return Err(PipelineError::OperationError(
                            "twin requests are not supported by the provisioning service".into(),
                        ));
                    }
                };
                OpKind::Publish {
                    topic,
                    payload: spec.body.clone(),
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(translated))
    }
}

impl Stage for ProvisioningTranslationStage {
    fn name(&self) -> &'static str { "provisioning_translation" }

    fn run_op(&mut self, op: Operation, ctx: &mut StageContext<'_>) {
        match Self::translate(&op.kind, ctx) {
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
        if !provisioning::is_response(&topic) {
            warn!(%topic, "unknown topic; passing up");
            ctx.send_up(Event::IncomingMessage { topic, payload });
            return;
        }
        match provisioning::parse_response(&topic) {
            Ok(parsed) => {
                info!(status = parsed.status, request_id = %parsed.request_id, "provisioning response");
                ctx.send_up(Event::Response {
                    request_id: parsed.request_id,
                    response: Response {
                        status: parsed.status,
                        body: payload,
                        retry_after: parsed.retry_after,
                    },
                });
            }
            Err(err) => ctx.background_error(err.into()),
        }
    }
}

/// MQTT connection arguments for a registration identity.
pub(crate) fn connection_args(config: &PipelineConfig) -> Result<ConnectionArgs, PipelineError> {
    let Identity::Registration {
        id_scope,
        registration_id,
    } = &config.identity
    else {
        return Err(PipelineError::Client(
            "provisioning pipeline requires a registration identity".into(),
        ));
    };
    let username = format!(
        "{id_scope}/registrations/{registration_id}/api-version={PROVISIONING_API_VERSION}&ClientVersion={}",
        encode(USER_AGENT)
    );
    Ok(ConnectionArgs {
        client_id: registration_id.clone(),
        hostname: config.hostname.clone(),
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
