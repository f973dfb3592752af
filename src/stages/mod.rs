//! The concrete stages and the two chains built from them.
//!
//! Stages are listed top (application side) to bottom (transport side).
//! Each owns one concern; the order fixes which concern sees an operation
//! first and which sees an event first.

use std::sync::Arc;

use crate::{config::PipelineConfig, pipeline::Stage, transport::TransportFactory};

mod auth;
mod auto_connect;
mod connection_lock;
mod hub_mqtt;
mod provisioning;
mod provisioning_mqtt;
mod reconnect;
mod request_response;
mod retry;
mod root;
mod timeout;
mod transport;
mod twin;

pub(crate) use hub_mqtt::{IOTHUB_API_VERSION, USER_AGENT};
pub(crate) use provisioning_mqtt::PROVISIONING_API_VERSION;

use self::{
    auth::SasTokenRenewalStage,
    auto_connect::AutoConnectStage,
    connection_lock::ConnectionLockStage,
    hub_mqtt::HubTranslationStage,
    provisioning::{PollingStatusStage, RegistrationStage},
    provisioning_mqtt::ProvisioningTranslationStage,
    reconnect::ReconnectStage,
    request_response::CoordinateRequestAndResponseStage,
    retry::RetryStage,
    root::RootStage,
    timeout::OpTimeoutStage,
    transport::TransportStage,
    twin::{EnsureDesiredPropertiesStage, TwinRequestResponseStage},
};

fn connection_stages(config: &PipelineConfig, factory: Arc<dyn TransportFactory>) -> [Box<dyn Stage>; 6] {
    [
        Box::new(AutoConnectStage::new(config.auto_connect)),
        Box::new(ReconnectStage::default()),
        Box::new(ConnectionLockStage::default()),
        Box::new(RetryStage::default()),
        Box::new(OpTimeoutStage::default()),
        Box::new(TransportStage::new(factory)),
    ]
}

/// Stage chain for a hub device or module.
pub(crate) fn iothub(config: &PipelineConfig, factory: Arc<dyn TransportFactory>) -> Vec<Box<dyn Stage>> {
    let mut stages: Vec<Box<dyn Stage>> = vec![
        Box::new(RootStage),
        Box::new(SasTokenRenewalStage::default()),
        Box::new(EnsureDesiredPropertiesStage::new(config.ensure_desired_properties)),
        Box::new(TwinRequestResponseStage),
        Box::new(CoordinateRequestAndResponseStage::default()),
        Box::new(HubTranslationStage::new(config)),
    ];
    stages.extend(connection_stages(config, factory));
    stages
}

/// Stage chain for a provisioning registration.
pub(crate) fn provisioning(
    config: &PipelineConfig,
    factory: Arc<dyn TransportFactory>,
) -> Vec<Box<dyn Stage>> {
    let mut stages: Vec<Box<dyn Stage>> = vec![
        Box::new(RootStage),
        Box::new(SasTokenRenewalStage::default()),
        Box::new(RegistrationStage::default()),
        Box::new(PollingStatusStage::default()),
        Box::new(CoordinateRequestAndResponseStage::default()),
        Box::new(ProvisioningTranslationStage),
    ];
    stages.extend(connection_stages(config, factory));
    stages
}
