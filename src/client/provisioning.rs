//! Async provisioning client.

use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{info, warn};

use super::{ClientCore, ClientError, ClientOptions, credentials, device::current_runtime};
use crate::{
    config::{Credential, X509},
    models::RegistrationResult,
    pipeline::{Feature, OpKind, OpOutput, PipelineKind},
};

/// Registers a device with the provisioning service.
///
/// ```no_run
/// use hubwire::{client::{ClientOptions, ProvisioningDeviceClient}, config::DEFAULT_PROVISIONING_HOST};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), hubwire::client::ClientError> {
/// let client = ProvisioningDeviceClient::create_from_symmetric_key(
///     DEFAULT_PROVISIONING_HOST,
///     "my-device",
///     "0ne00000000",
///     "Zm9vYmFy",
///     ClientOptions::default(),
/// )?;
/// let result = client.register(None).await?;
/// println!("assigned to {:?}", result.registration_state);
/// # Ok(())
/// # }
/// ```
pub struct ProvisioningDeviceClient {
    core: ClientCore,
}

impl ProvisioningDeviceClient {
    /// Create a client that signs its own registration tokens.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the key is not valid base64, the
    /// configuration is rejected or no tokio runtime is running.
    pub fn create_from_symmetric_key(
        provisioning_host: &str,
        registration_id: &str,
        id_scope: &str,
        symmetric_key: &str,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let credential = credentials::registration_token(id_scope, registration_id, symmetric_key, &options)?;
        Self::start(provisioning_host, registration_id, id_scope, credential, &options, &current_runtime()?)
    }

    /// Create a client authenticating with an X.509 certificate.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the configuration is rejected or no tokio
    /// runtime is running.
    pub fn create_from_x509_certificate(
        provisioning_host: &str,
        registration_id: &str,
        id_scope: &str,
        x509: X509,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        Self::start(
            provisioning_host,
            registration_id,
            id_scope,
            Credential::X509(x509),
            &options,
            &current_runtime()?,
        )
    }

    pub(crate) fn start(
        provisioning_host: &str,
        registration_id: &str,
        id_scope: &str,
        credential: Credential,
        options: &ClientOptions,
        runtime: &Handle,
    ) -> Result<Self, ClientError> {
        let target = credentials::registration(provisioning_host, id_scope, registration_id, credential);
        Ok(Self {
            core: ClientCore::start(PipelineKind::Provisioning, target, options, runtime)?,
        })
    }

    /// Register, polling until the service assigns a hub, then disconnect.
    ///
    /// `payload` is passed to the service's custom allocation logic.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Pipeline`] when the service rejects or fails
    /// the registration or no response arrives within the provisioning
    /// timeout.
    pub async fn register(&self, payload: Option<Value>) -> Result<RegistrationResult, ClientError> {
        self.core.enable_feature(Feature::ProvisioningResponses).await?;
        let result = match self.core.run(OpKind::Register { payload }).await? {
            OpOutput::Registration(result) => result,
            _ => return Err(ClientError::UnexpectedOutput("register")),
        };
        info!(operation_id = %result.operation_id, status = %result.status, "registration complete");
        if let Err(err) = self.core.run_done(OpKind::Disconnect).await {
            warn!(error = %err, "disconnect after registration failed");
        }
        Ok(result)
    }

    /// Stop the pipeline. The client accepts no further operations.
    pub async fn shutdown(&self) { self.core.shutdown().await; }
}
