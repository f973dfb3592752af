//! Async device and module client.

use std::{future::Future, time::Duration};

use serde_json::Value;
use tokio::{runtime::Handle, sync::watch};

use super::{ClientCore, ClientError, ClientOptions, credentials};
use crate::{
    auth::NonRenewableSasToken,
    config::X509,
    error::PipelineError,
    handler::{Callback, HandlerKind},
    models::{Message, MethodRequest, MethodResponse, Twin, TwinPatch},
    pipeline::{ConnectionState, Feature, OpKind, OpOutput, PipelineKind},
};

/// Client for a hub device or module.
///
/// Must be created inside a tokio runtime; the pipeline and any handlers run
/// on that runtime. Receive-side features are enabled the first time they are
/// needed, so a client that only sends telemetry never subscribes to
/// anything.
///
/// # Examples
///
/// ```no_run
/// use hubwire::{Message, client::{ClientOptions, DeviceClient}};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), hubwire::client::ClientError> {
/// let client = DeviceClient::create_from_connection_string(
///     "HostName=hub.example.net;DeviceId=dev;SharedAccessKey=Zm9vYmFy",
///     ClientOptions::default(),
/// )?;
/// client.connect().await?;
/// client.send_message(Message::new("hello")).await?;
/// client.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct DeviceClient {
    core: ClientCore,
}

impl DeviceClient {
    /// Create a client from a device or module connection string.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the connection string is invalid, names an
    /// x509 device, the resulting configuration is rejected or no tokio
    /// runtime is running.
    pub fn create_from_connection_string(
        connection_string: &str,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let target = credentials::from_connection_string(connection_string, &options)?;
        Self::start(target, &options, &current_runtime()?)
    }

    /// Create a client from a SAS token string. The token cannot be renewed
    /// locally; supply a fresh one with [`DeviceClient::update_sastoken`].
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the token is malformed or its resource URI
    /// does not name a device.
    pub fn create_from_sastoken(sastoken: &str, options: ClientOptions) -> Result<Self, ClientError> {
        let target = credentials::from_sastoken(sastoken)?;
        Self::start(target, &options, &current_runtime()?)
    }

    /// Create a client authenticating with an X.509 certificate.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the configuration is rejected.
    pub fn create_from_x509_certificate(
        x509: X509,
        hostname: &str,
        device_id: &str,
        module_id: Option<&str>,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let target = credentials::from_x509(hostname, device_id, module_id, x509);
        Self::start(target, &options, &current_runtime()?)
    }

    pub(crate) fn start(
        target: credentials::Target,
        options: &ClientOptions,
        runtime: &Handle,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            core: ClientCore::start(PipelineKind::IoTHub, target, options, runtime)?,
        })
    }

    /// Connect to the hub.
    ///
    /// # Errors
    ///
    /// Returns the connection failure.
    pub async fn connect(&self) -> Result<(), ClientError> { self.core.run_done(OpKind::Connect).await }

    /// Disconnect from the hub. Operations waiting on the connection fail.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Pipeline`] if the transport reports a failure.
    pub async fn disconnect(&self) -> Result<(), ClientError> { self.core.run_done(OpKind::Disconnect).await }

    /// Replace a non-renewable token and reauthorize the live connection.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::SasToken`] for a malformed token and
    /// [`ClientError::Pipeline`] when the client uses a renewable token or
    /// the token names a different resource.
    pub async fn update_sastoken(&self, sastoken: &str) -> Result<(), ClientError> {
        let token = NonRenewableSasToken::parse(sastoken)?;
        self.core.run_done(OpKind::UpdateSasToken(token)).await
    }

    /// Send a telemetry message.
    ///
    /// # Errors
    ///
    /// Returns the send failure once retries are exhausted.
    pub async fn send_message(&self, message: Message) -> Result<(), ClientError> {
        self.core.run_done(OpKind::SendTelemetry(message)).await
    }

    /// Send a message to a module output.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidArgument`] when this client is not a
    /// module, otherwise the send failure.
    pub async fn send_message_to_output(
        &self,
        mut message: Message,
        output_name: &str,
    ) -> Result<(), ClientError> {
        if !self.core.is_module() {
            return Err(ClientError::InvalidArgument(
                "only module clients can send to an output".into(),
            ));
        }
        message.output_name = Some(output_name.to_owned());
        self.core.run_done(OpKind::SendOutputMessage(message)).await
    }

    /// Wait for the next cloud-to-device message, or input message for a
    /// module. `None` waits indefinitely.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Handler`] while a message handler is set and
    /// [`ClientError::ReceiveTimeout`] when nothing arrives in time.
    pub async fn receive_message(&self, timeout: Option<Duration>) -> Result<Message, ClientError> {
        self.core.handlers.ensure_receivable(HandlerKind::Message)?;
        self.core.enable_feature(self.core.message_feature()).await?;
        self.core
            .receive(HandlerKind::Message, self.core.inboxes.message_inbox(), timeout)
            .await
    }

    /// Wait for a method request, either for `method_name` or for any method
    /// without a dedicated inbox.
    ///
    /// # Errors
    ///
    /// As for [`DeviceClient::receive_message`].
    pub async fn receive_method_request(
        &self,
        method_name: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<MethodRequest, ClientError> {
        self.core.handlers.ensure_receivable(HandlerKind::MethodRequest)?;
        let inbox = self.core.inboxes.method_request_inbox(method_name);
        self.core.enable_feature(Feature::Methods).await?;
        self.core.receive(HandlerKind::MethodRequest, inbox, timeout).await
    }

    /// Answer a method request.
    ///
    /// # Errors
    ///
    /// Returns the send failure.
    pub async fn send_method_response(&self, response: MethodResponse) -> Result<(), ClientError> {
        self.core.run_done(OpKind::SendMethodResponse(response)).await
    }

    /// Fetch the full twin document.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Pipeline`] when the service rejects the request
    /// or no response arrives.
    pub async fn get_twin(&self) -> Result<Twin, ClientError> {
        self.core.enable_feature(Feature::TwinResponses).await?;
        match self.core.run(OpKind::GetTwin).await? {
            OpOutput::Twin(twin) => Ok(twin),
            _ => Err(ClientError::UnexpectedOutput("get_twin")),
        }
    }

    /// Patch the reported properties.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Pipeline`] when the service rejects the patch.
    pub async fn patch_twin_reported_properties(&self, patch: Value) -> Result<(), ClientError> {
        self.core.enable_feature(Feature::TwinResponses).await?;
        self.core.run_done(OpKind::PatchTwinReportedProperties(patch)).await
    }

    /// Wait for the next desired-properties patch.
    ///
    /// # Errors
    ///
    /// As for [`DeviceClient::receive_message`].
    pub async fn receive_twin_desired_properties_patch(
        &self,
        timeout: Option<Duration>,
    ) -> Result<TwinPatch, ClientError> {
        self.core.handlers.ensure_receivable(HandlerKind::TwinPatch)?;
        self.core.enable_feature(Feature::TwinPatches).await?;
        self.core
            .receive(HandlerKind::TwinPatch, self.core.inboxes.twin_patch_inbox(), timeout)
            .await
    }

    /// Set or clear the message handler. Setting one enables message
    /// delivery; clearing it disables it.
    ///
    /// # Errors
    ///
    /// Returns the feature change failure, or [`ClientError::Handler`] after
    /// shutdown.
    pub async fn set_message_handler<F, Fut>(&self, handler: Option<F>) -> Result<(), ClientError>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.install_message_handler(handler.map(Callback::future)).await
    }

    /// Set or clear the method request handler.
    ///
    /// # Errors
    ///
    /// As for [`DeviceClient::set_message_handler`].
    pub async fn set_method_request_handler<F, Fut>(&self, handler: Option<F>) -> Result<(), ClientError>
    where
        F: Fn(MethodRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.install_method_request_handler(handler.map(Callback::future))
            .await
    }

    /// Set or clear the desired-properties patch handler.
    ///
    /// # Errors
    ///
    /// As for [`DeviceClient::set_message_handler`].
    pub async fn set_twin_desired_properties_patch_handler<F, Fut>(
        &self,
        handler: Option<F>,
    ) -> Result<(), ClientError>
    where
        F: Fn(TwinPatch) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.install_twin_patch_handler(handler.map(Callback::future)).await
    }

    /// Set or clear the handler told about connection state changes.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Handler`] after shutdown.
    pub fn set_connection_state_change_handler<F, Fut>(&self, handler: Option<F>) -> Result<(), ClientError>
    where
        F: Fn(ConnectionState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Ok(self
            .core
            .handlers
            .set_connection_state_change_handler(handler.map(Callback::future))?)
    }

    /// Set or clear the handler asked for a fresh SAS token.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Handler`] after shutdown.
    pub fn set_new_sastoken_required_handler<F, Fut>(&self, handler: Option<F>) -> Result<(), ClientError>
    where
        F: Fn(()) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Ok(self
            .core
            .handlers
            .set_new_sastoken_required_handler(handler.map(Callback::future))?)
    }

    /// Set or clear the handler for errors no caller is waiting on.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Handler`] after shutdown.
    pub fn set_background_error_handler<F, Fut>(&self, handler: Option<F>) -> Result<(), ClientError>
    where
        F: Fn(PipelineError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Ok(self
            .core
            .handlers
            .set_background_error_handler(handler.map(Callback::future))?)
    }

    pub(crate) async fn install_message_handler(
        &self,
        handler: Option<Callback<Message>>,
    ) -> Result<(), ClientError> {
        let feature = self.core.message_feature();
        match handler {
            Some(handler) => {
                self.core.enable_feature(feature).await?;
                self.core.handlers.set_message_handler(Some(handler))?;
            }
            None => {
                self.core.handlers.set_message_handler(None)?;
                self.core.disable_feature(feature).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn install_method_request_handler(
        &self,
        handler: Option<Callback<MethodRequest>>,
    ) -> Result<(), ClientError> {
        match handler {
            Some(handler) => {
                self.core.enable_feature(Feature::Methods).await?;
                self.core.handlers.set_method_request_handler(Some(handler))?;
            }
            None => {
                self.core.handlers.set_method_request_handler(None)?;
                self.core.disable_feature(Feature::Methods).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn install_twin_patch_handler(
        &self,
        handler: Option<Callback<TwinPatch>>,
    ) -> Result<(), ClientError> {
        match handler {
            Some(handler) => {
                self.core.enable_feature(Feature::TwinPatches).await?;
                self.core.handlers.set_twin_patch_handler(Some(handler))?;
            }
            None => {
                self.core.handlers.set_twin_patch_handler(None)?;
                self.core.disable_feature(Feature::TwinPatches).await?;
            }
        }
        Ok(())
    }

    pub(crate) fn core(&self) -> &ClientCore { &self.core }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState { self.core.handle.state() }

    /// Whether the client is connected.
    #[must_use]
    pub fn connected(&self) -> bool { self.connection_state().is_connected() }

    /// Receiver that observes every connection state change.
    #[must_use]
    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> { self.core.handle.watch_state() }

    /// Disconnect, stop every handler and stop the pipeline. The client
    /// accepts no further operations.
    pub async fn shutdown(&self) { self.core.shutdown().await; }
}

pub(crate) fn current_runtime() -> Result<Handle, ClientError> {
    Handle::try_current().map_err(|err| ClientError::InvalidArgument(format!("no tokio runtime: {err}")))
}
