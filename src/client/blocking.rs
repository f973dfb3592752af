//! Thread-blocking clients.
//!
//! Each blocking client owns a small tokio runtime whose single worker thread
//! runs the pipeline context. Calls block the caller until the matching
//! operation completes. Handlers run on the runtime's blocking pool, so they
//! may call back into the client.
//!
//! Blocking clients must not be used from inside another async runtime;
//! blocking on one runtime from a worker of another panics.

use std::{future::Future, time::Duration};

use serde_json::Value;
use tokio::{
    runtime::{Builder, Runtime},
    sync::watch,
};

use super::{ClientError, ClientOptions, DeviceClient, ProvisioningDeviceClient, credentials};
use crate::{
    config::{Credential, X509},
    error::PipelineError,
    handler::Callback,
    models::{Message, MethodRequest, MethodResponse, RegistrationResult, Twin, TwinPatch},
    pipeline::ConnectionState,
};

fn background_runtime() -> Result<Runtime, ClientError> {
    Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("hubwire-pipeline")
        .enable_all()
        .build()
        .map_err(ClientError::Runtime)
}

/// Blocking counterpart of [`DeviceClient`].
///
/// ```no_run
/// use std::time::Duration;
///
/// use hubwire::client::{ClientOptions, SyncDeviceClient};
///
/// let client = SyncDeviceClient::create_from_connection_string(
///     "HostName=hub.example.net;DeviceId=dev;SharedAccessKey=Zm9vYmFy",
///     ClientOptions::default(),
/// )?;
/// client.connect()?;
/// let message = client.receive_message(Some(Duration::from_secs(30)))?;
/// println!("received {} bytes", message.data.len());
/// client.shutdown();
/// # Ok::<(), hubwire::client::ClientError>(())
/// ```
pub struct SyncDeviceClient {
    // Dropped before the runtime it runs on.
    inner: DeviceClient,
    runtime: Runtime,
}

impl SyncDeviceClient {
    /// See [`DeviceClient::create_from_connection_string`].
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the connection string or configuration is
    /// invalid, or the background runtime cannot start.
    pub fn create_from_connection_string(
        connection_string: &str,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let target = credentials::from_connection_string(connection_string, &options)?;
        Self::start(target, &options)
    }

    /// See [`DeviceClient::create_from_sastoken`].
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the token is malformed or the background
    /// runtime cannot start.
    pub fn create_from_sastoken(sastoken: &str, options: ClientOptions) -> Result<Self, ClientError> {
        let target = credentials::from_sastoken(sastoken)?;
        Self::start(target, &options)
    }

    /// See [`DeviceClient::create_from_x509_certificate`].
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the configuration is rejected or the
    /// background runtime cannot start.
    pub fn create_from_x509_certificate(
        x509: X509,
        hostname: &str,
        device_id: &str,
        module_id: Option<&str>,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let target = credentials::from_x509(hostname, device_id, module_id, x509);
        Self::start(target, &options)
    }

    fn start(target: credentials::Target, options: &ClientOptions) -> Result<Self, ClientError> {
        let runtime = background_runtime()?;
        let inner = DeviceClient::start(target, options, runtime.handle())?;
        Ok(Self { inner, runtime })
    }

    fn wait<F: Future>(&self, future: F) -> F::Output { self.runtime.block_on(future) }

    /// Connect to the hub.
    ///
    /// # Errors
    ///
    /// Returns the connection failure.
    pub fn connect(&self) -> Result<(), ClientError> { self.wait(self.inner.connect()) }

    /// Disconnect from the hub.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Pipeline`] if the transport reports a failure.
    pub fn disconnect(&self) -> Result<(), ClientError> { self.wait(self.inner.disconnect()) }

    /// See [`DeviceClient::update_sastoken`].
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] for a malformed or mismatched token.
    pub fn update_sastoken(&self, sastoken: &str) -> Result<(), ClientError> {
        self.wait(self.inner.update_sastoken(sastoken))
    }

    /// Send a telemetry message.
    ///
    /// # Errors
    ///
    /// Returns the send failure.
    pub fn send_message(&self, message: Message) -> Result<(), ClientError> {
        self.wait(self.inner.send_message(message))
    }

    /// Send a message to a module output.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidArgument`] for a device client,
    /// otherwise the send failure.
    pub fn send_message_to_output(&self, message: Message, output_name: &str) -> Result<(), ClientError> {
        self.wait(self.inner.send_message_to_output(message, output_name))
    }

    /// Block until a message arrives or `timeout` passes.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ReceiveTimeout`] when nothing arrives in time.
    pub fn receive_message(&self, timeout: Option<Duration>) -> Result<Message, ClientError> {
        self.wait(self.inner.receive_message(timeout))
    }

    /// Block until a method request arrives or `timeout` passes.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ReceiveTimeout`] when nothing arrives in time.
    pub fn receive_method_request(
        &self,
        method_name: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<MethodRequest, ClientError> {
        self.wait(self.inner.receive_method_request(method_name, timeout))
    }

    /// Answer a method request.
    ///
    /// # Errors
    ///
    /// Returns the send failure.
    pub fn send_method_response(&self, response: MethodResponse) -> Result<(), ClientError> {
        self.wait(self.inner.send_method_response(response))
    }

    /// Fetch the full twin document.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Pipeline`] when the service rejects the request.
    pub fn get_twin(&self) -> Result<Twin, ClientError> { self.wait(self.inner.get_twin()) }

    /// Patch the reported properties.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Pipeline`] when the service rejects the patch.
    pub fn patch_twin_reported_properties(&self, patch: Value) -> Result<(), ClientError> {
        self.wait(self.inner.patch_twin_reported_properties(patch))
    }

    /// Block until a desired-properties patch arrives or `timeout` passes.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ReceiveTimeout`] when nothing arrives in time.
    pub fn receive_twin_desired_properties_patch(
        &self,
        timeout: Option<Duration>,
    ) -> Result<TwinPatch, ClientError> {
        self.wait(self.inner.receive_twin_desired_properties_patch(timeout))
    }

    /// Set or clear the message handler.
    ///
    /// # Errors
    ///
    /// Returns the feature change failure.
    pub fn set_message_handler(
        &self,
        handler: Option<impl Fn(Message) + Send + Sync + 'static>,
    ) -> Result<(), ClientError> {
        self.wait(self.inner.install_message_handler(handler.map(Callback::blocking)))
    }

    /// Set or clear the method request handler.
    ///
    /// # Errors
    ///
    /// Returns the feature change failure.
    pub fn set_method_request_handler(
        &self,
        handler: Option<impl Fn(MethodRequest) + Send + Sync + 'static>,
    ) -> Result<(), ClientError> {
        self.wait(
            self.inner
                .install_method_request_handler(handler.map(Callback::blocking)),
        )
    }

    /// Set or clear the desired-properties patch handler.
    ///
    /// # Errors
    ///
    /// Returns the feature change failure.
    pub fn set_twin_desired_properties_patch_handler(
        &self,
        handler: Option<impl Fn(TwinPatch) + Send + Sync + 'static>,
    ) -> Result<(), ClientError> {
        self.wait(self.inner.install_twin_patch_handler(handler.map(Callback::blocking)))
    }

    /// Set or clear the connection state change handler.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Handler`] after shutdown.
    pub fn set_connection_state_change_handler(
        &self,
        handler: Option<impl Fn(ConnectionState) + Send + Sync + 'static>,
    ) -> Result<(), ClientError> {
        let core = self.inner.core();
        Ok(core
            .handlers
            .set_connection_state_change_handler(handler.map(Callback::blocking))?)
    }

    /// Set or clear the handler asked for a fresh SAS token.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Handler`] after shutdown.
    pub fn set_new_sastoken_required_handler(
        &self,
        handler: Option<impl Fn(()) + Send + Sync + 'static>,
    ) -> Result<(), ClientError> {
        let core = self.inner.core();
        Ok(core
            .handlers
            .set_new_sastoken_required_handler(handler.map(Callback::blocking))?)
    }

    /// Set or clear the background error handler.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Handler`] after shutdown.
    pub fn set_background_error_handler(
        &self,
        handler: Option<impl Fn(PipelineError) + Send + Sync + 'static>,
    ) -> Result<(), ClientError> {
        let core = self.inner.core();
        Ok(core
            .handlers
            .set_background_error_handler(handler.map(Callback::blocking))?)
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState { self.inner.connection_state() }

    /// Whether the client is connected.
    #[must_use]
    pub fn connected(&self) -> bool { self.inner.connected() }

    /// Receiver that observes every connection state change.
    #[must_use]
    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.watch_connection_state()
    }

    /// Disconnect and stop the pipeline.
    pub fn shutdown(&self) { self.wait(self.inner.shutdown()); }
}

/// Blocking counterpart of [`ProvisioningDeviceClient`].
pub struct SyncProvisioningDeviceClient {
    inner: ProvisioningDeviceClient,
    runtime: Runtime,
}

impl SyncProvisioningDeviceClient {
    /// See [`ProvisioningDeviceClient::create_from_symmetric_key`].
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the key or configuration is invalid, or
    /// the background runtime cannot start.
    pub fn create_from_symmetric_key(
        provisioning_host: &str,
        registration_id: &str,
        id_scope: &str,
        symmetric_key: &str,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let credential = credentials::registration_token(id_scope, registration_id, symmetric_key, &options)?;
        Self::start(provisioning_host, registration_id, id_scope, credential, &options)
    }

    /// See [`ProvisioningDeviceClient::create_from_x509_certificate`].
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the configuration is rejected or the
    /// background runtime cannot start.
    pub fn create_from_x509_certificate(
        provisioning_host: &str,
        registration_id: &str,
        id_scope: &str,
        x509: X509,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        Self::start(provisioning_host, registration_id, id_scope, Credential::X509(x509), &options)
    }

    fn start(
        provisioning_host: &str,
        registration_id: &str,
        id_scope: &str,
        credential: Credential,
        options: &ClientOptions,
    ) -> Result<Self, ClientError> {
        let runtime = background_runtime()?;
        let inner = ProvisioningDeviceClient::start(
            provisioning_host,
            registration_id,
            id_scope,
            credential,
            options,
            runtime.handle(),
        )?;
        Ok(Self { inner, runtime })
    }

    /// See [`ProvisioningDeviceClient::register`].
    ///
    /// # Errors
    ///
    /// Returns the registration failure.
    pub fn register(&self, payload: Option<Value>) -> Result<RegistrationResult, ClientError> {
        self.runtime.block_on(self.inner.register(payload))
    }

    /// Stop the pipeline.
    pub fn shutdown(&self) { self.runtime.block_on(self.inner.shutdown()); }
}
