//! State shared by every client personality.

use std::{collections::HashSet, sync::Arc, time::Duration};

use tokio::{runtime::Handle, sync::Mutex};
use tracing::{debug, info, warn};

use super::{ClientError, ClientOptions, credentials::Target};
use crate::{
    config::{Identity, PipelineConfig},
    handler::{HandlerKind, HandlerManager},
    inbox::{Inbox, InboxEmpty, InboxManager},
    pipeline::{self, ClientEvent, Feature, OpKind, OpOutput, PipelineHandle, PipelineKind},
    transport::TransportFactory,
};

/// One pipeline, its inboxes and the handlers draining them.
pub(crate) struct ClientCore {
    pub(crate) handle: PipelineHandle,
    pub(crate) inboxes: Arc<InboxManager>,
    pub(crate) handlers: HandlerManager,
    config: Arc<PipelineConfig>,
    features: Mutex<HashSet<Feature>>,
}

impl ClientCore {
    /// Assemble a pipeline for `target`, run its context on `runtime` and
    /// submit the initial operation.
    pub(crate) fn start(
        kind: PipelineKind,
        target: Target,
        options: &ClientOptions,
        runtime: &Handle,
    ) -> Result<Self, ClientError> {
        let config = Arc::new(target.builder(options).build()?);
        let factory = transport_factory(options)?;
        let inboxes = Arc::new(InboxManager::new());
        let (handle, context) = pipeline::assemble(kind, Arc::clone(&config), factory, inboxes.clone());
        runtime.spawn(context.run());

        let events = inboxes.client_event_inbox();
        handle.run_with_callback(OpKind::Initialize, move |result| {
            if let Err(err) = result {
                warn!(error = %err, "pipeline initialisation failed");
                events.put(ClientEvent::BackgroundError(err));
            }
        });
        info!(hostname = %config.hostname(), identity = ?config.identity(), "client started");

        Ok(Self {
            handle,
            handlers: HandlerManager::new(inboxes.clone(), runtime.clone()),
            inboxes,
            config,
            features: Mutex::new(HashSet::new()),
        })
    }

    pub(crate) fn is_module(&self) -> bool {
        matches!(self.config.identity(), Identity::Device { module_id: Some(_), .. })
    }

    /// Feature that feeds the message inbox for this identity.
    pub(crate) fn message_feature(&self) -> Feature {
        if self.is_module() {
            Feature::InputMessages
        } else {
            Feature::C2dMessages
        }
    }

    pub(crate) async fn run(&self, kind: OpKind) -> Result<OpOutput, ClientError> {
        Ok(self.handle.run(kind).await?)
    }

    pub(crate) async fn run_done(&self, kind: OpKind) -> Result<(), ClientError> {
        let name = kind.name();
        match self.run(kind).await? {
            OpOutput::Done => Ok(()),
            _ => Err(ClientError::UnexpectedOutput(name)),
        }
    }

    /// Enable `feature` unless an earlier call already did.
    pub(crate) async fn enable_feature(&self, feature: Feature) -> Result<(), ClientError> {
        let mut enabled = self.features.lock().await;
        if enabled.contains(&feature) {
            return Ok(());
        }
        self.run_done(OpKind::EnableFeature(feature)).await?;
        enabled.insert(feature);
        debug!(%feature, "feature enabled");
        Ok(())
    }

    pub(crate) async fn disable_feature(&self, feature: Feature) -> Result<(), ClientError> {
        let mut enabled = self.features.lock().await;
        if !enabled.contains(&feature) {
            return Ok(());
        }
        self.run_done(OpKind::DisableFeature(feature)).await?;
        enabled.remove(&feature);
        debug!(%feature, "feature disabled");
        Ok(())
    }

    /// Take the next item from `inbox` unless a `kind` handler owns it.
    pub(crate) async fn receive<T>(
        &self,
        kind: HandlerKind,
        inbox: Inbox<T>,
        timeout: Option<Duration>,
    ) -> Result<T, ClientError> {
        self.handlers.ensure_receivable(kind)?;
        inbox
            .get(timeout)
            .await
            .map_err(|InboxEmpty| ClientError::ReceiveTimeout(timeout.unwrap_or_default()))
    }

    /// Disconnect, stop the handlers and stop the pipeline.
    ///
    /// A failed disconnect is logged; shutdown continues regardless.
    pub(crate) async fn shutdown(&self) {
        if let Err(err) = self.run_done(OpKind::Disconnect).await {
            warn!(error = %err, "disconnect during shutdown failed");
        }
        self.handlers.shutdown().await;
        self.handle.shutdown();
        info!("client shut down");
    }
}

fn transport_factory(options: &ClientOptions) -> Result<Arc<dyn TransportFactory>, ClientError> {
    if let Some(factory) = &options.transport {
        return Ok(Arc::clone(factory));
    }
    #[cfg(feature = "mqtt")]
    {
        Ok(Arc::new(crate::transport::mqtt::MqttTransportFactory))
    }
    #[cfg(not(feature = "mqtt"))]
    {
        Err(ClientError::InvalidArgument(
            "no transport configured; enable the `mqtt` feature or supply one".into(),
        ))
    }
}
