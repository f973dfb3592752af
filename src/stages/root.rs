//! Top of the pipeline: hands events to the application.

use tracing::{debug, warn};

use crate::pipeline::{ClientEvent, Event, Inbound, Stage, StageContext};

/// Delivers events to the application's [`crate::pipeline::EventSink`].
#[derive(Debug, Default)]
pub(crate) struct RootStage;

impl Stage for RootStage {
    fn name(&self) -> &'static str { "root" }

    fn handle_event(&mut self, event: Event, ctx: &mut StageContext<'_>) {
        match event {
            Event::StateChanged(state) => debug!(%state, "state change reached the top"),
            Event::Connected | Event::Disconnected => debug!(event = event.name(), "transport state"),
            Event::Message(message) => ctx.nucleus().deliver(Inbound::Message(message)),
            Event::MethodRequest(request) => ctx.nucleus().deliver(Inbound::MethodRequest(request)),
            Event::TwinPatch(patch) => ctx.nucleus().deliver(Inbound::TwinPatch(patch)),
            Event::NewSasTokenRequired => ctx
                .nucleus()
                .deliver(Inbound::Client(ClientEvent::NewSasTokenRequired)),
            Event::IncomingMessage { topic, .. } => {
                warn!(%topic, "dropping message no stage claimed");
            }
            Event::Response { request_id, .. } => {
                warn!(%request_id, "dropping response no stage claimed");
            }
        }
    }
}
