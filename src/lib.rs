#![doc(html_root_url = "https://docs.rs/hubwire/latest")]
//! Public API for the `hubwire` library.
//!
//! `hubwire` keeps a long-lived, authenticated MQTT connection to an IoT hub
//! or provisioning service and exposes it through blocking and async clients.
//! Every client call becomes an operation that travels down a chain of
//! pipeline stages (token renewal, twin and request/response correlation,
//! topic translation, connection management, retries and timeouts) to a
//! transport. Inbound traffic travels back up the same chain into inboxes or
//! application handlers.

pub mod auth;
pub mod backoff;
pub mod client;
pub mod clock;
pub mod config;
pub mod connection_string;
pub mod error;
pub mod handler;
pub mod inbox;
pub mod metrics;
pub mod models;
pub mod panic;
pub mod pipeline;
pub mod retry;
mod stages;
pub mod timer;
mod topic;
pub mod transport;

pub use client::{
    ClientError,
    ClientOptions,
    DeviceClient,
    ProvisioningDeviceClient,
    SyncDeviceClient,
    SyncProvisioningDeviceClient,
};
pub use error::{ErrorClass, PipelineError, TransportError};
pub use models::{Message, MethodRequest, MethodResponse, RegistrationResult, Twin, TwinPatch};
pub use pipeline::{ClientEvent, ConnectionState, Feature};
