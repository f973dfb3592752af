//! Application-facing clients.
//!
//! Two personalities sit on the same pipeline. [`DeviceClient`] and
//! [`ProvisioningDeviceClient`] expose `async fn` operations and run on the
//! caller's tokio runtime. [`SyncDeviceClient`] and
//! [`SyncProvisioningDeviceClient`] block the calling thread and run the
//! pipeline on a runtime of their own.
//!
//! Every client submits operations to its pipeline and waits for their
//! completion. Inbound messages, method requests and twin patches land in
//! inboxes, from which the application either receives directly or lets a
//! registered handler drain them.

mod blocking;
mod credentials;
mod device;
mod error;
mod options;
mod provisioning;
mod shared;

pub use blocking::{SyncDeviceClient, SyncProvisioningDeviceClient};
pub use device::DeviceClient;
pub use error::ClientError;
pub use options::ClientOptions;
pub use provisioning::ProvisioningDeviceClient;
pub(crate) use shared::ClientCore;

#[cfg(test)]
mod tests;
