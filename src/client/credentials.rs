//! Turning connection strings, tokens and certificates into pipeline settings.

use std::sync::Arc;

use crate::{
    auth::{NonRenewableSasToken, RenewableSasToken, SharedSasToken, SymmetricKeySigner},
    config::{Credential, Identity, PipelineConfig, PipelineConfigBuilder, X509},
    connection_string::{
        ConnectionString,
        ConnectionStringError,
        DEVICE_ID,
        GATEWAY_HOST_NAME,
        HOST_NAME,
        MODULE_ID,
        SHARED_ACCESS_KEY,
        SHARED_ACCESS_KEY_NAME,
        SHARED_ACCESS_SIGNATURE,
    },
};

use super::{ClientError, ClientOptions};

/// Key name the provisioning service expects on symmetric-key tokens.
const REGISTRATION_KEY_NAME: &str = "registration";

/// Where a client connects and how it authenticates.
#[derive(Debug)]
pub(crate) struct Target {
    pub(crate) hostname: String,
    pub(crate) gateway_hostname: Option<String>,
    pub(crate) identity: Identity,
    pub(crate) credential: Credential,
}

impl Target {
    /// Start a config builder for this target. `options` are applied after
    /// the target's own gateway so an explicit option wins.
    pub(crate) fn builder(self, options: &ClientOptions) -> PipelineConfigBuilder {
        let mut builder = PipelineConfig::builder(self.hostname, self.identity, self.credential);
        if let Some(gateway) = self.gateway_hostname {
            builder = builder.gateway_hostname(gateway);
        }
        options.apply(builder)
    }
}

/// Resource URI a device or module token is scoped to.
pub(crate) fn device_uri(hostname: &str, device_id: &str, module_id: Option<&str>) -> String {
    match module_id {
        Some(module) => format!("{hostname}/devices/{device_id}/modules/{module}"),
        None => format!("{hostname}/devices/{device_id}"),
    }
}

/// Resource URI a registration token is scoped to.
pub(crate) fn registration_uri(id_scope: &str, registration_id: &str) -> String {
    format!("{id_scope}/registrations/{registration_id}")
}

/// Target described by a device or module connection string.
///
/// A shared access key yields a self-renewing token; an embedded signature
/// yields a fixed one.
pub(crate) fn from_connection_string(raw: &str, options: &ClientOptions) -> Result<Target, ClientError> {
    let cs: ConnectionString = raw.parse()?;
    if cs.uses_x509() {
        return Err(ClientError::InvalidArgument(
            "x509 connection strings carry no credential; create the client from the certificate".into(),
        ));
    }
    let hostname = cs.get(HOST_NAME).ok_or(ConnectionStringError::Incomplete)?;
    let device_id = cs.get(DEVICE_ID).ok_or(ConnectionStringError::Incomplete)?;
    let module_id = cs.get(MODULE_ID);

    let token = if let Some(key) = cs.get(SHARED_ACCESS_KEY) {
        let signer = SymmetricKeySigner::new(key)?;
        SharedSasToken::new(RenewableSasToken::with_clock(
            device_uri(hostname, device_id, module_id),
            Arc::new(signer),
            cs.get(SHARED_ACCESS_KEY_NAME).map(str::to_owned),
            options.sastoken_ttl_secs(),
            Arc::clone(&options.clock),
        )?)
    } else {
        let signature = cs
            .get(SHARED_ACCESS_SIGNATURE)
            .ok_or(ConnectionStringError::Incomplete)?;
        SharedSasToken::new(NonRenewableSasToken::parse(signature)?)
    };

    Ok(Target {
        hostname: hostname.to_owned(),
        gateway_hostname: cs.get(GATEWAY_HOST_NAME).map(str::to_owned),
        identity: Identity::Device {
            device_id: device_id.to_owned(),
            module_id: module_id.map(str::to_owned),
        },
        credential: Credential::SasToken(token),
    })
}

/// Target described by a ready-made SAS token.
///
/// Hostname, device and module are read back from the token's resource URI,
/// which must have the form `host/devices/<device>[/modules/<module>]`.
pub(crate) fn from_sastoken(raw: &str) -> Result<Target, ClientError> {
    let token = NonRenewableSasToken::parse(raw)?;
    let invalid = || {
        ClientError::InvalidArgument(format!(
            "token resource uri '{}' does not name a device",
            token.resource_uri()
        ))
    };
    let parts: Vec<&str> = token.resource_uri().split('/').collect();
    let (hostname, device_id, module_id) = match parts.as_slice() {
        [host, "devices", device] => (*host, *device, None),
        [host, "devices", device, "modules", module] => (*host, *device, Some(*module)),
        _ => return Err(invalid()),
    };
    if [hostname, device_id].iter().chain(module_id.iter()).any(|part| part.is_empty()) {
        return Err(invalid());
    }
    Ok(Target {
        hostname: hostname.to_owned(),
        gateway_hostname: None,
        identity: Identity::Device {
            device_id: device_id.to_owned(),
            module_id: module_id.map(str::to_owned),
        },
        credential: Credential::SasToken(SharedSasToken::new(token)),
    })
}

/// Target for a device or module authenticating with a certificate.
pub(crate) fn from_x509(hostname: &str, device_id: &str, module_id: Option<&str>, x509: X509) -> Target {
    Target {
        hostname: hostname.to_owned(),
        gateway_hostname: None,
        identity: Identity::Device {
            device_id: device_id.to_owned(),
            module_id: module_id.map(str::to_owned),
        },
        credential: Credential::X509(x509),
    }
}

/// Target for a provisioning registration.
pub(crate) fn registration(
    provisioning_host: &str,
    id_scope: &str,
    registration_id: &str,
    credential: Credential,
) -> Target {
    Target {
        hostname: provisioning_host.to_owned(),
        gateway_hostname: None,
        identity: Identity::Registration {
            id_scope: id_scope.to_owned(),
            registration_id: registration_id.to_owned(),
        },
        credential,
    }
}

/// Self-renewing registration token signed with `symmetric_key`.
pub(crate) fn registration_token(
    id_scope: &str,
    registration_id: &str,
    symmetric_key: &str,
    options: &ClientOptions,
) -> Result<Credential, ClientError> {
    let signer = SymmetricKeySigner::new(symmetric_key)?;
    let token = RenewableSasToken::with_clock(
        registration_uri(id_scope, registration_id),
        Arc::new(signer),
        Some(REGISTRATION_KEY_NAME.to_owned()),
        options.sastoken_ttl_secs(),
        Arc::clone(&options.clock),
    )?;
    Ok(Credential::SasToken(SharedSasToken::new(token)))
}
