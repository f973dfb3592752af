//! Application-facing data carried through the pipeline.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A full device twin document.
pub type Twin = Value;

/// A desired-properties patch.
pub type TwinPatch = Value;

/// Telemetry sent to, or a message received from, the hub.
///
/// Custom properties are kept sorted so their wire encoding is stable.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    /// Message body.
    pub data: Bytes,
    /// `$.mid`
    pub message_id: Option<String>,
    /// `$.cid`
    pub correlation_id: Option<String>,
    /// `$.uid`
    pub user_id: Option<String>,
    /// `$.ct`
    pub content_type: Option<String>,
    /// `$.ce`
    pub content_encoding: Option<String>,
    /// `$.exp`, as an ISO-8601 timestamp.
    pub expiry_time_utc: Option<String>,
    /// `$.ifid`
    pub interface_id: Option<String>,
    /// Output the message is sent to (modules only).
    pub output_name: Option<String>,
    /// Input the message arrived on (modules only).
    pub input_name: Option<String>,
    /// Application properties. Received properties without a value map to an
    /// empty string.
    pub custom_properties: BTreeMap<String, String>,
}

impl Message {
    /// Build a message carrying `data`.
    ///
    /// ```
    /// use hubwire::Message;
    ///
    /// let msg = Message::new("hello").with_property("level", "info");
    /// assert_eq!(&msg.data[..], b"hello");
    /// assert_eq!(msg.custom_properties["level"], "info");
    /// ```
    #[must_use]
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    /// Attach a custom application property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_properties.insert(key.into(), value.into());
        self
    }

    /// Set the message id.
    #[must_use]
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Set the content type and encoding.
    #[must_use]
    pub fn with_content(mut self, content_type: impl Into<String>, encoding: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self.content_encoding = Some(encoding.into());
        self
    }
}

/// A direct method invocation received from the service.
#[derive(Clone, Debug, PartialEq)]
pub struct MethodRequest {
    /// Correlation id to echo in the response.
    pub request_id: String,
    /// Method name.
    pub name: String,
    /// JSON payload, if any.
    pub payload: Option<Value>,
}

/// Response to a [`MethodRequest`].
#[derive(Clone, Debug, PartialEq)]
pub struct MethodResponse {
    /// Id of the request being answered.
    pub request_id: String,
    /// Application status code.
    pub status: u16,
    /// JSON payload, if any.
    pub payload: Option<Value>,
}

impl MethodResponse {
    /// Build a response for `request`.
    #[must_use]
    pub fn for_request(request: &MethodRequest, status: u16, payload: Option<Value>) -> Self {
        Self {
            request_id: request.request_id.clone(),
            status,
            payload,
        }
    }
}

/// Outcome of a provisioning registration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResult {
    /// Provisioning operation id.
    pub operation_id: String,
    /// `assigning`, `assigned` or `failed`.
    pub status: String,
    /// Assignment details once the registration has settled.
    #[serde(default)]
    pub registration_state: Option<RegistrationState>,
}

/// Details of a settled registration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationState {
    /// Device id assigned by the service.
    #[serde(default)]
    pub device_id: Option<String>,
    /// Hub the device was assigned to.
    #[serde(default)]
    pub assigned_hub: Option<String>,
    /// Reason for the assignment outcome.
    #[serde(default)]
    pub substatus: Option<String>,
    /// Creation timestamp.
    #[serde(default)]
    pub created_date_time_utc: Option<String>,
    /// Last update timestamp.
    #[serde(default)]
    pub last_updated_date_time_utc: Option<String>,
    /// Entity tag.
    #[serde(default)]
    pub etag: Option<String>,
    /// Custom payload returned by the service.
    #[serde(default)]
    pub payload: Option<Value>,
}
