//! Hub topics for telemetry, messages, methods and twins.

use bytes::Bytes;

use super::{TopicError, decode, encode, encode_pairs, parse_pairs, query_value};
use crate::models::Message;

pub(crate) const METHOD_SUBSCRIBE: &str = "$iothub/methods/POST/#";
pub(crate) const TWIN_RESPONSE_SUBSCRIBE: &str = "$iothub/twin/res/#";
pub(crate) const TWIN_PATCH_SUBSCRIBE: &str = "$iothub/twin/PATCH/properties/desired/#";

const METHOD_PREFIX: &str = "$iothub/methods/POST/";
const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
const TWIN_PATCH_PREFIX: &str = "$iothub/twin/PATCH/properties/desired";

/// Topics addressed to one device or module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct HubTopics {
    device_base: String,
    base: String,
    is_module: bool,
}

impl HubTopics {
    pub(crate) fn new(device_id: &str, module_id: Option<&str>) -> Self {
        let device_base = format!("devices/{}", encode(device_id));
        let base = match module_id {
            Some(module_id) => format!("{device_base}/modules/{}", encode(module_id)),
            None => device_base.clone(),
        };
        Self {
            device_base,
            base,
            is_module: module_id.is_some(),
        }
    }

    pub(crate) fn is_module(&self) -> bool { self.is_module }

    pub(crate) fn c2d_subscribe(&self) -> String { format!("{}/messages/devicebound/#", self.device_base) }

    pub(crate) fn input_subscribe(&self) -> Option<String> {
        self.is_module.then(|| format!("{}/inputs/#", self.base))
    }

    /// Publish topic for `message`, with its system and custom properties
    /// encoded into the suffix.
    pub(crate) fn telemetry(&self, message: &Message) -> String {
        let system = [
            ("$.on", message.output_name.as_deref()),
            ("$.mid", message.message_id.as_deref()),
            ("$.cid", message.correlation_id.as_deref()),
            ("$.uid", message.user_id.as_deref()),
            ("$.ct", message.content_type.as_deref()),
            ("$.ce", message.content_encoding.as_deref()),
            ("$.ifid", message.interface_id.as_deref()),
            ("$.exp", message.expiry_time_utc.as_deref()),
        ];
        let system = encode_pairs(
            system
                .into_iter()
                .filter_map(|(key, value)| value.map(|value| (key, value))),
        );
        let custom = encode_pairs(
            message
                .custom_properties
                .iter()
                .map(|(key, value)| (key.as_str(), value.as_str())),
        );
        let separator = if system.is_empty() || custom.is_empty() { "" } else { "&" };
        format!("{}/messages/events/{system}{separator}{custom}", self.base)
    }

    pub(crate) fn is_c2d(&self, topic: &str) -> bool {
        topic.starts_with(&format!("{}/messages/devicebound", self.device_base))
    }

    pub(crate) fn is_input(&self, topic: &str) -> bool {
        self.is_module && topic.starts_with(&format!("{}/inputs/", self.base))
    }

    /// Build the message carried by a cloud-to-device topic.
    pub(crate) fn parse_c2d(&self, topic: &str, payload: Bytes) -> Result<Message, TopicError> {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.get(3) != Some(&"devicebound") {
            return Err(TopicError::Malformed(topic.to_owned()));
        }
        let mut message = Message::new(payload);
        apply_properties(&mut message, parts.get(4).copied())?;
        Ok(message)
    }

    /// Build the message carried by a module input topic.
    pub(crate) fn parse_input(&self, topic: &str, payload: Bytes) -> Result<Message, TopicError> {
        let parts: Vec<&str> = topic.split('/').collect();
        let (Some(&"inputs"), Some(name)) = (parts.get(4), parts.get(5)) else {
            return Err(TopicError::Malformed(topic.to_owned()));
        };
        let mut message = Message::new(payload);
        message.input_name = Some(decode(name)?);
        apply_properties(&mut message, parts.get(6).copied())?;
        Ok(message)
    }
}

fn apply_properties(message: &mut Message, properties: Option<&str>) -> Result<(), TopicError> {
    let Some(properties) = properties else {
        return Ok(());
    };
    for (key, value) in parse_pairs(properties)? {
        match key.as_str() {
            "$.to" | "iothub-ack" => {}
            "$.mid" => message.message_id = value,
            "$.cid" => message.correlation_id = value,
            "$.uid" => message.user_id = value,
            "$.ct" => message.content_type = value,
            "$.ce" => message.content_encoding = value,
            "$.exp" => message.expiry_time_utc = value,
            _ => {
                message
                    .custom_properties
                    .insert(key, value.unwrap_or_default());
            }
        }
    }
    Ok(())
}

pub(crate) fn method_response(request_id: &str, status: u16) -> String {
    format!("$iothub/methods/res/{status}/?$rid={}", encode(request_id))
}

pub(crate) fn twin_request(method: &str, resource_location: &str, request_id: &str) -> String {
    format!("$iothub/twin/{method}{resource_location}?$rid={}", encode(request_id))
}

pub(crate) fn is_method_request(topic: &str) -> bool { topic.starts_with(METHOD_PREFIX) }

/// Method name and request id of a method request topic.
pub(crate) fn parse_method_request(topic: &str) -> Result<(String, String), TopicError> {
    let malformed = || TopicError::Malformed(topic.to_owned());
    let rest = topic.strip_prefix(METHOD_PREFIX).ok_or_else(malformed)?;
    let (path, query) = rest.split_once('?').ok_or_else(malformed)?;
    let name = path.split('/').next().filter(|name| !name.is_empty()).ok_or_else(malformed)?;
    let request_id = query_value(query, "rid")?.ok_or_else(malformed)?;
    Ok((decode(name)?, request_id))
}

pub(crate) fn is_twin_response(topic: &str) -> bool { topic.starts_with(TWIN_RESPONSE_PREFIX) }

/// Status code and request id of a twin response topic.
pub(crate) fn parse_twin_response(topic: &str) -> Result<(u16, String), TopicError> {
    let malformed = || TopicError::Malformed(topic.to_owned());
    let rest = topic.strip_prefix(TWIN_RESPONSE_PREFIX).ok_or_else(malformed)?;
    let (path, query) = rest.split_once('?').ok_or_else(malformed)?;
    let status = decode(path.trim_end_matches('/'))?
        .parse::<u16>()
        .map_err(|_| malformed())?;
    let request_id = query_value(query, "rid")?.ok_or_else(malformed)?;
    Ok((status, request_id))
}

pub(crate) fn is_twin_patch(topic: &str) -> bool { topic.starts_with(TWIN_PATCH_PREFIX) }
