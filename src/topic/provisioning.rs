//! Provisioning service topics.

use std::time::Duration;

use super::{TopicError, decode, encode, parse_pairs};

pub(crate) const RESPONSE_SUBSCRIBE: &str = "$dps/registrations/res/#";

const RESPONSE_PREFIX: &str = "$dps/registrations/res/";

pub(crate) fn register(request_id: &str) -> String {
    format!("$dps/registrations/PUT/iotdps-register/?$rid={}", encode(request_id))
}

pub(crate) fn query(request_id: &str, operation_id: &str) -> String {
    format!(
        "$dps/registrations/GET/iotdps-get-operationstatus/?$rid={}&operationId={}",
        encode(request_id),
        encode(operation_id)
    )
}

pub(crate) fn is_response(topic: &str) -> bool { topic.starts_with(RESPONSE_PREFIX) }

/// Fields carried by a provisioning response topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ResponseTopic {
    pub(crate) status: u16,
    pub(crate) request_id: String,
    pub(crate) retry_after: Option<Duration>,
}

/// Parse `$dps/registrations/res/<status>/?$rid=<rid>[&retry-after=<secs>]`.
pub(crate) fn parse_response(topic: &str) -> Result<ResponseTopic, TopicError> {
    let malformed = || TopicError::Malformed(topic.to_owned());
    let rest = topic.strip_prefix(RESPONSE_PREFIX).ok_or_else(malformed)?;
    let (path, query) = rest.split_once('?').ok_or_else(malformed)?;
    let status = decode(path.trim_end_matches('/'))?
        .parse::<u16>()
        .map_err(|_| malformed())?;
    let mut request_id = None;
    let mut retry_after = None;
    let mut seen = Vec::new();
    for (key, value) in parse_pairs(query)? {
        let key = key.trim_start_matches('$').to_owned();
        if seen.contains(&key) {
            return Err(TopicError::DuplicateKey(key));
        }
        match key.as_str() {
            "rid" => request_id = value,
            "retry-after" => {
                retry_after = value
                    .as_deref()
                    .and_then(|secs| secs.parse::<u64>().ok())
                    .map(Duration::from_secs);
            }
            _ => {}
        }
        seen.push(key);
    }
    Ok(ResponseTopic {
        status,
        request_id: request_id.ok_or_else(malformed)?,
        retry_after,
    })
}
