//! Topic strings for the hub and provisioning services.
//!
//! Identifiers placed in a topic are percent-encoded with no characters
//! exempted. Query suffixes have the shape `key=value&key=value`.

pub(crate) mod hub;
pub(crate) mod provisioning;

use crate::error::PipelineError;

/// A topic string that does not have the expected shape.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub(crate) enum TopicError {
    #[error("topic has incorrect format: {0}")]
    Malformed(String),
    #[error("duplicate key '{0}' in topic")]
    DuplicateKey(String),
}

impl From<TopicError> for PipelineError {
    fn from(err: TopicError) -> Self { PipelineError::Protocol(err.to_string()) }
}

pub(crate) fn encode(value: &str) -> String { urlencoding::encode(value).into_owned() }

pub(crate) fn decode(value: &str) -> Result<String, TopicError> {
    urlencoding::decode(value)
        .map(std::borrow::Cow::into_owned)
        .map_err(|_| TopicError::Malformed(format!("invalid percent-encoding in '{value}'")))
}

/// Split a `key=value&key` suffix into decoded pairs. A key without `=` has
/// no value; anything after a second `=` is ignored.
pub(crate) fn parse_pairs(query: &str) -> Result<Vec<(String, Option<String>)>, TopicError> {
    query
        .split('&')
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let mut parts = entry.split('=');
            let key = decode(parts.next().unwrap_or_default())?;
            let value = parts.next().map(decode).transpose()?;
            Ok((key, value))
        })
        .collect()
}

/// Find `key` in a query suffix whose keys may carry a leading `$`.
pub(crate) fn query_value(query: &str, key: &str) -> Result<Option<String>, TopicError> {
    let mut found = None;
    for (name, value) in parse_pairs(query)? {
        if name.trim_start_matches('$') != key {
            continue;
        }
        if found.is_some() {
            return Err(TopicError::DuplicateKey(name));
        }
        found = Some(value.unwrap_or_default());
    }
    Ok(found)
}

fn encode_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    pairs
        .into_iter()
        .map(|(key, value)| format!("{}={}", encode(key), encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}
