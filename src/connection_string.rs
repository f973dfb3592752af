//! Parsing of `Key=Value;Key=Value` connection strings.

use std::{collections::BTreeMap, fmt, str::FromStr};

/// `HostName`
pub const HOST_NAME: &str = "HostName";
/// `SharedAccessKeyName`
pub const SHARED_ACCESS_KEY_NAME: &str = "SharedAccessKeyName";
/// `SharedAccessKey`
pub const SHARED_ACCESS_KEY: &str = "SharedAccessKey";
/// `SharedAccessSignature`
pub const SHARED_ACCESS_SIGNATURE: &str = "SharedAccessSignature";
/// `DeviceId`
pub const DEVICE_ID: &str = "DeviceId";
/// `ModuleId`
pub const MODULE_ID: &str = "ModuleId";
/// `GatewayHostName`
pub const GATEWAY_HOST_NAME: &str = "GatewayHostName";
/// `x509`
pub const X509: &str = "x509";

const VALID_KEYS: [&str; 8] = [
    HOST_NAME,
    SHARED_ACCESS_KEY_NAME,
    SHARED_ACCESS_KEY,
    SHARED_ACCESS_SIGNATURE,
    DEVICE_ID,
    MODULE_ID,
    GATEWAY_HOST_NAME,
    X509,
];

/// Reasons a connection string is rejected.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionStringError {
    /// Bad syntax, an unknown key or a duplicate key.
    #[error("unable to parse connection string: {0}")]
    Unparsable(String),
    /// Key-based and certificate authentication were both requested.
    #[error("mixed authentication scheme: SharedAccessKey and x509 are exclusive")]
    MixedAuthentication,
    /// A required key is missing.
    #[error("connection string is incomplete")]
    Incomplete,
}

/// A validated connection string.
///
/// ```
/// use hubwire::connection_string::{ConnectionString, DEVICE_ID};
///
/// let cs: ConnectionString = "HostName=hub.example.net;DeviceId=dev;SharedAccessKey=Zm9vYmFy"
///     .parse()
///     .expect("valid connection string");
/// assert_eq!(cs.get(DEVICE_ID), Some("dev"));
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    original: String,
    fields: BTreeMap<String, String>,
}

impl ConnectionString {
    /// Value for `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> { self.fields.get(key).map(String::as_str) }

    /// Whether `x509=true` was supplied.
    #[must_use]
    pub fn uses_x509(&self) -> bool {
        self.get(X509).is_some_and(|value| value.eq_ignore_ascii_case("true"))
    }
}

impl FromStr for ConnectionString {
    type Err = ConnectionStringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = BTreeMap::new();
        for pair in s.split(';') {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ConnectionStringError::Unparsable(format!("invalid pair '{pair}'")))?;
            if !VALID_KEYS.contains(&key) {
                return Err(ConnectionStringError::Unparsable(format!("invalid key '{key}'")));
            }
            if fields.insert(key.to_owned(), value.to_owned()).is_some() {
                return Err(ConnectionStringError::Unparsable(format!("duplicate key '{key}'")));
            }
        }
        let parsed = Self {
            original: s.to_owned(),
            fields,
        };
        parsed.validate()?;
        Ok(parsed)
    }
}

impl ConnectionString {
    fn validate(&self) -> Result<(), ConnectionStringError> {
        let has = |key: &str| self.fields.contains_key(key);
        if has(SHARED_ACCESS_KEY) && self.uses_x509() {
            return Err(ConnectionStringError::MixedAuthentication);
        }
        let device = has(HOST_NAME)
            && has(DEVICE_ID)
            && (has(SHARED_ACCESS_KEY) || has(SHARED_ACCESS_SIGNATURE) || self.uses_x509());
        let service = has(HOST_NAME) && has(SHARED_ACCESS_KEY) && has(SHARED_ACCESS_KEY_NAME);
        if device || service {
            Ok(())
        } else {
            Err(ConnectionStringError::Incomplete)
        }
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.original) }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.fields {
            if key == SHARED_ACCESS_KEY || key == SHARED_ACCESS_SIGNATURE {
                map.entry(key, &"<redacted>");
            } else {
                map.entry(key, value);
            }
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::device_key("HostName=h;DeviceId=d;SharedAccessKey=k")]
    #[case::module_key("HostName=h;DeviceId=d;ModuleId=m;SharedAccessKey=k")]
    #[case::gateway("HostName=h;DeviceId=d;SharedAccessKey=k;GatewayHostName=g")]
    #[case::device_x509("HostName=h;DeviceId=d;x509=true")]
    #[case::signature("HostName=h;DeviceId=d;SharedAccessSignature=SharedAccessSignature sr=a&sig=b&se=1")]
    #[case::service("HostName=h;SharedAccessKeyName=owner;SharedAccessKey=k")]
    fn accepts_valid_shapes(#[case] input: &str) {
        let parsed: ConnectionString = input.parse().expect("valid connection string");
        assert_eq!(parsed.to_string(), input);
    }

    #[test]
    fn value_may_contain_equals() {
        let parsed: ConnectionString = "HostName=h;DeviceId=d;SharedAccessKey=Zm9v=="
            .parse()
            .expect("valid connection string");
        assert_eq!(parsed.get(SHARED_ACCESS_KEY), Some("Zm9v=="));
    }

    #[rstest]
    #[case::duplicate("HostName=h;HostName=i;DeviceId=d;SharedAccessKey=k")]
    #[case::unknown_key("HostName=h;DeviceId=d;SharedAccessKey=k;Colour=blue")]
    #[case::missing_equals("HostName=h;DeviceId;SharedAccessKey=k")]
    #[case::trailing_separator("HostName=h;DeviceId=d;SharedAccessKey=k;")]
    fn rejects_unparsable(#[case] input: &str) {
        assert!(matches!(
            input.parse::<ConnectionString>(),
            Err(ConnectionStringError::Unparsable(_))
        ));
    }

    #[test]
    fn rejects_mixed_authentication() {
        assert_eq!(
            "HostName=h;DeviceId=d;SharedAccessKey=k;x509=true".parse::<ConnectionString>(),
            Err(ConnectionStringError::MixedAuthentication)
        );
    }

    #[rstest]
    #[case::no_credential("HostName=h;DeviceId=d")]
    #[case::no_host("DeviceId=d;SharedAccessKey=k")]
    #[case::key_name_only("HostName=h;SharedAccessKeyName=owner")]
    fn rejects_incomplete(#[case] input: &str) {
        assert_eq!(
            input.parse::<ConnectionString>(),
            Err(ConnectionStringError::Incomplete)
        );
    }

    #[test]
    fn debug_redacts_keys() {
        let parsed: ConnectionString = "HostName=h;DeviceId=d;SharedAccessKey=secret"
            .parse()
            .expect("valid connection string");
        assert!(!format!("{parsed:?}").contains("secret"));
    }
}
