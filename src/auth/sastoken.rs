//! Shared access signature (SAS) tokens.
//!
//! A token authorises access to a resource URI until its expiry:
//!
//! ```text
//! SharedAccessSignature sr=<uri>&sig=<signature>&se=<expiry>[&skn=<keyname>]
//! ```
//!
//! [`RenewableSasToken`] signs its own tokens and can be refreshed.
//! [`NonRenewableSasToken`] wraps a token string supplied by the application.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use base64::{Engine as _, engine::general_purpose::STANDARD};

use super::signing::{SigningError, SigningMechanism};
use crate::clock::{Clock, SystemClock};

/// Default token lifetime in seconds.
pub const DEFAULT_TOKEN_TTL: u64 = 3600;

const TOKEN_PREFIX: &str = "SharedAccessSignature ";
const REQUIRED_FIELDS: [&str; 3] = ["sr", "sig", "se"];
const OPTIONAL_FIELDS: [&str; 1] = ["skn"];

/// Errors creating, refreshing or parsing SAS tokens.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SasTokenError {
    /// The signing mechanism failed.
    #[error("unable to build SAS token: {0}")]
    Signing(#[from] SigningError),
    /// The token string is not a SAS token.
    #[error("invalid SAS token string: {0}")]
    Malformed(String),
    /// One or more of `sr`, `sig`, `se` is absent.
    #[error("invalid SAS token string: missing required fields {0:?}")]
    MissingFields(Vec<String>),
    /// Fields other than `sr`, `sig`, `se`, `skn` are present.
    #[error("invalid SAS token string: unexpected fields {0:?}")]
    UnexpectedFields(Vec<String>),
    /// The token cannot be regenerated locally.
    #[error("SAS token cannot be refreshed; a new token must be supplied")]
    NotRenewable,
    /// The renewal margin is not shorter than the token lifetime.
    #[error("renewal margin of {margin}s must be shorter than the token lifetime of {ttl}s")]
    MarginTooLarge {
        /// Token lifetime in seconds.
        ttl: u64,
        /// Requested renewal margin in seconds.
        margin: u64,
    },
}

/// Token string and the expiry it was built for.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Signed {
    expiry: u64,
    token: String,
}

/// Self-signing SAS token.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use hubwire::auth::{RenewableSasToken, SymmetricKeySigner};
///
/// let signer = SymmetricKeySigner::new("Zm9vYmFy").expect("valid key");
/// let token = RenewableSasToken::new("my.host.name", Arc::new(signer), None, 3600)
///     .expect("token");
/// assert!(token.to_string().starts_with("SharedAccessSignature sr=my.host.name&sig="));
/// ```
pub struct RenewableSasToken {
    uri: String,
    signer: Arc<dyn SigningMechanism>,
    key_name: Option<String>,
    ttl: u64,
    clock: Arc<dyn Clock>,
    signed: Signed,
}

impl RenewableSasToken {
    /// Build and sign a token valid for `ttl` seconds.
    ///
    /// # Errors
    ///
    /// Returns [`SasTokenError::Signing`] when signing fails.
    pub fn new(
        uri: impl Into<String>,
        signer: Arc<dyn SigningMechanism>,
        key_name: Option<String>,
        ttl: u64,
    ) -> Result<Self, SasTokenError> {
        Self::with_clock(uri, signer, key_name, ttl, Arc::new(SystemClock))
    }

    /// Like [`RenewableSasToken::new`] with an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns [`SasTokenError::Signing`] when signing fails.
    pub fn with_clock(
        uri: impl Into<String>,
        signer: Arc<dyn SigningMechanism>,
        key_name: Option<String>,
        ttl: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SasTokenError> {
        let uri = uri.into();
        let signed = sign(&uri, signer.as_ref(), key_name.as_deref(), ttl, clock.as_ref())?;
        Ok(Self {
            uri,
            signer,
            key_name,
            ttl,
            clock,
            signed,
        })
    }

    /// Regenerate the token with a fresh expiry.
    ///
    /// The old token is kept intact if signing fails.
    ///
    /// # Errors
    ///
    /// Returns [`SasTokenError::Signing`] when signing fails.
    pub fn refresh(&mut self) -> Result<(), SasTokenError> {
        self.signed = sign(
            &self.uri,
            self.signer.as_ref(),
            self.key_name.as_deref(),
            self.ttl,
            self.clock.as_ref(),
        )?;
        Ok(())
    }

    /// Expiry in seconds since the Unix epoch.
    #[must_use]
    pub fn expiry_time(&self) -> u64 { self.signed.expiry }

    /// Lifetime of each generated token in seconds.
    #[must_use]
    pub fn ttl(&self) -> u64 { self.ttl }

    /// Resource URI the token grants access to (not percent-encoded).
    #[must_use]
    pub fn resource_uri(&self) -> &str { &self.uri }

    /// Optional shared access key name.
    #[must_use]
    pub fn key_name(&self) -> Option<&str> { self.key_name.as_deref() }
}

impl fmt::Display for RenewableSasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.signed.token) }
}

impl fmt::Debug for RenewableSasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenewableSasToken")
            .field("uri", &self.uri)
            .field("key_name", &self.key_name)
            .field("ttl", &self.ttl)
            .field("expiry", &self.signed.expiry)
            .finish_non_exhaustive()
    }
}

fn sign(
    uri: &str,
    signer: &dyn SigningMechanism,
    key_name: Option<&str>,
    ttl: u64,
    clock: &dyn Clock,
) -> Result<Signed, SasTokenError> {
    let expiry = clock.now_epoch_secs().saturating_add(ttl);
    let encoded_uri = urlencoding::encode(uri);
    let message = format!("{encoded_uri}\n{expiry}");
    let signature = STANDARD.encode(signer.sign(message.as_bytes())?);
    let mut token = format!(
        "{TOKEN_PREFIX}sr={encoded_uri}&sig={}&se={expiry}",
        urlencoding::encode(&signature)
    );
    if let Some(name) = key_name {
        token.push_str("&skn=");
        token.push_str(name);
    }
    Ok(Signed { expiry, token })
}

/// SAS token parsed from a string supplied by the application.
///
/// ```
/// use hubwire::auth::NonRenewableSasToken;
///
/// let token = NonRenewableSasToken::parse(
///     "SharedAccessSignature sr=some%2Furi&sig=c2lnbmF0dXJl&se=1700000000",
/// )
/// .expect("valid token");
/// assert_eq!(token.resource_uri(), "some/uri");
/// assert_eq!(token.expiry_time(), 1_700_000_000);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NonRenewableSasToken {
    token: String,
    resource_uri: String,
    signature: String,
    expiry: u64,
    key_name: Option<String>,
}

impl NonRenewableSasToken {
    /// Parse `token` into its fields.
    ///
    /// # Errors
    ///
    /// Returns [`SasTokenError::Malformed`] if the string is not a SAS token or
    /// a field is not `key=value`, [`SasTokenError::MissingFields`] if a
    /// required field is absent and [`SasTokenError::UnexpectedFields`] if an
    /// unknown field is present.
    pub fn parse(token: &str) -> Result<Self, SasTokenError> {
        let body = token
            .strip_prefix(TOKEN_PREFIX)
            .filter(|body| !body.is_empty() && !body.contains(' '))
            .ok_or_else(|| SasTokenError::Malformed("not a SharedAccessSignature".into()))?;

        let mut fields = HashMap::new();
        for pair in body.split('&') {
            let (key, value) = pair
                .split_once('=')
                .filter(|(_, value)| !value.contains('='))
                .ok_or_else(|| SasTokenError::Malformed(format!("invalid field '{pair}'")))?;
            if fields.insert(key, value).is_some() {
                return Err(SasTokenError::Malformed(format!("duplicate field '{key}'")));
            }
        }

        let missing: Vec<String> = REQUIRED_FIELDS
            .iter()
            .filter(|field| !fields.contains_key(**field))
            .map(ToString::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(SasTokenError::MissingFields(missing));
        }
        let mut unexpected: Vec<String> = fields
            .keys()
            .filter(|key| !REQUIRED_FIELDS.contains(*key) && !OPTIONAL_FIELDS.contains(*key))
            .map(ToString::to_string)
            .collect();
        if !unexpected.is_empty() {
            unexpected.sort();
            return Err(SasTokenError::UnexpectedFields(unexpected));
        }

        let expiry = fields["se"]
            .parse()
            .map_err(|_| SasTokenError::Malformed(format!("expiry '{}' is not an integer", fields["se"])))?;
        Ok(Self {
            token: token.to_owned(),
            resource_uri: decode(fields["sr"])?,
            signature: decode(fields["sig"])?,
            expiry,
            key_name: fields.get("skn").map(|name| (*name).to_owned()),
        })
    }

    /// Expiry in seconds since the Unix epoch.
    #[must_use]
    pub fn expiry_time(&self) -> u64 { self.expiry }

    /// Percent-decoded resource URI.
    #[must_use]
    pub fn resource_uri(&self) -> &str { &self.resource_uri }

    /// Percent-decoded signature.
    #[must_use]
    pub fn signature(&self) -> &str { &self.signature }

    /// Optional shared access key name.
    #[must_use]
    pub fn key_name(&self) -> Option<&str> { self.key_name.as_deref() }
}

impl fmt::Display for NonRenewableSasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.token) }
}

fn decode(value: &str) -> Result<String, SasTokenError> {
    urlencoding::decode(value)
        .map(std::borrow::Cow::into_owned)
        .map_err(|err| SasTokenError::Malformed(err.to_string()))
}

/// Either kind of SAS token.
#[derive(Debug)]
pub enum SasToken {
    /// Signed locally and refreshed on a schedule.
    Renewable(RenewableSasToken),
    /// Supplied by the application; must be replaced before it expires.
    NonRenewable(NonRenewableSasToken),
}

impl SasToken {
    /// Expiry in seconds since the Unix epoch.
    #[must_use]
    pub fn expiry_time(&self) -> u64 {
        match self {
            Self::Renewable(token) => token.expiry_time(),
            Self::NonRenewable(token) => token.expiry_time(),
        }
    }

    /// Whether [`SasToken::refresh`] can succeed.
    #[must_use]
    pub fn is_renewable(&self) -> bool { matches!(self, Self::Renewable(_)) }

    /// Refresh a renewable token.
    ///
    /// # Errors
    ///
    /// Returns [`SasTokenError::NotRenewable`] for application-supplied tokens
    /// and [`SasTokenError::Signing`] when signing fails.
    pub fn refresh(&mut self) -> Result<(), SasTokenError> {
        match self {
            Self::Renewable(token) => token.refresh(),
            Self::NonRenewable(_) => Err(SasTokenError::NotRenewable),
        }
    }
}

impl fmt::Display for SasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Renewable(token) => token.fmt(f),
            Self::NonRenewable(token) => token.fmt(f),
        }
    }
}

impl From<RenewableSasToken> for SasToken {
    fn from(token: RenewableSasToken) -> Self { Self::Renewable(token) }
}

impl From<NonRenewableSasToken> for SasToken {
    fn from(token: NonRenewableSasToken) -> Self { Self::NonRenewable(token) }
}

/// SAS token shared between the authentication stage and the transport.
///
/// Readers take a snapshot of the token string; only the crate can mutate
/// it, and it does so from the pipeline context.
#[derive(Clone, Debug)]
pub struct SharedSasToken(Arc<RwLock<SasToken>>);

impl SharedSasToken {
    /// Wrap `token` for sharing.
    #[must_use]
    pub fn new(token: impl Into<SasToken>) -> Self { Self(Arc::new(RwLock::new(token.into()))) }

    /// Current token string.
    #[must_use]
    pub fn current(&self) -> String { self.0.read().unwrap_or_else(PoisonError::into_inner).to_string() }

    /// Current expiry in seconds since the Unix epoch.
    #[must_use]
    pub fn expiry_time(&self) -> u64 {
        self.0.read().unwrap_or_else(PoisonError::into_inner).expiry_time()
    }

    /// Whether the shared token can refresh itself.
    #[must_use]
    pub fn is_renewable(&self) -> bool {
        self.0.read().unwrap_or_else(PoisonError::into_inner).is_renewable()
    }

    /// Refresh in place, returning the new expiry.
    pub(crate) fn refresh(&self) -> Result<u64, SasTokenError> {
        let mut token = self.0.write().unwrap_or_else(PoisonError::into_inner);
        token.refresh()?;
        Ok(token.expiry_time())
    }

    /// Swap in an application-supplied replacement.
    pub(crate) fn replace(&self, replacement: SasToken) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = replacement;
    }
}
