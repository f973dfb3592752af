//! Signing mechanisms used to produce SAS token signatures.

use std::{error::Error, fmt, sync::Arc};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Boxed error returned by external signing services.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Failure to produce a signature.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SigningError {
    /// The symmetric key is not valid base64.
    #[error("invalid symmetric key: {0}")]
    InvalidKey(#[from] base64::DecodeError),
    /// The HMAC implementation rejected the key length.
    #[error("symmetric key has an unusable length")]
    KeyLength,
    /// The external signing service reported a failure.
    #[error("signing service failed: {0}")]
    Provider(#[source] Arc<dyn Error + Send + Sync>),
}

/// Computes a keyed digest over an arbitrary byte string.
///
/// Implementations must be deterministic for a fixed key.
pub trait SigningMechanism: Send + Sync {
    /// Sign `message`, returning the raw digest bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError`] when the digest cannot be produced.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SigningError>;
}

/// HMAC-SHA256 signer over a base64-encoded pre-shared key.
///
/// ```
/// use hubwire::auth::{SigningMechanism, SymmetricKeySigner};
///
/// let signer = SymmetricKeySigner::new("Zm9vYmFy").expect("valid key");
/// assert_eq!(signer.sign(b"data").expect("sign").len(), 32);
/// ```
#[derive(Clone)]
pub struct SymmetricKeySigner {
    key: Vec<u8>,
}

impl SymmetricKeySigner {
    /// Decode `key` and build a signer.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError::InvalidKey`] if `key` is not valid base64.
    pub fn new(key: &str) -> Result<Self, SigningError> {
        Ok(Self {
            key: STANDARD.decode(key)?,
        })
    }
}

impl fmt::Debug for SymmetricKeySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricKeySigner").finish_non_exhaustive()
    }
}

impl SigningMechanism for SymmetricKeySigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SigningError> {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.key).map_err(|_| SigningError::KeyLength)?;
        mac.update(message);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

/// An external service able to sign on the client's behalf, such as a
/// hardware security module or a local identity broker.
pub trait SigningService: Send + Sync {
    /// Sign `message` and return the raw digest.
    ///
    /// # Errors
    ///
    /// Returns whatever provider-specific failure occurred.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, BoxError>;
}

impl<F> SigningService for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>, BoxError> + Send + Sync,
{
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, BoxError> { self(message) }
}

/// Signer delegating to a [`SigningService`].
///
/// Provider failures are wrapped in [`SigningError::Provider`] so callers need
/// not know which signer they hold.
#[derive(Clone)]
pub struct DelegatedSigner {
    service: Arc<dyn SigningService>,
}

impl DelegatedSigner {
    /// Wrap `service`.
    pub fn new(service: impl SigningService + 'static) -> Self {
        Self {
            service: Arc::new(service),
        }
    }
}

impl fmt::Debug for DelegatedSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegatedSigner").finish_non_exhaustive()
    }
}

impl SigningMechanism for DelegatedSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SigningError> {
        self.service
            .sign(message)
            .map_err(|err| SigningError::Provider(Arc::from(err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_signature_is_deterministic() {
        let signer = SymmetricKeySigner::new("Zm9vYmFy").expect("valid key");
        let first = signer.sign(b"my.host.name\n1700000000").expect("sign");
        let second = signer.sign(b"my.host.name\n1700000000").expect("sign");
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
    }

    #[test]
    fn invalid_base64_key_is_rejected() {
        let err = SymmetricKeySigner::new("not base64!").expect_err("key must be rejected");
        assert!(matches!(err, SigningError::InvalidKey(_)));
    }

    #[test]
    fn delegated_signer_wraps_provider_failures() {
        let signer = DelegatedSigner::new(|_: &[u8]| -> Result<Vec<u8>, BoxError> {
            Err("hsm unavailable".into())
        });
        let err = signer.sign(b"payload").expect_err("provider failure");
        assert!(matches!(err, SigningError::Provider(_)));
        assert!(err.to_string().contains("hsm unavailable"));
    }

    #[test]
    fn delegated_signer_returns_provider_digest() {
        let signer = DelegatedSigner::new(|msg: &[u8]| -> Result<Vec<u8>, BoxError> {
            Ok(msg.iter().rev().copied().collect())
        });
        assert_eq!(signer.sign(b"abc").expect("sign"), b"cba".to_vec());
    }
}
