//! Credentials: signing mechanisms, SAS tokens and their renewal.

mod provider;
mod sastoken;
mod signing;

pub use provider::{AuthenticationProvider, DEFAULT_RENEWAL_MARGIN};
pub use sastoken::{
    DEFAULT_TOKEN_TTL,
    NonRenewableSasToken,
    RenewableSasToken,
    SasToken,
    SasTokenError,
    SharedSasToken,
};
pub use signing::{
    BoxError,
    DelegatedSigner,
    SigningError,
    SigningMechanism,
    SigningService,
    SymmetricKeySigner,
};
