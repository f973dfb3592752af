//! Error type for client operations.

use std::time::Duration;

use crate::{
    auth::{SasTokenError, SigningError},
    config::ConfigError,
    connection_string::ConnectionStringError,
    error::{ErrorClass, PipelineError},
    handler::HandlerError,
    retry::Classify,
};

/// Errors emitted by the device and provisioning clients.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The pipeline failed the operation.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    /// The assembled configuration is invalid.
    #[error("invalid client configuration: {0}")]
    Config(#[from] ConfigError),
    /// The connection string could not be used.
    #[error(transparent)]
    ConnectionString(#[from] ConnectionStringError),
    /// A SAS token could not be built or parsed.
    #[error(transparent)]
    SasToken(#[from] SasTokenError),
    /// The shared access key is unusable.
    #[error(transparent)]
    Signing(#[from] SigningError),
    /// A handler and a direct receive were mixed up.
    #[error(transparent)]
    Handler(#[from] HandlerError),
    /// Nothing arrived before the receive deadline.
    #[error("nothing received within {0:?}")]
    ReceiveTimeout(Duration),
    /// An argument cannot describe a valid client.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The client's runtime could not be started.
    #[error("failed to start client runtime: {0}")]
    Runtime(#[source] std::io::Error),
    /// The pipeline answered with a value the operation does not produce.
    #[error("unexpected pipeline output for {0}")]
    UnexpectedOutput(&'static str),
}

impl Classify for ClientError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Pipeline(err) => err.class(),
            Self::ReceiveTimeout(_) => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }
}
