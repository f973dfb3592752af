//! Error taxonomy shared by the pipeline, its stages and the clients.
//!
//! [`PipelineError`] is the error every operation completes with. The
//! transient/fatal split lives in exactly one place, [`PipelineError::class`],
//! and both the in-pipeline retry machinery and
//! [`retry_with_backoff`](crate::retry::retry_with_backoff) consult it.

use std::sync::Arc;

use crate::auth::SasTokenError;

/// Whether a failure is worth retrying.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried with backoff until the retry budget is exhausted.
    Transient,
    /// Surfaced to the caller immediately.
    Fatal,
}

/// Errors reported by a transport implementation.
///
/// Transports describe what went wrong on the wire; the pipeline maps these
/// onto [`PipelineError`] variants with [`PipelineError::from_transport`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The broker rejected the supplied credentials.
    #[error("connection refused: not authorized")]
    NotAuthorized,
    /// The broker rejected the connection for a protocol-level reason.
    #[error("connection refused: {0}")]
    Refused(String),
    /// TLS negotiation or certificate validation failed.
    #[error("tls failure: {0}")]
    Tls(String),
    /// Socket-level failure.
    #[error("i/o failure: {0}")]
    Io(String),
    /// The broker did not answer in time.
    #[error("transport timed out: {0}")]
    Timeout(String),
    /// A call was made while the transport had no live connection.
    #[error("transport is not connected")]
    NotConnected,
    /// The transport cannot honour a configuration option.
    #[error("unsupported transport option: {0}")]
    Unsupported(String),
    /// Anything else the transport wants to report.
    #[error("transport failure: {0}")]
    Other(String),
}

/// Error completing a pipeline operation.
#[derive(Clone, Debug, thiserror::Error)]
pub enum PipelineError {
    /// The operation was cancelled before it could complete.
    #[error("operation cancelled: {0}")]
    OperationCancelled(String),
    /// The operation did not complete within its deadline.
    #[error("operation timed out: {0}")]
    OperationTimeout(String),
    /// Best-effort failure reported while carrying out an operation.
    #[error("operation failed: {0}")]
    OperationError(String),
    /// The service answered with a non-success status.
    #[error("service error (status {status:?}): {message}")]
    Service {
        /// Status code reported by the service, when there was one.
        status: Option<u16>,
        /// Human-readable description.
        message: String,
    },
    /// The service refused the request for authorization reasons.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// A connection attempt failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] TransportError),
    /// An established connection was lost.
    #[error("connection dropped: {0}")]
    ConnectionDropped(String),
    /// The operation needs a connection and none is available.
    #[error("no connection: {0}")]
    NoConnection(String),
    /// Credential material is malformed or could not be signed.
    #[error("credential error: {0}")]
    Credential(#[from] SasTokenError),
    /// The broker rejected the request at the protocol level.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The request could not be built on the client side.
    #[error("client error: {0}")]
    Client(String),
    /// No stage in the chain handled the operation.
    #[error("{op} not handled after {stage} stage with no next stage")]
    Unhandled {
        /// Operation kind.
        op: &'static str,
        /// Name of the last stage the operation visited.
        stage: &'static str,
    },
    /// An application callback panicked.
    #[error("callback panicked: {0}")]
    CallbackPanicked(Arc<str>),
}

impl PipelineError {
    /// Classify the error as transient or fatal.
    ///
    /// # Examples
    ///
    /// ```
    /// use hubwire::{ErrorClass, PipelineError};
    ///
    /// let dropped = PipelineError::ConnectionDropped("socket closed".into());
    /// assert_eq!(dropped.class(), ErrorClass::Transient);
    /// let rejected = PipelineError::Unauthorized("bad token".into());
    /// assert_eq!(rejected.class(), ErrorClass::Fatal);
    /// ```
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::OperationCancelled(_)
            | Self::OperationTimeout(_)
            | Self::OperationError(_)
            | Self::Service { .. }
            | Self::ConnectionFailed(_)
            | Self::ConnectionDropped(_)
            | Self::NoConnection(_) => ErrorClass::Transient,
            Self::Unauthorized(_)
            | Self::Credential(_)
            | Self::Protocol(_)
            | Self::Client(_)
            | Self::Unhandled { .. }
            | Self::CallbackPanicked(_) => ErrorClass::Fatal,
        }
    }

    /// Shorthand for `self.class() == ErrorClass::Transient`.
    #[must_use]
    pub fn is_transient(&self) -> bool { self.class() == ErrorClass::Transient }

    /// Build the error for a service status code.
    ///
    /// `401` and `403` are authorization failures and therefore fatal; every
    /// other status is a generic service error.
    #[must_use]
    pub fn service(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => Self::Unauthorized(format!("status {status}: {message}")),
            _ => Self::Service {
                status: Some(status),
                message,
            },
        }
    }

    /// Map a transport failure onto the pipeline taxonomy.
    #[must_use]
    pub fn from_transport(err: TransportError) -> Self {
        match err {
            TransportError::NotAuthorized => Self::Unauthorized(err.to_string()),
            TransportError::Refused(_) | TransportError::Tls(_) => Self::Protocol(err.to_string()),
            TransportError::Unsupported(_) => Self::Client(err.to_string()),
            TransportError::NotConnected => Self::NoConnection(err.to_string()),
            TransportError::Io(_) | TransportError::Timeout(_) | TransportError::Other(_) => {
                Self::ConnectionFailed(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::cancelled(PipelineError::OperationCancelled("x".into()), ErrorClass::Transient)]
    #[case::timeout(PipelineError::OperationTimeout("x".into()), ErrorClass::Transient)]
    #[case::service(PipelineError::service(500, "boom"), ErrorClass::Transient)]
    #[case::throttled(PipelineError::service(429, "slow down"), ErrorClass::Transient)]
    #[case::forbidden(PipelineError::service(403, "nope"), ErrorClass::Fatal)]
    #[case::no_connection(PipelineError::NoConnection("x".into()), ErrorClass::Transient)]
    #[case::protocol(PipelineError::Protocol("x".into()), ErrorClass::Fatal)]
    #[case::client(PipelineError::Client("x".into()), ErrorClass::Fatal)]
    fn classifies_errors(#[case] err: PipelineError, #[case] expected: ErrorClass) {
        assert_eq!(err.class(), expected);
    }

    #[rstest]
    #[case::io(TransportError::Io("reset".into()), ErrorClass::Transient)]
    #[case::timeout(TransportError::Timeout("ping".into()), ErrorClass::Transient)]
    #[case::not_authorized(TransportError::NotAuthorized, ErrorClass::Fatal)]
    #[case::tls(TransportError::Tls("bad cert".into()), ErrorClass::Fatal)]
    #[case::refused(TransportError::Refused("bad client id".into()), ErrorClass::Fatal)]
    fn transport_failures_follow_the_same_table(
        #[case] err: TransportError,
        #[case] expected: ErrorClass,
    ) {
        assert_eq!(PipelineError::from_transport(err).class(), expected);
    }

    #[test]
    fn unhandled_message_names_operation_and_stage() {
        let err = PipelineError::Unhandled {
            op: "Publish",
            stage: "Transport",
        };
        assert_eq!(
            err.to_string(),
            "Publish not handled after Transport stage with no next stage"
        );
    }
}
