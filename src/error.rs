//! Unified error types for the relay
//!
//! All proxy-side failures are represented by the `RelayError` enum, which
//! converts into the gRPC status the client should observe. Backend statuses
//! are never routed through this type: the stream handler forwards them
//! verbatim so codes and messages survive the hop unchanged.

use thiserror::Error;

/// Unified error type for relay operations
#[derive(Debug, Error)]
pub enum RelayError {
    /// Inbound method name has no service/method separator
    #[error("malformed method name: {method:?}")]
    MalformedCall { method: String },

    /// No route in the routing table matched the call
    #[error("unknown route to service")]
    RouteNotFound { method: String },

    /// A route named a backend that is not configured
    #[error("unknown backend")]
    UnknownBackend { name: String },

    /// Dialing the backend failed or timed out
    #[error("cannot dial backend: {message}")]
    BackendUnavailable { message: String },

    /// The backend connection is up but a stream could not be opened on it
    #[error("cannot establish backend stream: {message}")]
    StreamOpen { message: String },

    /// Receive/send failure on the inbound (client-facing) side
    #[error("inbound transport failure: {message}")]
    InboundTransport { message: String },

    /// Receive/send failure on the outbound (backend-facing) side
    #[error("outbound transport failure: {message}")]
    OutboundTransport { message: String },

    /// Invalid configuration value
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// I/O error
    #[error("I/O error: {message}")]
    Io { message: String },
}

impl RelayError {
    /// Get a short error code for this error type
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MalformedCall { .. } => "MALFORMED_CALL",
            Self::RouteNotFound { .. } => "ROUTE_NOT_FOUND",
            Self::UnknownBackend { .. } => "UNKNOWN_BACKEND",
            Self::BackendUnavailable { .. } => "BACKEND_UNAVAILABLE",
            Self::StreamOpen { .. } => "STREAM_OPEN_FAILED",
            Self::InboundTransport { .. } => "INBOUND_TRANSPORT_FAILURE",
            Self::OutboundTransport { .. } => "OUTBOUND_TRANSPORT_FAILURE",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::Io { .. } => "IO_ERROR",
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

// ============================================================================
// gRPC Status conversion
// ============================================================================

impl From<RelayError> for tonic::Status {
    fn from(err: RelayError) -> Self {
        let message = err.to_string();
        match err {
            RelayError::MalformedCall { .. } => tonic::Status::invalid_argument(message),
            RelayError::RouteNotFound { .. } | RelayError::UnknownBackend { .. } => {
                tonic::Status::unimplemented(message)
            }
            RelayError::BackendUnavailable { .. } => tonic::Status::aborted(message),
            RelayError::StreamOpen { .. } => tonic::Status::unknown(message),
            RelayError::InboundTransport { .. } | RelayError::OutboundTransport { .. } => {
                tonic::Status::internal(message)
            }
            RelayError::InvalidConfig { .. } => tonic::Status::invalid_argument(message),
            RelayError::Io { .. } => tonic::Status::internal(message),
        }
    }
}

/// Result type alias using RelayError
pub type RelayResult<T> = Result<T, RelayError>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn test_status_conversion() {
        let status: tonic::Status = RelayError::MalformedCall {
            method: "no-slash".into(),
        }
        .into();
        assert_eq!(status.code(), Code::InvalidArgument);

        let status: tonic::Status = RelayError::RouteNotFound {
            method: "noncom.else.MyService/Do".into(),
        }
        .into();
        assert_eq!(status.code(), Code::Unimplemented);
        assert_eq!(status.message(), "unknown route to service");

        let status: tonic::Status = RelayError::UnknownBackend {
            name: "missing".into(),
        }
        .into();
        assert_eq!(status.code(), Code::Unimplemented);
        assert_eq!(status.message(), "unknown backend");

        let status: tonic::Status = RelayError::BackendUnavailable {
            message: "connect timed out".into(),
        }
        .into();
        assert_eq!(status.code(), Code::Aborted);
        assert!(status.message().starts_with("cannot dial backend"));

        let status: tonic::Status = RelayError::StreamOpen {
            message: "channel closed".into(),
        }
        .into();
        assert_eq!(status.code(), Code::Unknown);
        assert!(status.message().starts_with("cannot establish backend stream"));
    }

    #[test]
    fn test_error_display() {
        let err = RelayError::MalformedCall {
            method: "foo".into(),
        };
        assert_eq!(err.to_string(), "malformed method name: \"foo\"");

        let err = RelayError::BackendUnavailable {
            message: "refused".into(),
        };
        assert_eq!(err.to_string(), "cannot dial backend: refused");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            RelayError::RouteNotFound {
                method: "x/Y".into()
            }
            .error_code(),
            "ROUTE_NOT_FOUND"
        );
        assert_eq!(
            RelayError::Io {
                message: "gone".into()
            }
            .error_code(),
            "IO_ERROR"
        );
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: RelayError = io_err.into();
        assert!(matches!(err, RelayError::Io { .. }));
    }
}
