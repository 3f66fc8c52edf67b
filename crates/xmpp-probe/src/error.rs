//! Error types for the XMPP probe.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::parser::{Attributes, QName};

/// Probe failures.
///
/// Every variant is terminal for the current probe. Use [`ProbeError::kind`]
/// to branch on the failure class without inspecting message text.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The target name could not be turned into any socket address
    #[error("Address resolution failed for {host}: {message}")]
    AddressResolution { host: String, message: String },

    /// No candidate address accepted a connection, or the connection broke
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Malformed XML or element nesting the stream does not allow
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// The stream reached a state incompatible with the current step
    #[error("Unexpected state: {0}")]
    UnexpectedState(String),

    /// The server sent `<stream:error/>`
    #[error("Remote stream error: {0}")]
    RemoteStream(StreamError),

    /// STARTTLS or TLS negotiation failed for a reason other than the certificate
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// The server certificate was rejected
    #[error("TLS certificate rejected: {0}")]
    TlsCertificate(String),

    /// The overall deadline expired
    #[error("Probe timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid probe configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error on an established connection
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProbeError {
    /// Create a new protocol violation error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new unexpected state error.
    pub fn unexpected_state(msg: impl Into<String>) -> Self {
        Self::UnexpectedState(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new TLS handshake error.
    pub fn tls_handshake(msg: impl Into<String>) -> Self {
        Self::TlsHandshake(msg.into())
    }

    /// The failure class of this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::AddressResolution { .. } => FailureKind::AddressResolutionFailure,
            Self::Connection(_) | Self::Io(_) => FailureKind::ConnectionFailure,
            Self::Protocol(_) => FailureKind::ProtocolViolation,
            Self::UnexpectedState(_) => FailureKind::UnexpectedState,
            Self::RemoteStream(_) => FailureKind::RemoteStreamError,
            Self::TlsHandshake(_) => FailureKind::TlsHandshakeFailure,
            Self::TlsCertificate(_) => FailureKind::TlsCertificateFailure,
            Self::Timeout(_) => FailureKind::Timeout,
            Self::Config(_) => FailureKind::Configuration,
        }
    }
}

/// Failure classes reported to the caller of a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    AddressResolutionFailure,
    ConnectionFailure,
    ProtocolViolation,
    UnexpectedState,
    RemoteStreamError,
    TlsHandshakeFailure,
    TlsCertificateFailure,
    Timeout,
    Configuration,
}

impl FailureKind {
    /// Get the snake_case name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddressResolutionFailure => "address_resolution_failure",
            Self::ConnectionFailure => "connection_failure",
            Self::ProtocolViolation => "protocol_violation",
            Self::UnexpectedState => "unexpected_state",
            Self::RemoteStreamError => "remote_stream_error",
            Self::TlsHandshakeFailure => "tls_handshake_failure",
            Self::TlsCertificateFailure => "tls_certificate_failure",
            Self::Timeout => "timeout",
            Self::Configuration => "configuration",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Children of a `<stream:error/>` outside the stream-errors namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtraElement {
    /// Attributes of the element
    pub attributes: Attributes,
    /// Character data collected directly inside the element
    pub text: String,
}

/// A `<stream:error/>` received from the server (RFC 6120 Section 4.9).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamError {
    /// Defined condition, e.g. `host-unknown`
    pub condition: String,
    /// Optional human readable description
    pub text: Option<String>,
    /// Application specific elements keyed by qualified name
    pub extra_data: BTreeMap<QName, ExtraElement>,
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let condition = if self.condition.is_empty() {
            "undefined-condition"
        } else {
            &self.condition
        };
        match &self.text {
            Some(text) => write!(f, "{} ({})", condition, text),
            None => write!(f, "{}", condition),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            ProbeError::protocol("bad").kind(),
            FailureKind::ProtocolViolation
        );
        assert_eq!(
            ProbeError::Timeout(Duration::from_secs(2)).kind(),
            FailureKind::Timeout
        );
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(ProbeError::from(io).kind(), FailureKind::ConnectionFailure);
    }

    #[test]
    fn test_stream_error_display() {
        let err = StreamError {
            condition: "not-authorized".into(),
            text: Some("bad creds".into()),
            ..Default::default()
        };
        assert_eq!(err.to_string(), "not-authorized (bad creds)");

        let err = ProbeError::RemoteStream(StreamError::default());
        assert_eq!(err.to_string(), "Remote stream error: undefined-condition");
    }

    #[test]
    fn test_failure_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::TlsCertificateFailure).unwrap();
        assert_eq!(json, "\"tls_certificate_failure\"");
        assert_eq!(FailureKind::Timeout.to_string(), "timeout");
    }
}
