//! Structured observation of a probe run.
//!
//! The probe reports what it does through a [`ProbeObserver`] passed in by the
//! caller instead of logging through global state. [`TracingObserver`]
//! forwards every event to `tracing` and is used when no observer is given.

use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::FailureKind;
use crate::negotiation::StreamState;

/// Something that happened during a probe.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeEvent {
    Resolved { host: String, addresses: Vec<SocketAddr> },
    Connected { address: SocketAddr },
    /// Raw bytes written to the server
    Sent { data: String },
    /// Raw bytes read from the server
    Received { data: String },
    StateChanged { from: StreamState, to: StreamState },
    /// The server announced a stream version other than `1.0`
    UnexpectedVersion { version: Option<String> },
    StartTlsRequested { required: bool },
    TlsEstablished { server_name: String },
    CertificateExpiry { not_after: DateTime<Utc>, days_remaining: i64 },
    TransportClosed,
    Completed { elapsed: Duration },
    Failed { kind: FailureKind, message: String },
}

/// Receiver of [`ProbeEvent`]s.
pub trait ProbeObserver: Send + Sync {
    fn on_event(&self, event: &ProbeEvent);
}

/// Observer that emits events as `tracing` records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ProbeObserver for TracingObserver {
    fn on_event(&self, event: &ProbeEvent) {
        match event {
            ProbeEvent::Resolved { host, addresses } => {
                debug!(host = %host, count = addresses.len(), "Resolved {:?}", addresses)
            }
            ProbeEvent::Connected { address } => debug!(address = %address, "Connected"),
            ProbeEvent::Sent { data } => debug!(bytes = data.len(), "SEND {}", data),
            ProbeEvent::Received { data } => debug!(bytes = data.len(), "RECV {}", data),
            ProbeEvent::StateChanged { from, to } => {
                debug!(from = %from, to = %to, "Stream state changed")
            }
            ProbeEvent::UnexpectedVersion { version } => warn!(
                version = ?version,
                "Server announced unexpected stream version"
            ),
            ProbeEvent::StartTlsRequested { required } => {
                debug!(required = required, "Requesting STARTTLS")
            }
            ProbeEvent::TlsEstablished { server_name } => {
                info!(server_name = %server_name, "TLS established")
            }
            ProbeEvent::CertificateExpiry {
                not_after,
                days_remaining,
            } => info!(
                not_after = %not_after,
                days_remaining = days_remaining,
                "Server certificate expiry"
            ),
            ProbeEvent::TransportClosed => debug!("Transport closed"),
            ProbeEvent::Completed { elapsed } => {
                info!(elapsed_ms = elapsed.as_millis() as u64, "Probe completed")
            }
            ProbeEvent::Failed { kind, message } => warn!(kind = %kind, "Probe failed: {}", message),
        }
    }
}
