//! Probe entry point.
//!
//! A probe resolves the target, connects, negotiates the stream (including
//! STARTTLS when needed) and closes the connection, all under one deadline.

use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Serializer};
use tokio::time::{timeout_at, Instant};
use tracing::instrument;

use crate::config::ProbeConfig;
use crate::dns::AddressResolver;
use crate::error::{FailureKind, ProbeError};
use crate::negotiation::FeatureSet;
use crate::observer::{ProbeEvent, ProbeObserver, TracingObserver};
use crate::stream::XmppStream;
use crate::tls;
use crate::transport::Transport;

/// Successful probe measurements.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    #[serde(rename = "elapsed_seconds", serialize_with = "serialize_seconds")]
    pub elapsed: Duration,
    /// Whole days until the server certificate expires, negative once expired
    pub certificate_days_remaining: Option<i64>,
    pub tls_established: bool,
    pub features: FeatureSet,
    pub unexpected_version: bool,
}

fn serialize_seconds<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Outcome of a probe as handed to presentation code.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ConnectionResult {
    Success {
        elapsed_seconds: f64,
        certificate_days_remaining: Option<i64>,
        tls_established: bool,
        unexpected_version: bool,
        features: FeatureSet,
    },
    Failure {
        kind: FailureKind,
        message: String,
    },
}

impl ConnectionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

impl From<Result<ProbeReport, ProbeError>> for ConnectionResult {
    fn from(result: Result<ProbeReport, ProbeError>) -> Self {
        match result {
            Ok(report) => Self::Success {
                elapsed_seconds: report.elapsed.as_secs_f64(),
                certificate_days_remaining: report.certificate_days_remaining,
                tls_established: report.tls_established,
                unexpected_version: report.unexpected_version,
                features: report.features,
            },
            Err(e) => Self::Failure {
                kind: e.kind(),
                message: e.to_string(),
            },
        }
    }
}

/// Probe the configured server, logging through `tracing`.
pub async fn probe(config: &ProbeConfig) -> Result<ProbeReport, ProbeError> {
    probe_with_observer(config, Arc::new(TracingObserver)).await
}

/// Probe the configured server, reporting progress to `observer`.
#[instrument(skip_all, name = "xmpp.probe", fields(host = %config.host, port = config.port()))]
pub async fn probe_with_observer(
    config: &ProbeConfig,
    observer: Arc<dyn ProbeObserver>,
) -> Result<ProbeReport, ProbeError> {
    let result = run(config, &observer).await;

    match &result {
        Ok(report) => observer.on_event(&ProbeEvent::Completed {
            elapsed: report.elapsed,
        }),
        Err(e) => observer.on_event(&ProbeEvent::Failed {
            kind: e.kind(),
            message: e.to_string(),
        }),
    }

    result
}

async fn run(
    config: &ProbeConfig,
    observer: &Arc<dyn ProbeObserver>,
) -> Result<ProbeReport, ProbeError> {
    config.validate()?;
    let tls_config = tls::client_config(
        config.verify_certificates,
        config.ca_certificates.as_deref(),
    )?;

    let timeout = config.timeout();
    let deadline = Instant::now()
        .checked_add(timeout)
        .ok_or_else(|| ProbeError::config("timeout is out of range"))?;

    let host = config.connect_address();
    let addresses = timeout_at(
        deadline,
        AddressResolver::new().resolve(host, config.port(), config.address_family),
    )
    .await
    .map_err(|_| ProbeError::Timeout(timeout))??;
    observer.on_event(&ProbeEvent::Resolved {
        host: host.to_string(),
        addresses: addresses.clone(),
    });

    let mut transport = timeout_at(deadline, Transport::open(&addresses))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))??;
    observer.on_event(&ProbeEvent::Connected {
        address: transport.peer_addr(),
    });

    let result = {
        let mut stream = XmppStream::new(&mut transport, config, tls_config, observer.clone());
        timeout_at(deadline, stream.negotiate())
            .await
            .map_err(|_| ProbeError::Timeout(timeout))
            .and_then(|result| result)
    };

    if transport.close().await {
        observer.on_event(&ProbeEvent::TransportClosed);
    }

    let outcome = result?;
    Ok(ProbeReport {
        elapsed: outcome.elapsed,
        certificate_days_remaining: outcome.certificate.map(|info| info.days_remaining),
        tls_established: outcome.tls_established,
        features: outcome.features,
        unexpected_version: outcome.unexpected_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_result_success_json() {
        let report = ProbeReport {
            elapsed: Duration::from_millis(1500),
            certificate_days_remaining: Some(42),
            tls_established: true,
            features: FeatureSet {
                sasl_mechanisms: vec!["PLAIN".into()],
                ..Default::default()
            },
            unexpected_version: false,
        };

        let result = ConnectionResult::from(Ok(report));
        assert!(result.is_success());

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["result"], "success");
        assert_eq!(json["elapsed_seconds"], 1.5);
        assert_eq!(json["certificate_days_remaining"], 42);
        assert_eq!(json["features"]["sasl_mechanisms"][0], "PLAIN");
    }

    #[test]
    fn test_connection_result_failure_json() {
        let result = ConnectionResult::from(Err(ProbeError::Timeout(Duration::from_secs(2))));
        assert!(!result.is_success());

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["result"], "failure");
        assert_eq!(json["kind"], "timeout");
        assert!(json["message"].as_str().unwrap().contains("timed out"));
    }

    #[test]
    fn test_report_serializes_qualified_attribute_names() {
        let mut features = FeatureSet::default();
        features.stream_attributes.insert(
            crate::parser::QName::new(crate::parser::ns::XML, "lang"),
            "en".into(),
        );
        let report = ProbeReport {
            elapsed: Duration::from_secs(1),
            certificate_days_remaining: None,
            tls_established: false,
            features,
            unexpected_version: false,
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["elapsed_seconds"], 1.0);
        assert_eq!(
            json["features"]["stream_attributes"]["{http://www.w3.org/XML/1998/namespace}lang"],
            "en"
        );
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_connecting() {
        let err = probe(&ProbeConfig::default()).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Configuration);
    }

    #[tokio::test]
    async fn test_huge_timeout_is_a_configuration_failure() {
        let config = ProbeConfig::from_toml_str(
            "host = \"127.0.0.1\"\nport = 1\ntimeout_secs = 9223372036854775807",
        )
        .unwrap();
        let err = probe(&config).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Configuration);
    }
}
