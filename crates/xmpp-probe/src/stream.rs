//! XML stream negotiation over a [`Transport`].
//!
//! [`XmppStream`] sends the stream header, feeds received bytes to the
//! [`StreamParser`], applies the resulting events to the [`Negotiator`] and
//! performs the STARTTLS upgrade when it is required or forced.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use quick_xml::escape::escape;
use rustls::ClientConfig;
use tracing::{debug, instrument};

use crate::config::{ConnectionMode, ProbeConfig};
use crate::error::ProbeError;
use crate::negotiation::{FeatureSet, Negotiator, StartValidity, StreamState};
use crate::observer::{ProbeEvent, ProbeObserver};
use crate::parser::{ns, StreamParser, XmlEvent};
use crate::tls::CertificateInfo;
use crate::transport::Transport;

/// Result of a completed negotiation.
#[derive(Debug, Clone)]
pub struct NegotiationOutcome {
    /// Time from sending the first stream header to closing the stream
    pub elapsed: Duration,
    pub tls_established: bool,
    /// Present when TLS was used and expiry checking is enabled
    pub certificate: Option<CertificateInfo>,
    /// Features of the last negotiated stream
    pub features: FeatureSet,
    /// The server announced a stream version other than `1.0`
    pub unexpected_version: bool,
}

/// Build the opening stream header for `host`.
pub fn stream_header(mode: ConnectionMode, host: &str) -> String {
    format!(
        "<?xml version='1.0'?>\
        <stream:stream xmlns='{}' \
        xmlns:stream='{}' \
        to='{}' version='1.0'>",
        mode.namespace(),
        ns::STREAM,
        escape(host)
    )
}

/// Negotiation driver for one connection.
pub struct XmppStream<'a> {
    transport: &'a mut Transport,
    config: &'a ProbeConfig,
    tls_config: Arc<ClientConfig>,
    observer: Arc<dyn ProbeObserver>,
    parser: StreamParser,
    negotiator: Negotiator,
    /// Parsed events not yet applied to the negotiator
    pending: VecDeque<XmlEvent>,
}

impl<'a> XmppStream<'a> {
    pub fn new(
        transport: &'a mut Transport,
        config: &'a ProbeConfig,
        tls_config: Arc<ClientConfig>,
        observer: Arc<dyn ProbeObserver>,
    ) -> Self {
        Self {
            transport,
            config,
            tls_config,
            observer,
            parser: StreamParser::new(),
            negotiator: Negotiator::new(),
            pending: VecDeque::new(),
        }
    }

    /// Run the full negotiation: header, features, optional STARTTLS, close.
    #[instrument(skip(self), name = "xmpp.stream.negotiate", fields(host = %self.config.host))]
    pub async fn negotiate(&mut self) -> Result<NegotiationOutcome, ProbeError> {
        let started = Instant::now();

        self.send_stream_header().await?;
        self.read_until(StreamState::FeaturesReceived).await?;
        let mut unexpected_version = self.validate_start(self.config.force_starttls)?;

        let required = self
            .negotiator
            .features()
            .is_some_and(|features| features.start_tls_required);

        let mut certificate = None;
        if required || self.config.force_starttls {
            certificate = self.starttls(required).await?;
            unexpected_version |= self.validate_start(false)?;
        }

        let features = self.negotiator.features().cloned().unwrap_or_default();
        self.close_stream().await?;

        Ok(NegotiationOutcome {
            elapsed: started.elapsed(),
            tls_established: self.transport.is_tls(),
            certificate,
            features,
            unexpected_version,
        })
    }

    async fn send(&mut self, data: &str) -> Result<(), ProbeError> {
        self.observer.on_event(&ProbeEvent::Sent {
            data: data.to_string(),
        });
        self.transport.send(data.as_bytes()).await
    }

    async fn send_stream_header(&mut self) -> Result<(), ProbeError> {
        let header = stream_header(self.config.mode, &self.config.host);
        self.send(&header).await?;
        debug!(to = %self.config.host, mode = ?self.config.mode, "Sent stream header");
        Ok(())
    }

    /// Apply one event, reporting state changes.
    fn apply(&mut self, event: XmlEvent) -> Result<(), ProbeError> {
        let from = self.negotiator.state();
        self.negotiator.handle(event)?;
        let to = self.negotiator.state();
        if from != to {
            self.observer.on_event(&ProbeEvent::StateChanged { from, to });
        }
        Ok(())
    }

    /// Read and apply events until the negotiator reaches `target`.
    ///
    /// Events following the one that reached `target` stay queued. Waits
    /// indefinitely for data; the caller bounds the overall duration.
    async fn read_until(&mut self, target: StreamState) -> Result<(), ProbeError> {
        loop {
            while let Some(event) = self.pending.pop_front() {
                self.apply(event)?;

                let state = self.negotiator.state();
                if state == target {
                    return Ok(());
                }
                // A stream error is reported once it is complete
                if state > target && state != StreamState::Error {
                    return Err(ProbeError::unexpected_state(format!(
                        "stream reached {} while waiting for {}",
                        state, target
                    )));
                }
            }

            let data = self
                .transport
                .receive_available(self.config.read_wait())
                .await?;
            if data.is_empty() {
                continue;
            }

            self.observer.on_event(&ProbeEvent::Received {
                data: String::from_utf8_lossy(&data).into_owned(),
            });
            self.pending.extend(self.parser.feed(&data));
        }
    }

    fn validate_start(&self, expect_starttls: bool) -> Result<bool, ProbeError> {
        match self.negotiator.validate_start(expect_starttls)? {
            StartValidity::Valid => Ok(false),
            StartValidity::UnexpectedVersion(version) => {
                self.observer
                    .on_event(&ProbeEvent::UnexpectedVersion { version });
                Ok(true)
            }
        }
    }

    /// Upgrade to TLS and negotiate a fresh stream over it.
    #[instrument(skip(self), name = "xmpp.stream.starttls")]
    async fn starttls(&mut self, required: bool) -> Result<Option<CertificateInfo>, ProbeError> {
        self.observer
            .on_event(&ProbeEvent::StartTlsRequested { required });
        self.send(&format!("<starttls xmlns='{}'/>", ns::TLS)).await?;
        self.read_until(StreamState::ProceedStartTls).await?;

        // Anything parsed after <proceed/> belongs to the plaintext stream
        self.pending.clear();

        self.transport
            .upgrade_to_tls(self.tls_config.clone(), &self.config.host)
            .await?;
        self.observer.on_event(&ProbeEvent::TlsEstablished {
            server_name: self.config.host.clone(),
        });

        let certificate = if self.config.check_certificate_expiry {
            Some(self.certificate_info()?)
        } else {
            None
        };

        self.parser.reset();
        self.negotiator.reset();

        self.send_stream_header().await?;
        self.read_until(StreamState::FeaturesReceived).await?;

        Ok(certificate)
    }

    fn certificate_info(&self) -> Result<CertificateInfo, ProbeError> {
        let der = self
            .transport
            .peer_certificate()
            .ok_or_else(|| ProbeError::TlsCertificate("server presented no certificate".into()))?;
        let info = CertificateInfo::from_der(&der, Utc::now())?;

        self.observer.on_event(&ProbeEvent::CertificateExpiry {
            not_after: info.not_after,
            days_remaining: info.days_remaining,
        });
        Ok(info)
    }

    /// Send the closing tag and give the server one read slice to answer.
    async fn close_stream(&mut self) -> Result<(), ProbeError> {
        self.send("</stream:stream>").await?;

        match self
            .transport
            .receive_available(self.config.read_wait())
            .await
        {
            Ok(data) if !data.is_empty() => {
                self.observer.on_event(&ProbeEvent::Received {
                    data: String::from_utf8_lossy(&data).into_owned(),
                });
                for event in self.parser.feed(&data) {
                    if let Err(e) = self.apply(event) {
                        debug!(error = %e, "Ignoring error after closing stream");
                        break;
                    }
                }
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Connection ended while closing stream"),
        }

        Ok(())
    }
}
