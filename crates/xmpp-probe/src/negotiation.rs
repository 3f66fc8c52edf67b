//! Stream negotiation state machine.
//!
//! [`Negotiator`] turns [`XmlEvent`]s into [`StreamState`] transitions and
//! [`FeatureSet`] / [`StreamError`] updates. It performs no IO; the driver in
//! [`crate::stream`] decides what to send based on the resulting state.

use std::fmt;

use serde::Serialize;

use crate::error::{ExtraElement, ProbeError, StreamError};
use crate::parser::{ns, Attributes, QName, XmlEvent};

/// Protocol progress of one stream.
///
/// Ordered: transitions never move backwards within a stream. A STARTTLS
/// upgrade starts a new stream via [`Negotiator::reset`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    #[default]
    New,
    StreamStarted,
    FeaturesReceived,
    ProceedStartTls,
    Error,
    Finished,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::StreamStarted => "stream_started",
            Self::FeaturesReceived => "features_received",
            Self::ProceedStartTls => "proceed_starttls",
            Self::Error => "error",
            Self::Finished => "finished",
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Features announced by the server for the current stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeatureSet {
    pub start_tls_offered: bool,
    pub start_tls_required: bool,
    /// SASL mechanisms in announcement order
    pub sasl_mechanisms: Vec<String>,
    /// Attributes of the XEP-0115 `<c/>` element
    pub capabilities: Attributes,
    /// Attributes of the server's `<stream:stream>` header
    pub stream_attributes: Attributes,
}

impl FeatureSet {
    /// The `version` attribute of the server's stream header.
    pub fn version(&self) -> Option<&str> {
        self.stream_attributes
            .get(&QName::unqualified("version"))
            .map(String::as_str)
    }
}

/// Outcome of a successful start validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartValidity {
    Valid,
    /// Server announced a version other than `1.0` (or none). Informational.
    UnexpectedVersion(Option<String>),
}

/// Event-driven negotiation state for one stream.
#[derive(Debug, Default)]
pub struct Negotiator {
    state: StreamState,
    features: FeatureSet,
    features_received: bool,
    /// Currently open elements, root first
    stack: Vec<QName>,
    stream_error: Option<StreamError>,
    /// Text of the `<mechanism/>` being read
    mechanism: Option<String>,
}

impl Negotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current stream state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Announced features, available once `FeaturesReceived` was reached.
    pub fn features(&self) -> Option<&FeatureSet> {
        self.features_received.then_some(&self.features)
    }

    /// The stream error being collected or last reported.
    pub fn stream_error(&self) -> Option<&StreamError> {
        self.stream_error.as_ref()
    }

    /// Number of currently open elements.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Start over for a new stream.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Apply one parser event.
    ///
    /// Errors are terminal: a closed `<stream:error/>`, a TLS `<failure/>`,
    /// malformed XML and invalid nesting all end the negotiation.
    pub fn handle(&mut self, event: XmlEvent) -> Result<(), ProbeError> {
        match event {
            XmlEvent::StreamOpen { name, attributes } => self.stream_open(name, attributes),
            XmlEvent::ElementOpen { name, attributes } => self.element_open(name, attributes),
            XmlEvent::ElementClose { name } => self.element_close(name),
            XmlEvent::CharacterData(text) => {
                self.character_data(&text);
                Ok(())
            }
            XmlEvent::ParseError(message) => Err(ProbeError::protocol(message)),
        }
    }

    /// Check the announced features before continuing.
    ///
    /// Missing STARTTLS when it is expected is a hard failure, an unexpected
    /// stream version is reported but tolerated.
    pub fn validate_start(&self, expect_starttls: bool) -> Result<StartValidity, ProbeError> {
        let features = self
            .features()
            .ok_or_else(|| ProbeError::unexpected_state("stream features have not been received"))?;

        if expect_starttls && !features.start_tls_offered {
            return Err(ProbeError::unexpected_state(
                "STARTTLS expected but not offered by the server",
            ));
        }

        match features.version() {
            Some("1.0") => Ok(StartValidity::Valid),
            other => Ok(StartValidity::UnexpectedVersion(other.map(str::to_string))),
        }
    }

    fn transition(&mut self, next: StreamState) -> Result<(), ProbeError> {
        if next < self.state {
            return Err(ProbeError::protocol(format!(
                "invalid state transition from {} to {}",
                self.state, next
            )));
        }
        if next == StreamState::FeaturesReceived {
            self.features_received = true;
        }
        self.state = next;
        Ok(())
    }

    fn stream_open(&mut self, name: QName, attributes: Attributes) -> Result<(), ProbeError> {
        if !name.is(ns::STREAM, "stream") {
            return Err(ProbeError::protocol(format!("unexpected root element {}", name)));
        }
        if !self.stack.is_empty() {
            return Err(ProbeError::protocol("nested stream header"));
        }

        self.transition(StreamState::StreamStarted)?;
        self.features.stream_attributes = attributes;
        self.stack.push(name);
        Ok(())
    }

    fn element_open(&mut self, name: QName, attributes: Attributes) -> Result<(), ProbeError> {
        if self.stack.is_empty() {
            return Err(ProbeError::protocol(format!("{} outside of a stream", name)));
        }
        if name.is(ns::STREAM, "stream") {
            return Err(ProbeError::protocol("nested stream header"));
        }

        if self.state == StreamState::Error {
            self.error_child_open(&name, attributes);
            self.stack.push(name);
            return Ok(());
        }

        if name.is(ns::TLS, "starttls") {
            self.features.start_tls_offered = true;
        } else if name.is(ns::TLS, "required") {
            // Only meaningful as a direct child of <starttls/>
            if self.stack.last().is_some_and(|parent| parent.is(ns::TLS, "starttls")) {
                self.features.start_tls_required = true;
            }
        } else if name.is(ns::CAPS, "c") {
            self.features.capabilities.extend(attributes);
        } else if name.is(ns::STREAM, "error") {
            self.transition(StreamState::Error)?;
            self.stream_error = Some(StreamError::default());
        } else if name.is(ns::SASL, "mechanism") {
            self.mechanism = Some(String::new());
        }

        self.stack.push(name);
        Ok(())
    }

    fn error_child_open(&mut self, name: &QName, attributes: Attributes) {
        let Some(error) = self.stream_error.as_mut() else {
            return;
        };

        if name.namespace.as_deref() == Some(ns::STREAM_ERRORS) {
            if name.local != "text" {
                error.condition = name.local.clone();
            }
        } else {
            error.extra_data.insert(
                name.clone(),
                ExtraElement {
                    attributes,
                    text: String::new(),
                },
            );
        }
    }

    fn element_close(&mut self, name: QName) -> Result<(), ProbeError> {
        let open = self
            .stack
            .pop()
            .ok_or_else(|| ProbeError::protocol(format!("closing {} with no open element", name)))?;
        if open != name {
            return Err(ProbeError::protocol(format!(
                "closing {} while {} is open",
                name, open
            )));
        }

        if name.is(ns::STREAM, "stream") {
            return self.transition(StreamState::Finished);
        }

        if self.state == StreamState::Error {
            if name.is(ns::STREAM, "error") {
                let error = self.stream_error.clone().unwrap_or_default();
                return Err(ProbeError::RemoteStream(error));
            }
            return Ok(());
        }

        if name.is(ns::SASL, "mechanism") {
            if let Some(mechanism) = self.mechanism.take() {
                let mechanism = mechanism.trim();
                if !mechanism.is_empty() {
                    self.features.sasl_mechanisms.push(mechanism.to_string());
                }
            }
        } else if name.is(ns::STREAM, "features") {
            self.transition(StreamState::FeaturesReceived)?;
        } else if name.is(ns::TLS, "proceed") {
            self.transition(StreamState::ProceedStartTls)?;
        } else if name.is(ns::TLS, "failure") {
            return Err(ProbeError::tls_handshake("StartTLS initialization failed"));
        }

        Ok(())
    }

    fn character_data(&mut self, text: &str) {
        let Some(current) = self.stack.last() else {
            return;
        };

        if self.state == StreamState::Error {
            if let Some(error) = self.stream_error.as_mut() {
                if current.is(ns::STREAM_ERRORS, "text") {
                    error.text.get_or_insert_with(String::new).push_str(text);
                } else if let Some(extra) = error.extra_data.get_mut(current) {
                    extra.text.push_str(text);
                }
            }
            return;
        }

        if current.is(ns::SASL, "mechanism") {
            if let Some(mechanism) = self.mechanism.as_mut() {
                mechanism.push_str(text);
            }
        }
    }
}
