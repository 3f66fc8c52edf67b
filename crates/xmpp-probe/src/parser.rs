//! Incremental, namespace-aware XML parsing for XMPP streams.
//!
//! XMPP uses a single long-lived XML document per session, so the parser
//! accepts arbitrary byte chunks and only reports markup once it is complete.
//! Tokenizing is done by quick-xml over the retained buffer; namespace
//! scoping and tag balancing are tracked here because the tokenizer is
//! restarted on every chunk.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Serialize, Serializer};

/// Namespace URIs used in XMPP
pub mod ns {
    /// XMPP client namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// XMPP server namespace
    pub const JABBER_SERVER: &str = "jabber:server";
    /// XMPP streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// Stream error conditions namespace
    pub const STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// STARTTLS namespace
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// XEP-0115 entity capabilities namespace
    pub const CAPS: &str = "http://jabber.org/protocol/caps";
    /// Namespace bound to the reserved `xml` prefix
    pub const XML: &str = "http://www.w3.org/XML/1998/namespace";
}

/// A namespace-qualified XML name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QName {
    /// Namespace URI, `None` for unqualified names
    pub namespace: Option<String>,
    /// Local part of the name
    pub local: String,
}

impl QName {
    /// Create a name in the given namespace.
    pub fn new(namespace: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            local: local.into(),
        }
    }

    /// Create a name without a namespace.
    pub fn unqualified(local: impl Into<String>) -> Self {
        Self {
            namespace: None,
            local: local.into(),
        }
    }

    /// Check whether this name is `local` in `namespace`.
    pub fn is(&self, namespace: &str, local: &str) -> bool {
        self.namespace.as_deref() == Some(namespace) && self.local == local
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{{{}}}{}", namespace, self.local),
            None => write!(f, "{}", self.local),
        }
    }
}

impl Serialize for QName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Element attributes keyed by qualified name (namespace declarations excluded).
pub type Attributes = BTreeMap<QName, String>;

/// Events produced by [`StreamParser::feed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlEvent {
    /// The document root (`<stream:stream>`) was opened
    StreamOpen { name: QName, attributes: Attributes },
    /// A child element was opened
    ElementOpen { name: QName, attributes: Attributes },
    /// An element (including the root) was closed
    ElementClose { name: QName },
    /// Character data inside an element
    CharacterData(String),
    /// The input is not well-formed; the parser stays failed until reset
    ParseError(String),
}

/// Namespace context of one open element.
#[derive(Debug, Clone)]
struct Scope {
    raw_name: String,
    name: QName,
    default_ns: Option<String>,
    prefixes: HashMap<String, String>,
}

impl Scope {
    fn lookup(&self, prefix: &str) -> Result<String, String> {
        if prefix == "xml" {
            return Ok(ns::XML.to_string());
        }
        self.prefixes
            .get(prefix)
            .cloned()
            .ok_or_else(|| format!("undeclared namespace prefix '{}'", prefix))
    }

    fn resolve_element(&self, raw: &str) -> Result<QName, String> {
        match raw.split_once(':') {
            Some((prefix, local)) => Ok(QName::new(self.lookup(prefix)?, local)),
            None => Ok(QName {
                namespace: self.default_ns.clone(),
                local: raw.to_string(),
            }),
        }
    }

    fn resolve_attribute(&self, raw: &str) -> Result<QName, String> {
        match raw.split_once(':') {
            Some((prefix, local)) => Ok(QName::new(self.lookup(prefix)?, local)),
            None => Ok(QName::unqualified(raw)),
        }
    }
}

/// Upper bound on input held back waiting for the end of a tag or text run.
pub const MAX_PENDING_BYTES: usize = 64 * 1024;

/// Incremental XML parser for one XMPP stream document.
#[derive(Debug, Default)]
pub struct StreamParser {
    /// Bytes received but not yet turned into events
    buffer: Vec<u8>,
    /// Currently open elements, root first
    scopes: Vec<Scope>,
    /// Whether the root element has been closed
    root_closed: bool,
    /// Error message once the input turned out to be malformed
    failed: Option<String>,
}

impl StreamParser {
    /// Create a new parser expecting a fresh document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes and return the events it completes.
    ///
    /// Chunks may split tags, entities or UTF-8 sequences anywhere; incomplete
    /// input is retained for the next call. Character data is reported once
    /// it is terminated by markup.
    pub fn feed(&mut self, data: &[u8]) -> Vec<XmlEvent> {
        let mut events = Vec::new();

        if let Some(message) = &self.failed {
            events.push(XmlEvent::ParseError(message.clone()));
            return events;
        }

        self.buffer.extend_from_slice(data);
        let buffer = std::mem::take(&mut self.buffer);

        match self.parse_buffer(&buffer, &mut events) {
            Ok(consumed) if buffer.len() - consumed > MAX_PENDING_BYTES => {
                let message = format!(
                    "unterminated markup exceeds {} bytes",
                    MAX_PENDING_BYTES
                );
                self.failed = Some(message.clone());
                events.push(XmlEvent::ParseError(message));
            }
            Ok(consumed) => {
                self.buffer = buffer[consumed..].to_vec();
            }
            Err(message) => {
                self.failed = Some(message.clone());
                events.push(XmlEvent::ParseError(message));
            }
        }

        events
    }

    /// Discard all state so the parser can read a new document.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Number of currently open elements.
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Number of bytes held back waiting for more input.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Tokenize as much of `buffer` as possible, returning the consumed length.
    fn parse_buffer(&mut self, buffer: &[u8], events: &mut Vec<XmlEvent>) -> Result<usize, String> {
        let mut reader = Reader::from_reader(buffer);
        let config = reader.config_mut();
        config.trim_text(false);
        // Tags opened in earlier chunks are unknown to a fresh reader
        config.check_end_names = false;
        config.allow_unmatched_ends = true;

        loop {
            let before = reader.buffer_position() as usize;

            match reader.read_event() {
                Ok(Event::Start(start)) => self.open_element(&start, events)?,
                Ok(Event::Empty(start)) => {
                    self.open_element(&start, events)?;
                    self.close_element(start.name().as_ref(), events)?;
                }
                Ok(Event::End(end)) => self.close_element(end.name().as_ref(), events)?,
                Ok(Event::Text(text)) => {
                    if reader.buffer_position() as usize >= buffer.len() {
                        // More character data may follow in the next chunk
                        return Ok(before);
                    }
                    let text = text
                        .unescape()
                        .map_err(|e| format!("invalid character data: {}", e))?;
                    self.character_data(text.into_owned(), events)?;
                }
                Ok(Event::CData(cdata)) => {
                    let text = String::from_utf8(cdata.into_inner().into_owned())
                        .map_err(|e| format!("invalid UTF-8 in CDATA section: {}", e))?;
                    self.character_data(text, events)?;
                }
                Ok(Event::DocType(_)) => {
                    return Err("DOCTYPE declarations are not allowed in XMPP streams".to_string())
                }
                Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) => {}
                Ok(Event::Eof) => return Ok(buffer.len()),
                Err(quick_xml::Error::Syntax(error)) if is_incomplete(&error, buffer.len() - before) => {
                    return Ok(before);
                }
                Err(e) => return Err(format!("malformed XML: {}", e)),
            }
        }
    }

    fn open_element(&mut self, start: &BytesStart<'_>, events: &mut Vec<XmlEvent>) -> Result<(), String> {
        if self.root_closed {
            return Err("element after the end of the stream".to_string());
        }

        let raw_name = std::str::from_utf8(start.name().as_ref())
            .map_err(|e| format!("invalid UTF-8 in element name: {}", e))?
            .to_string();

        let parent = self.scopes.last();
        let mut default_ns = parent.and_then(|scope| scope.default_ns.clone());
        let mut prefixes = parent.map(|scope| scope.prefixes.clone()).unwrap_or_default();
        let mut raw_attributes = Vec::new();

        for attribute in start.attributes() {
            let attribute = attribute.map_err(|e| format!("malformed attribute: {}", e))?;
            let key = std::str::from_utf8(attribute.key.as_ref())
                .map_err(|e| format!("invalid UTF-8 in attribute name: {}", e))?
                .to_string();
            let value = attribute
                .unescape_value()
                .map_err(|e| format!("invalid attribute value for '{}': {}", key, e))?
                .into_owned();

            if key == "xmlns" {
                default_ns = (!value.is_empty()).then_some(value);
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                if value.is_empty() {
                    return Err(format!("empty namespace for prefix '{}'", prefix));
                }
                prefixes.insert(prefix.to_string(), value);
            } else {
                raw_attributes.push((key, value));
            }
        }

        let mut scope = Scope {
            raw_name,
            name: QName::unqualified(""),
            default_ns,
            prefixes,
        };
        scope.name = scope.resolve_element(&scope.raw_name)?;

        let mut attributes = Attributes::new();
        for (key, value) in raw_attributes {
            let qname = scope.resolve_attribute(&key)?;
            if attributes.insert(qname, value).is_some() {
                return Err(format!("duplicate attribute '{}'", key));
            }
        }

        let name = scope.name.clone();
        let is_root = self.scopes.is_empty();
        self.scopes.push(scope);

        events.push(if is_root {
            XmlEvent::StreamOpen { name, attributes }
        } else {
            XmlEvent::ElementOpen { name, attributes }
        });
        Ok(())
    }

    fn close_element(&mut self, raw: &[u8], events: &mut Vec<XmlEvent>) -> Result<(), String> {
        let raw = std::str::from_utf8(raw)
            .map_err(|e| format!("invalid UTF-8 in closing tag: {}", e))?;

        let scope = self
            .scopes
            .pop()
            .ok_or_else(|| format!("closing tag </{}> without an open element", raw))?;

        if scope.raw_name != raw {
            return Err(format!(
                "mismatched closing tag: expected </{}>, found </{}>",
                scope.raw_name, raw
            ));
        }

        if self.scopes.is_empty() {
            self.root_closed = true;
        }

        events.push(XmlEvent::ElementClose { name: scope.name });
        Ok(())
    }

    fn character_data(&mut self, text: String, events: &mut Vec<XmlEvent>) -> Result<(), String> {
        if self.scopes.is_empty() {
            if text.chars().all(|c| matches!(c, ' ' | '\t' | '\r' | '\n')) {
                return Ok(());
            }
            return Err("character data outside the stream element".to_string());
        }
        events.push(XmlEvent::CharacterData(text));
        Ok(())
    }
}

/// Whether a tokenizer error only means the buffer ends mid-markup.
fn is_incomplete(error: &SyntaxError, remaining: usize) -> bool {
    match error {
        SyntaxError::UnclosedTag
        | SyntaxError::UnclosedCData
        | SyntaxError::UnclosedComment
        | SyntaxError::UnclosedPIOrXmlDecl => true,
        // `<!` with nothing after it yet
        SyntaxError::InvalidBangMarkup => remaining < 3,
        _ => false,
    }
}
