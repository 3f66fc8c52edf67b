//! # xmpp-probe
//!
//! XMPP stream negotiation probe for Waddle Social.
//!
//! Connects to an XMPP server, opens a stream, reads the announced features
//! and optionally upgrades the connection with STARTTLS, reporting how long
//! the negotiation took and when the server certificate expires.
//!
//! ## Architecture
//!
//! - **Address Resolver** ([`dns`]): host name to candidate socket addresses
//! - **Transport** ([`transport`]): TCP or TLS byte stream with bounded reads
//! - **Stream Parser** ([`parser`]): incremental, namespace-aware XML events
//! - **Negotiation** ([`negotiation`], [`stream`]): state machine and driver
//! - **Probe** ([`probe`]): single entry point under one overall deadline
//!
//! ## Example
//!
//! ```ignore
//! use xmpp_probe::{probe, ConnectionResult, ProbeConfig};
//!
//! let config = ProbeConfig::new("example.com");
//! let result = ConnectionResult::from(probe(&config).await);
//! ```

pub mod config;
pub mod dns;
pub mod negotiation;
pub mod observer;
pub mod parser;
pub mod probe;
pub mod stream;
pub mod tls;
pub mod transport;

mod error;

pub use config::{AddressFamily, ConnectionMode, ProbeConfig};
pub use error::{ExtraElement, FailureKind, ProbeError, StreamError};
pub use negotiation::{FeatureSet, Negotiator, StartValidity, StreamState};
pub use observer::{ProbeEvent, ProbeObserver, TracingObserver};
pub use parser::{ns, Attributes, QName, StreamParser, XmlEvent};
pub use probe::{probe, probe_with_observer, ConnectionResult, ProbeReport};
pub use tls::CertificateInfo;
