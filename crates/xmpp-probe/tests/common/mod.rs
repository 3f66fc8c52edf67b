//! Test utilities for probe integration tests.
//!
//! Provides a scripted fake XMPP server, self-signed TLS credentials and an
//! observer that records probe events.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rcgen::{CertificateParams, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use xmpp_probe::{ProbeConfig, ProbeEvent, ProbeObserver};

/// Install the ring crypto provider for rustls.
/// Must be called once before any TLS operations.
pub fn install_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .expect("Failed to install crypto provider");
    });
}

/// Initialize tracing and crypto provider for tests (only once).
pub fn init_test() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        install_crypto_provider();

        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Expiry date of generated test certificates.
pub const CERT_NOT_AFTER: (i32, u8, u8) = (2090, 1, 1);

pub const TLS_NS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const SASL_NS: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

/// Server stream header for `jabber:client` streams.
pub fn server_header() -> String {
    server_header_with_version(Some("1.0"))
}

pub fn server_header_with_version(version: Option<&str>) -> String {
    let version = version
        .map(|v| format!(" version='{}'", v))
        .unwrap_or_default();
    format!(
        "<?xml version='1.0'?>\
        <stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' \
        id='test-stream' from='localhost'{}>",
        version
    )
}

/// `<stream:features/>` announcing STARTTLS and the given mechanisms.
pub fn features(starttls: Option<bool>, mechanisms: &[&str]) -> String {
    let starttls = match starttls {
        Some(true) => format!("<starttls xmlns='{}'><required/></starttls>", TLS_NS),
        Some(false) => format!("<starttls xmlns='{}'/>", TLS_NS),
        None => String::new(),
    };
    let mechanisms: String = if mechanisms.is_empty() {
        String::new()
    } else {
        format!(
            "<mechanisms xmlns='{}'>{}</mechanisms>",
            SASL_NS,
            mechanisms
                .iter()
                .map(|m| format!("<mechanism>{}</mechanism>", m))
                .collect::<String>()
        )
    };
    format!("<stream:features>{}{}</stream:features>", starttls, mechanisms)
}

pub fn proceed() -> String {
    format!("<proceed xmlns='{}'/>", TLS_NS)
}

/// Probe configuration pointing at a local fake server.
pub fn local_config(addr: SocketAddr) -> ProbeConfig {
    ProbeConfig {
        address: Some(addr.ip().to_string()),
        port: Some(addr.port()),
        timeout_secs: 5,
        ..ProbeConfig::new("localhost")
    }
}

/// Generated TLS credentials for testing.
pub struct TestTlsCredentials {
    pub cert_pem: String,
    pub cert_der: CertificateDer<'static>,
    key_der: Vec<u8>,
}

impl TestTlsCredentials {
    /// Generate self-signed TLS credentials for testing.
    pub fn generate(domain: &str) -> Self {
        let subject_alt_names = vec![domain.to_string()];
        let mut params = CertificateParams::new(subject_alt_names).expect("Invalid certificate params");
        let (year, month, day) = CERT_NOT_AFTER;
        params.not_after = rcgen::date_time_ymd(year, month, day);

        let key_pair = KeyPair::generate().expect("Failed to generate key");
        let cert = params
            .self_signed(&key_pair)
            .expect("Failed to generate test certificate");

        Self {
            cert_pem: cert.pem(),
            cert_der: cert.der().clone(),
            key_der: key_pair.serialize_der(),
        }
    }

    /// Create a TLS acceptor (server-side) from these credentials.
    pub fn tls_acceptor(&self) -> TlsAcceptor {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()));

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![self.cert_der.clone()], key)
            .expect("Failed to create server config");

        TlsAcceptor::from(Arc::new(server_config))
    }

    /// Write the certificate to a PEM file usable as a trust anchor.
    pub fn ca_file(&self) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("Failed to create temp file");
        std::io::Write::write_all(&mut file, self.cert_pem.as_bytes())
            .expect("Failed to write CA file");
        file
    }
}

/// One step of a fake server conversation.
#[derive(Debug, Clone)]
pub enum Step {
    /// Read until the client has sent `pattern`
    Expect(&'static str),
    /// Write raw data
    Send(String),
    /// Pause before the next step
    Sleep(Duration),
    /// Accept a TLS handshake on the connection
    StartTls,
    /// Stop responding but keep the connection open until the client leaves
    Silence,
}

enum ServerStream {
    None,
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ServerStream {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ServerStream::None => Ok(0),
            ServerStream::Tcp(s) => s.read(buf).await,
            ServerStream::Tls(s) => s.read(buf).await,
        }
    }

    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            ServerStream::None => Ok(()),
            ServerStream::Tcp(s) => {
                s.write_all(data).await?;
                s.flush().await
            }
            ServerStream::Tls(s) => {
                s.write_all(data).await?;
                s.flush().await
            }
        }
    }
}

/// Scripted single-connection XMPP server.
pub struct FakeServer {
    pub addr: SocketAddr,
    handle: JoinHandle<Vec<u8>>,
}

impl FakeServer {
    /// Start a server that plays `script` against the first client.
    pub async fn start(script: Vec<Step>) -> Self {
        Self::start_with_tls(script, None).await
    }

    pub async fn start_with_tls(script: Vec<Step>, credentials: Option<Arc<TestTlsCredentials>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().expect("Failed to get local address");

        let handle = tokio::spawn(async move {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return Vec::new(),
            };
            run_script(ServerStream::Tcp(socket), script, credentials).await
        });

        Self { addr, handle }
    }

    /// Wait for the script to finish and return everything the client sent.
    pub async fn finish(self) -> String {
        let received = timeout(DEFAULT_TIMEOUT * 2, self.handle)
            .await
            .expect("Fake server did not finish")
            .expect("Fake server panicked");
        String::from_utf8_lossy(&received).into_owned()
    }
}

async fn run_script(
    mut stream: ServerStream,
    script: Vec<Step>,
    credentials: Option<Arc<TestTlsCredentials>>,
) -> Vec<u8> {
    let mut transcript = Vec::new();
    let mut pending = Vec::new();
    let mut buf = [0u8; 4096];

    for step in script {
        match step {
            Step::Expect(pattern) => loop {
                if let Some(pos) = find(&pending, pattern.as_bytes()) {
                    pending.drain(..pos + pattern.len());
                    break;
                }
                match timeout(DEFAULT_TIMEOUT, stream.read(&mut buf)).await {
                    Ok(Ok(n)) if n > 0 => {
                        transcript.extend_from_slice(&buf[..n]);
                        pending.extend_from_slice(&buf[..n]);
                    }
                    _ => return transcript,
                }
            },
            Step::Send(data) => {
                if stream.write(data.as_bytes()).await.is_err() {
                    return transcript;
                }
            }
            Step::Sleep(duration) => tokio::time::sleep(duration).await,
            Step::StartTls => {
                let acceptor = match &credentials {
                    Some(credentials) => credentials.tls_acceptor(),
                    None => return transcript,
                };
                let tcp = match std::mem::replace(&mut stream, ServerStream::None) {
                    ServerStream::Tcp(s) => s,
                    _ => return transcript,
                };
                match acceptor.accept(tcp).await {
                    Ok(tls) => stream = ServerStream::Tls(Box::new(tls)),
                    Err(_) => return transcript,
                }
                pending.clear();
            }
            Step::Silence => break,
        }
    }

    // Keep the connection open until the client closes it
    loop {
        match timeout(DEFAULT_TIMEOUT * 2, stream.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => transcript.extend_from_slice(&buf[..n]),
            _ => return transcript,
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Observer that keeps every event for later inspection.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ProbeEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ProbeEvent> {
        self.events.lock().expect("observer lock poisoned").clone()
    }

    pub fn count(&self, predicate: impl Fn(&ProbeEvent) -> bool) -> usize {
        self.events().iter().filter(|e| predicate(e)).count()
    }
}

impl ProbeObserver for RecordingObserver {
    fn on_event(&self, event: &ProbeEvent) {
        self.events
            .lock()
            .expect("observer lock poisoned")
            .push(event.clone());
    }
}
