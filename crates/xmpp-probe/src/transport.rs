//! Byte transport over plain TCP or TLS.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::ClientConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument};

use crate::error::ProbeError;
use crate::tls;

/// Read buffer size for a single socket read
const READ_CHUNK_SIZE: usize = 4096;

/// Upper bound for sending close_notify / FIN on close
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Default)]
enum StreamInner {
    #[default]
    None,
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// A connection to the server, upgradable to TLS in place.
pub struct Transport {
    inner: StreamInner,
    peer: SocketAddr,
    closed: bool,
}

impl Transport {
    /// Connect to the first address that accepts a connection.
    #[instrument(skip_all, name = "transport.open")]
    pub async fn open(addresses: &[SocketAddr]) -> Result<Self, ProbeError> {
        let mut last_error = None;

        for address in addresses {
            match TcpStream::connect(address).await {
                Ok(stream) => {
                    debug!(address = %address, "TCP connection established");
                    return Ok(Self {
                        inner: StreamInner::Tcp(stream),
                        peer: *address,
                        closed: false,
                    });
                }
                Err(e) => {
                    debug!(address = %address, error = %e, "Connection attempt failed");
                    last_error = Some(format!("{}: {}", address, e));
                }
            }
        }

        Err(ProbeError::Connection(match last_error {
            Some(e) => format!("no reachable address (last error {})", e),
            None => "no candidate addresses".to_string(),
        }))
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.inner, StreamInner::Tls(_))
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ProbeError> {
        match &mut self.inner {
            StreamInner::None => Err(ProbeError::Connection("transport is closed".into())),
            StreamInner::Tcp(s) => Ok(s.read(buf).await?),
            StreamInner::Tls(s) => Ok(s.read(buf).await?),
        }
    }

    /// Write all bytes and flush.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), ProbeError> {
        match &mut self.inner {
            StreamInner::None => Err(ProbeError::Connection("transport is closed".into())),
            StreamInner::Tcp(s) => {
                s.write_all(data).await?;
                Ok(s.flush().await?)
            }
            StreamInner::Tls(s) => {
                s.write_all(data).await?;
                Ok(s.flush().await?)
            }
        }
    }

    /// Wait up to `wait` for data, then drain what is immediately available.
    ///
    /// Returns an empty buffer when nothing arrived in time. A connection
    /// closed by the peer before any data arrived is an error.
    pub async fn receive_available(&mut self, wait: Duration) -> Result<Vec<u8>, ProbeError> {
        let mut buf = [0u8; READ_CHUNK_SIZE];

        let n = match tokio::time::timeout(wait, self.read(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => return Ok(Vec::new()),
        };
        if n == 0 {
            return Err(ProbeError::protocol("connection closed by peer"));
        }

        let mut data = buf[..n].to_vec();
        loop {
            match self.read(&mut buf).now_or_never() {
                Some(Ok(0)) | None => break,
                Some(Ok(n)) => data.extend_from_slice(&buf[..n]),
                Some(Err(e)) => return Err(e),
            }
        }

        Ok(data)
    }

    /// Replace the TCP stream with a TLS session over it.
    #[instrument(skip(self, config), name = "transport.upgrade_to_tls")]
    pub async fn upgrade_to_tls(
        &mut self,
        config: Arc<ClientConfig>,
        server_name: &str,
    ) -> Result<(), ProbeError> {
        let name = ServerName::try_from(server_name)
            .map_err(|e| ProbeError::tls_handshake(format!("Invalid server name {}: {}", server_name, e)))?
            .to_owned();

        // Take ownership of the TCP stream
        let tcp_stream = match std::mem::take(&mut self.inner) {
            StreamInner::Tcp(s) => s,
            StreamInner::Tls(s) => {
                self.inner = StreamInner::Tls(s);
                return Err(ProbeError::tls_handshake("Already using TLS"));
            }
            StreamInner::None => {
                return Err(ProbeError::Connection("transport is closed".into()))
            }
        };

        let tls_stream = TlsConnector::from(config)
            .connect(name, tcp_stream)
            .await
            .map_err(handshake_error)?;

        self.inner = StreamInner::Tls(Box::new(tls_stream));
        debug!("TLS upgrade complete");
        Ok(())
    }

    /// The server's leaf certificate once TLS is established.
    pub fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        match &self.inner {
            StreamInner::Tls(s) => s
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| cert.clone().into_owned()),
            _ => None,
        }
    }

    /// Shut the connection down. Returns `false` if it was already closed.
    pub async fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;

        let result = match std::mem::take(&mut self.inner) {
            StreamInner::None => return true,
            StreamInner::Tcp(mut s) => tokio::time::timeout(SHUTDOWN_TIMEOUT, s.shutdown()).await,
            StreamInner::Tls(mut s) => tokio::time::timeout(SHUTDOWN_TIMEOUT, s.shutdown()).await,
        };
        match result {
            Ok(Ok(())) => debug!(peer = %self.peer, "Connection closed"),
            Ok(Err(e)) => debug!(peer = %self.peer, error = %e, "Error shutting down connection"),
            Err(_) => debug!(peer = %self.peer, "Timed out shutting down connection"),
        }
        true
    }
}

/// Classify a failed handshake by the underlying rustls error.
fn handshake_error(error: io::Error) -> ProbeError {
    match error
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        Some(tls_error) if tls::is_certificate_error(tls_error) => {
            ProbeError::TlsCertificate(tls_error.to_string())
        }
        Some(tls_error) => ProbeError::tls_handshake(tls_error.to_string()),
        None => ProbeError::tls_handshake(error.to_string()),
    }
}
