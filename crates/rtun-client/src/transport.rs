//! Connection establishment.
//!
//! Sessions never open sockets directly; they go through a [`Dialer`]. The
//! production [`TlsDialer`] opens TLS connections to the tunnel server and
//! plain or TLS connections to local services. Tests substitute in-memory
//! pipes.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use rtun_core::{TunnelError, TunnelResult};

/// A bidirectional byte stream (TCP, TLS over TCP, or an in-memory pipe).
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

pub type DialFuture<'a> = Pin<Box<dyn Future<Output = io::Result<BoxedStream>> + Send + 'a>>;

/// Opens the connections a session needs.
pub trait Dialer: Send + Sync {
    /// Connect to the tunnel server at `addr` (`host:port`).
    fn dial_server<'a>(&'a self, addr: &'a str) -> DialFuture<'a>;

    /// Connect to a local service on `127.0.0.1:port`, with TLS if `tls`.
    fn dial_local(&self, port: u16, tls: bool) -> DialFuture<'_>;
}

/// Dialer backed by tokio TCP sockets and rustls.
///
/// Server certificates are NOT verified, for the tunnel server and for local
/// HTTPS services alike.
#[derive(Clone)]
pub struct TlsDialer {
    connector: TlsConnector,
}

impl TlsDialer {
    pub fn new() -> TunnelResult<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TunnelError::Transport(format!("TLS config error: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth();

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    async fn connect_tls(&self, addr: &str, host: &str) -> io::Result<BoxedStream> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let tcp = connect_tcp(addr).await?;
        let tls = self.connector.connect(server_name, tcp).await?;
        Ok(Box::new(tls))
    }
}

impl Dialer for TlsDialer {
    fn dial_server<'a>(&'a self, addr: &'a str) -> DialFuture<'a> {
        Box::pin(async move {
            let host = host_of(addr);
            let stream = self.connect_tls(addr, host).await?;
            tracing::debug!(addr, "TLS connection to server established");
            Ok(stream)
        })
    }

    fn dial_local(&self, port: u16, tls: bool) -> DialFuture<'_> {
        Box::pin(async move {
            let addr = format!("127.0.0.1:{port}");
            if tls {
                self.connect_tls(&addr, "127.0.0.1").await
            } else {
                let tcp = connect_tcp(&addr).await?;
                Ok(Box::new(tcp) as BoxedStream)
            }
        })
    }
}

async fn connect_tcp(addr: &str) -> io::Result<TcpStream> {
    let tcp = TcpStream::connect(addr).await?;
    tcp.set_nodelay(true)?;
    Ok(tcp)
}

/// Host part of a `host:port` address (brackets stripped from IPv6 literals).
fn host_of(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Certificate verifier that accepts any server certificate.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}
