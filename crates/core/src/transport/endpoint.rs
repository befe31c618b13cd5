use super::Connection;
use peerchat_common::config::protocol::TLS_SERVER_NAME;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::warn;

/// Certificate chain and private key this process presents in handshakes
#[derive(Debug)]
pub struct TlsIdentity {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl TlsIdentity {
    /// Load PEM encoded certificate chain and private key files
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, EndpointError> {
        let mut cert_reader = BufReader::new(File::open(cert_path).map_err(|e| {
            EndpointError::Identity(format!("cannot open {}: {}", cert_path.display(), e))
        })?);
        let cert_chain = rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EndpointError::Identity(format!("bad certificate PEM: {}", e)))?;
        if cert_chain.is_empty() {
            return Err(EndpointError::Identity(format!(
                "no certificate found in {}",
                cert_path.display()
            )));
        }

        let mut key_reader = BufReader::new(File::open(key_path).map_err(|e| {
            EndpointError::Identity(format!("cannot open {}: {}", key_path.display(), e))
        })?);
        let key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|e| EndpointError::Identity(format!("bad key PEM: {}", e)))?
            .ok_or_else(|| {
                EndpointError::Identity(format!("no private key found in {}", key_path.display()))
            })?;

        Ok(Self { cert_chain, key })
    }

    /// Generate a fresh self-signed identity
    pub fn generate(subject: &str) -> Result<Self, EndpointError> {
        let (identity, _, _) = Self::generate_pem(subject)?;
        Ok(identity)
    }

    /// Generate a self-signed identity and write it as PEM files
    pub fn generate_to_files(
        subject: &str,
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<Self, EndpointError> {
        let (identity, cert_pem, key_pem) = Self::generate_pem(subject)?;

        for path in [cert_path, key_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(cert_path, cert_pem)?;
        std::fs::write(key_path, key_pem)?;
        restrict_permissions(key_path)?;

        Ok(identity)
    }

    fn generate_pem(subject: &str) -> Result<(Self, String, String), EndpointError> {
        let cert = rcgen::generate_simple_self_signed(vec![
            subject.to_string(),
            TLS_SERVER_NAME.to_string(),
        ])
        .map_err(|e| EndpointError::CertGeneration(e.to_string()))?;

        let cert_pem = cert.cert.pem();
        let key_pem = cert.key_pair.serialize_pem();
        let identity = Self {
            cert_chain: vec![cert.cert.der().clone()],
            key: PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()).into(),
        };

        Ok((identity, cert_pem, key_pem))
    }

    /// Leaf certificate, the one peers fingerprint
    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.cert_chain[0]
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Server side TLS configuration.
///
/// The client certificate is requested but optional at the TLS layer; the
/// services decide what a missing certificate means.
pub fn server_config(identity: &TlsIdentity) -> Result<Arc<rustls::ServerConfig>, EndpointError> {
    let provider = provider();
    let verifier = AcceptAnyClientCert {
        algorithms: provider.signature_verification_algorithms,
    };

    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| EndpointError::ConfigCreation(format!("Failed to set protocol versions: {:?}", e)))?
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(identity.cert_chain.clone(), identity.key.clone_key())
        .map_err(|e| EndpointError::ConfigCreation(e.to_string()))?;

    Ok(Arc::new(config))
}

/// Client side TLS configuration, always presenting our certificate
pub fn client_config(identity: &TlsIdentity) -> Result<Arc<rustls::ClientConfig>, EndpointError> {
    let provider = provider();
    let verifier = AcceptAnyServerCert {
        algorithms: provider.signature_verification_algorithms,
    };

    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| EndpointError::ConfigCreation(format!("Failed to set protocol versions: {:?}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(identity.cert_chain.clone(), identity.key.clone_key())
        .map_err(|e| EndpointError::ConfigCreation(e.to_string()))?;

    Ok(Arc::new(config))
}

/// TLS listener whose accept wait is bounded, so callers can poll a
/// shutdown flag between waits
pub struct Listener {
    inner: TcpListener,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind a listening socket. Failure here is a startup fault.
    pub async fn bind(
        addr: SocketAddr,
        config: Arc<rustls::ServerConfig>,
        handshake_timeout: Duration,
    ) -> Result<Self, EndpointError> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|e| EndpointError::BindFailed(format!("{}: {}", addr, e)))?;
        let local_addr = inner.local_addr()?;

        Ok(Self {
            inner,
            acceptor: TlsAcceptor::from(config),
            handshake_timeout,
            local_addr,
        })
    }

    /// Wait up to `wait` for a TCP connection. `Ok(None)` means the wait
    /// elapsed with nothing to accept.
    pub async fn accept_within(
        &self,
        wait: Duration,
    ) -> Result<Option<(TcpStream, SocketAddr)>, EndpointError> {
        match timeout(wait, self.inner.accept()).await {
            Err(_) => Ok(None),
            Ok(Ok(accepted)) => Ok(Some(accepted)),
            Ok(Err(e)) => Err(EndpointError::AcceptFailed(e.to_string())),
        }
    }

    /// Accept loop step: wait up to `wait` for a connection. An accept
    /// error (e.g. out of file descriptors) is logged and followed by a
    /// pause of `wait`, so a persistent fault cannot spin the loop.
    pub async fn next_connection(&self, wait: Duration) -> Option<(TcpStream, SocketAddr)> {
        back_off_on_error(self.accept_within(wait).await, wait).await
    }

    /// Run the server half of the TLS handshake on an accepted socket
    pub fn handshake(&self, stream: TcpStream, remote_addr: SocketAddr) -> PendingHandshake {
        PendingHandshake {
            acceptor: self.acceptor.clone(),
            stream,
            remote_addr,
            timeout: self.handshake_timeout,
        }
    }

    /// Get local address.
    /// If bound to an unspecified address, returns loopback instead for local connections
    pub fn local_addr(&self) -> SocketAddr {
        let mut addr = self.local_addr;
        if addr.ip().is_unspecified() {
            let loopback = match addr {
                SocketAddr::V4(_) => std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
                SocketAddr::V6(_) => std::net::IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
            };
            addr.set_ip(loopback);
        }
        addr
    }
}

async fn back_off_on_error<T>(result: Result<Option<T>, EndpointError>, wait: Duration) -> Option<T> {
    match result {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!("{}; retrying in {:?}", e, wait);
            tokio::time::sleep(wait).await;
            None
        }
    }
}

/// An accepted socket whose handshake has not run yet. Owned, so it can be
/// moved into a per-connection task.
pub struct PendingHandshake {
    acceptor: TlsAcceptor,
    stream: TcpStream,
    remote_addr: SocketAddr,
    timeout: Duration,
}

impl PendingHandshake {
    pub async fn complete(self) -> Result<Connection, EndpointError> {
        let tls = timeout(self.timeout, self.acceptor.accept(self.stream))
            .await
            .map_err(|_| EndpointError::HandshakeTimeout)?
            .map_err(|e| EndpointError::HandshakeFailed(e.to_string()))?;

        Ok(Connection::new(tls.into(), self.remote_addr))
    }
}

/// Opens outbound TLS connections
#[derive(Clone)]
pub struct Connector {
    inner: TlsConnector,
    timeout: Duration,
}

impl Connector {
    pub fn new(config: Arc<rustls::ClientConfig>, timeout: Duration) -> Self {
        Self {
            inner: TlsConnector::from(config),
            timeout,
        }
    }

    /// Connect and complete the handshake within the configured timeout
    pub async fn connect(&self, addr: SocketAddr) -> Result<Connection, EndpointError> {
        let tcp = timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| EndpointError::ConnectTimeout(addr))?
            .map_err(|e| EndpointError::ConnectionFailed(format!("{}: {}", addr, e)))?;

        let server_name = ServerName::try_from(TLS_SERVER_NAME)
            .map_err(|e| EndpointError::ConfigCreation(e.to_string()))?;

        let tls = timeout(self.timeout, self.inner.connect(server_name, tcp))
            .await
            .map_err(|_| EndpointError::HandshakeTimeout)?
            .map_err(|e| EndpointError::HandshakeFailed(e.to_string()))?;

        Ok(Connection::new(tls.into(), addr))
    }
}

/// Accepts any client certificate without chain validation. There is no
/// CA; identities are pinned per username instead. Handshake signatures are
/// still verified, which proves the client holds the certificate's key.
#[derive(Debug)]
struct AcceptAnyClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Server side counterpart of [`AcceptAnyClientCert`]
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Endpoint errors
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    #[error("Failed to load identity: {0}")]
    Identity(String),

    #[error("Failed to generate certificate: {0}")]
    CertGeneration(String),

    #[error("Failed to create config: {0}")]
    ConfigCreation(String),

    #[error("Failed to accept connection: {0}")]
    AcceptFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timed out connecting to {0}")]
    ConnectTimeout(SocketAddr),

    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("TLS handshake timed out")]
    HandshakeTimeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn listener_for(identity: &TlsIdentity) -> Listener {
        let config = server_config(identity).unwrap();
        Listener::bind("127.0.0.1:0".parse().unwrap(), config, TIMEOUT)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_listener_bind() {
        let identity = TlsIdentity::generate("server").unwrap();
        let listener = listener_for(&identity).await;

        assert_ne!(listener.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_accept_within_times_out() {
        let identity = TlsIdentity::generate("server").unwrap();
        let listener = listener_for(&identity).await;

        let accepted = listener
            .accept_within(Duration::from_millis(50))
            .await
            .unwrap();
        assert!(accepted.is_none());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_error() {
        let identity = TlsIdentity::generate("server").unwrap();
        let first = listener_for(&identity).await;

        let config = server_config(&identity).unwrap();
        let second = Listener::bind(first.local_addr(), config, TIMEOUT).await;
        assert!(matches!(second, Err(EndpointError::BindFailed(_))));
    }

    #[tokio::test]
    async fn test_handshake_exposes_client_certificate() {
        let server_identity = TlsIdentity::generate("server").unwrap();
        let client_identity = TlsIdentity::generate("client").unwrap();
        let listener = listener_for(&server_identity).await;
        let addr = listener.local_addr();

        let accept_task = tokio::spawn(async move {
            let (stream, remote) = listener.accept_within(TIMEOUT).await.unwrap().unwrap();
            listener.handshake(stream, remote).complete().await
        });

        let connector = Connector::new(client_config(&client_identity).unwrap(), TIMEOUT);
        let client_conn = connector.connect(addr).await.unwrap();
        let server_conn = accept_task.await.unwrap().unwrap();

        assert_eq!(client_conn.remote_addr(), addr);
        assert_eq!(
            server_conn.peer_certificate().as_ref(),
            Some(client_identity.certificate())
        );
        assert_eq!(
            client_conn.peer_certificate().as_ref(),
            Some(server_identity.certificate())
        );
    }

    #[tokio::test]
    async fn test_connect_refused_is_error() {
        let identity = TlsIdentity::generate("client").unwrap();
        let listener = listener_for(&identity).await;
        let addr = listener.local_addr();
        drop(listener);

        let connector = Connector::new(client_config(&identity).unwrap(), TIMEOUT);
        assert!(connector.connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_accept_error_backs_off() {
        let wait = Duration::from_millis(50);
        let started = std::time::Instant::now();
        let failed: Result<Option<()>, _> = Err(EndpointError::AcceptFailed("too many open files".into()));

        assert!(back_off_on_error(failed, wait).await.is_none());
        assert!(started.elapsed() >= wait);

        // a successful accept passes straight through
        let started = std::time::Instant::now();
        assert_eq!(back_off_on_error(Ok(Some(7)), wait).await, Some(7));
        assert!(started.elapsed() < wait);
    }

    #[test]
    fn test_identity_files_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");

        let generated = TlsIdentity::generate_to_files("alice", &cert_path, &key_path).unwrap();
        let loaded = TlsIdentity::load(&cert_path, &key_path).unwrap();

        assert_eq!(loaded.certificate(), generated.certificate());
        assert!(server_config(&loaded).is_ok());
    }

    #[test]
    fn test_missing_identity_files() {
        let dir = tempfile::tempdir().unwrap();
        let result = TlsIdentity::load(&dir.path().join("cert.pem"), &dir.path().join("key.pem"));
        assert!(matches!(result, Err(EndpointError::Identity(_))));
    }
}
