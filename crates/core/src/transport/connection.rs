use peerchat_common::Fingerprint;
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsStream;

/// Every frame on the wire ends with this byte
pub const FRAME_TERMINATOR: u8 = b'\n';

/// SHA-256 fingerprint of a DER certificate
pub fn fingerprint(cert: &CertificateDer<'_>) -> Fingerprint {
    Fingerprint::from_bytes(Sha256::digest(cert.as_ref()).into())
}

/// One TLS connection carrying newline-terminated text frames
pub struct Connection {
    inner: TlsStream<TcpStream>,
    remote_addr: SocketAddr,
}

impl Connection {
    pub(crate) fn new(inner: TlsStream<TcpStream>, remote_addr: SocketAddr) -> Self {
        Self { inner, remote_addr }
    }

    /// Get remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Leaf certificate the peer presented during the handshake, if any
    pub fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        let (_, state) = self.inner.get_ref();
        state
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.clone().into_owned())
    }

    /// Fingerprint of the peer's leaf certificate, if any
    pub fn peer_fingerprint(&self) -> Option<Fingerprint> {
        self.peer_certificate().as_ref().map(fingerprint)
    }

    /// Read one frame of at most `max_len` bytes, terminator excluded.
    ///
    /// A frame must end with [`FRAME_TERMINATOR`] and be valid UTF-8.
    pub async fn read_frame(&mut self, max_len: usize, wait: Duration) -> Result<String, ConnectionError> {
        timeout(wait, read_frame(&mut self.inner, max_len))
            .await
            .map_err(|_| ConnectionError::Timeout)?
    }

    /// Write one frame and flush it
    pub async fn write_frame(&mut self, frame: &str, wait: Duration) -> Result<(), ConnectionError> {
        if frame.as_bytes().contains(&FRAME_TERMINATOR) {
            return Err(ConnectionError::EmbeddedTerminator);
        }

        let mut bytes = Vec::with_capacity(frame.len() + 1);
        bytes.extend_from_slice(frame.as_bytes());
        bytes.push(FRAME_TERMINATOR);

        timeout(wait, async {
            self.inner.write_all(&bytes).await?;
            self.inner.flush().await
        })
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(|e| ConnectionError::Write(e.to_string()))
    }

    /// Send close_notify and shut the socket down
    pub async fn close(mut self) {
        if let Err(e) = self.inner.shutdown().await {
            tracing::debug!("shutdown of {} failed: {}", self.remote_addr, e);
        }
    }
}

/// Read a single terminated frame from any async reader
pub async fn read_frame<R>(reader: R, max_len: usize) -> Result<String, ConnectionError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut limited = BufReader::new(reader.take(max_len as u64 + 1));
    let mut buf = Vec::with_capacity(64);

    let n = limited
        .read_until(FRAME_TERMINATOR, &mut buf)
        .await
        .map_err(|e| ConnectionError::Read(e.to_string()))?;

    if n == 0 {
        return Err(ConnectionError::Empty);
    }
    if buf.last() != Some(&FRAME_TERMINATOR) {
        return Err(if n > max_len {
            ConnectionError::FrameTooLong(max_len)
        } else {
            ConnectionError::Truncated
        });
    }

    buf.pop();
    String::from_utf8(buf).map_err(|_| ConnectionError::InvalidUtf8)
}

/// Connection errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Read error: {0}")]
    Read(String),

    #[error("Write error: {0}")]
    Write(String),

    #[error("Peer closed before sending a frame")]
    Empty,

    #[error("Frame ended without terminator")]
    Truncated,

    #[error("Frame longer than {0} bytes")]
    FrameTooLong(usize),

    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("Frame contains a line terminator")]
    EmbeddedTerminator,

    #[error("Timed out")]
    Timeout,
}
