use super::protocol::{SendRequest, SendResponse};
use crate::shutdown::Shutdown;
use crate::transport::{server_config, ConnectionError, EndpointError, Listener, PendingHandshake, TlsIdentity};
use crate::trust::{TrustDecision, TrustStore};
use peerchat_common::config::protocol::MAX_MESSAGE_FRAME;
use peerchat_common::{Direction, Fingerprint, PeerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Checks the sender of each message against its pinned certificate and
/// stores accepted messages
#[derive(Clone)]
pub struct MessageHandler {
    trust: Arc<TrustStore>,
}

impl MessageHandler {
    pub fn new(trust: Arc<TrustStore>) -> Self {
        Self { trust }
    }

    /// Decide on one message. Blocking: the trust and history stores may
    /// touch the filesystem.
    pub fn handle(&self, request: &SendRequest, fingerprint: Option<Fingerprint>) -> SendResponse {
        let sender = &request.username;
        let Some(fingerprint) = fingerprint else {
            warn!("Message claiming {} arrived without a certificate", sender);
            return SendResponse::Rejected;
        };

        match self.trust.verify_or_pin(sender, fingerprint) {
            Ok(TrustDecision::Mismatch { .. }) => {
                warn!("Rejected message claiming {}: certificate does not match pin", sender);
                return SendResponse::Rejected;
            }
            Ok(TrustDecision::FirstUse) => info!("First contact from {}", sender),
            Ok(TrustDecision::Match) => {}
            Err(e) => {
                error!("Trust check for {} failed: {}", sender, e);
                return SendResponse::Rejected;
            }
        }

        match self.trust.store().append(sender, Direction::Received, &request.content) {
            Ok(id) => {
                debug!("Stored message {} from {}", id, sender);
                SendResponse::Accepted
            }
            Err(e) => {
                error!("Failed to store message from {}: {}", sender, e);
                SendResponse::Rejected
            }
        }
    }
}

/// TLS server receiving chat messages from other peers
pub struct PeerMessagingService {
    listener: Listener,
    handler: MessageHandler,
    poll_interval: Duration,
    io_timeout: Duration,
}

impl PeerMessagingService {
    pub async fn bind(
        config: &PeerConfig,
        identity: &TlsIdentity,
        trust: Arc<TrustStore>,
    ) -> Result<Self, MessagingError> {
        let tls = server_config(identity)?;
        let listener = Listener::bind(config.listen_socket(), tls, config.io_timeout()).await?;
        info!("Messaging service listening on {}", listener.local_addr());

        Ok(Self {
            listener,
            handler: MessageHandler::new(trust),
            poll_interval: config.accept_poll_interval(),
            io_timeout: config.io_timeout(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` triggers, then wait for in-flight connections
    pub async fn run(self, shutdown: Shutdown) -> Result<(), MessagingError> {
        let mut tasks = JoinSet::new();

        while !shutdown.is_triggered() {
            while tasks.try_join_next().is_some() {}

            let Some((stream, remote)) = self.listener.next_connection(self.poll_interval).await else {
                continue;
            };

            debug!("Accepted message connection from {}", remote);
            let pending = self.listener.handshake(stream, remote);
            let handler = self.handler.clone();
            let io_timeout = self.io_timeout;

            tasks.spawn(async move {
                if let Err(e) = serve_connection(pending, handler, io_timeout).await {
                    debug!("Message connection from {} dropped: {}", remote, e);
                }
            });
        }

        info!("Messaging service shutting down, draining {} connection(s)", tasks.len());
        while tasks.join_next().await.is_some() {}
        Ok(())
    }
}

async fn serve_connection(
    pending: PendingHandshake,
    handler: MessageHandler,
    io_timeout: Duration,
) -> Result<(), MessagingError> {
    let mut conn = pending.complete().await?;
    let line = conn.read_frame(MAX_MESSAGE_FRAME, io_timeout).await?;

    let response = match SendRequest::parse(&line) {
        Ok(request) => {
            let fingerprint = conn.peer_fingerprint();
            tokio::task::spawn_blocking(move || handler.handle(&request, fingerprint))
                .await
                .unwrap_or(SendResponse::Rejected)
        }
        Err(e) => {
            debug!("Malformed message from {}: {}", conn.remote_addr(), e);
            SendResponse::Rejected
        }
    };

    conn.write_frame(response.encode(), io_timeout).await?;
    conn.close().await;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}
