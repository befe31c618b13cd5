use super::protocol::{SendRequest, SendResponse};
use crate::directory::{connection_error, endpoint_error, DirectoryClient};
use crate::history::{HistoryStore, MessageId};
use crate::transport::Connector;
use peerchat_common::config::protocol::MAX_MESSAGE_FRAME;
use peerchat_common::{ChatError, Direction, Result, Username};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Sends chat messages: resolve the recipient, connect, send one line
pub struct PeerMessagingClient {
    username: Username,
    directory: DirectoryClient,
    connector: Connector,
    peer_port: u16,
    history: Arc<dyn HistoryStore>,
    io_timeout: Duration,
}

impl PeerMessagingClient {
    pub fn new(
        username: Username,
        directory: DirectoryClient,
        connector: Connector,
        peer_port: u16,
        history: Arc<dyn HistoryStore>,
        io_timeout: Duration,
    ) -> Self {
        Self {
            username,
            directory,
            connector,
            peer_port,
            history,
            io_timeout,
        }
    }

    /// Our own username, sent as the claimed sender of every message
    pub fn username(&self) -> &Username {
        &self.username
    }

    /// Register our current address with the directory
    pub async fn register(&self) -> Result<()> {
        self.directory.update(&self.username).await?;
        info!("Registered {} with directory {}", self.username, self.directory.server());
        Ok(())
    }

    /// Send `content` to `recipient` and record it locally once accepted
    pub async fn send(&self, recipient: &Username, content: &str) -> Result<MessageId> {
        let request = SendRequest::new(self.username.clone(), content)
            .map_err(|e| ChatError::protocol(e.to_string()))?;

        let address = self.directory.fetch(recipient).await?;
        let peer = SocketAddr::new(address, self.peer_port);
        debug!("Resolved {} to {}", recipient, peer);

        let mut conn = self.connector.connect(peer).await.map_err(endpoint_error)?;
        conn.write_frame(&request.encode(), self.io_timeout)
            .await
            .map_err(connection_error)?;
        let line = conn
            .read_frame(MAX_MESSAGE_FRAME, self.io_timeout)
            .await
            .map_err(connection_error)?;
        conn.close().await;

        match SendResponse::parse(&line).map_err(|e| ChatError::protocol(e.to_string()))? {
            SendResponse::Accepted => {
                let id = self
                    .history
                    .append(recipient, Direction::Sent, content)
                    .map_err(|e| ChatError::storage(e.to_string()))?;
                info!("Message {} delivered to {}", id, recipient);
                Ok(id)
            }
            SendResponse::Rejected => {
                warn!("{} rejected our message", recipient);
                Err(ChatError::IdentityRejected(recipient.to_string()))
            }
        }
    }
}
