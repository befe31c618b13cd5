use super::protocol::{DirectoryRequest, DirectoryResponse};
use crate::transport::{ConnectionError, Connector, EndpointError};
use peerchat_common::config::protocol::MAX_DIRECTORY_FRAME;
use peerchat_common::{ChatError, Result, Username};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::debug;

/// Short-lived client of the directory server.
///
/// Every call opens a fresh TLS connection, sends one request and reads one
/// response.
#[derive(Clone)]
pub struct DirectoryClient {
    connector: Connector,
    server: SocketAddr,
    io_timeout: Duration,
}

impl DirectoryClient {
    pub fn new(connector: Connector, server: SocketAddr, io_timeout: Duration) -> Self {
        Self {
            connector,
            server,
            io_timeout,
        }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Register this peer's transport address under `username`
    pub async fn update(&self, username: &Username) -> Result<()> {
        match self.exchange(&DirectoryRequest::Update(username.clone())).await? {
            DirectoryResponse::Ok => Ok(()),
            DirectoryResponse::Error => Err(ChatError::protocol(format!(
                "directory refused update for {}",
                username
            ))),
            other => Err(ChatError::protocol(format!("unexpected update response {}", other))),
        }
    }

    /// Resolve `username` to its registered address
    pub async fn fetch(&self, username: &Username) -> Result<IpAddr> {
        match self.exchange(&DirectoryRequest::Fetch(username.clone())).await? {
            DirectoryResponse::Address(address) => Ok(address),
            DirectoryResponse::Error => Err(ChatError::UserNotFound(username.to_string())),
            DirectoryResponse::Ok => Err(ChatError::protocol("unexpected fetch response K")),
        }
    }

    async fn exchange(&self, request: &DirectoryRequest) -> Result<DirectoryResponse> {
        let mut conn = self.connector.connect(self.server).await.map_err(endpoint_error)?;
        conn.write_frame(&request.encode(), self.io_timeout)
            .await
            .map_err(connection_error)?;
        let line = conn
            .read_frame(MAX_DIRECTORY_FRAME, self.io_timeout)
            .await
            .map_err(connection_error)?;
        conn.close().await;

        debug!("Directory {} -> {}", request, line);
        DirectoryResponse::parse(&line).map_err(|e| ChatError::protocol(e.to_string()))
    }
}

pub(crate) fn endpoint_error(e: EndpointError) -> ChatError {
    match e {
        EndpointError::ConnectTimeout(_) | EndpointError::HandshakeTimeout => ChatError::Timeout,
        other => ChatError::network(other.to_string()),
    }
}

pub(crate) fn connection_error(e: ConnectionError) -> ChatError {
    match e {
        ConnectionError::Timeout => ChatError::Timeout,
        ConnectionError::Read(_) | ConnectionError::Write(_) => ChatError::network(e.to_string()),
        other => ChatError::protocol(other.to_string()),
    }
}
