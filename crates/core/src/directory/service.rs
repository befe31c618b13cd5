use super::protocol::{DirectoryRequest, DirectoryResponse};
use super::table::{AddressTable, InsertOutcome};
use crate::shutdown::Shutdown;
use crate::transport::{server_config, ConnectionError, EndpointError, Listener, PendingHandshake, TlsIdentity};
use crate::trust::{TrustDecision, TrustStore};
use peerchat_common::config::protocol::MAX_DIRECTORY_FRAME;
use peerchat_common::{DirectoryConfig, Fingerprint};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Applies decoded requests to the shared table.
///
/// Cheap to clone; one copy moves into every connection task.
#[derive(Clone)]
pub struct DirectoryHandler {
    table: Arc<RwLock<AddressTable>>,
    pins: Option<Arc<TrustStore>>,
}

impl DirectoryHandler {
    pub fn new(table: Arc<RwLock<AddressTable>>, pins: Option<Arc<TrustStore>>) -> Self {
        Self { table, pins }
    }

    /// Answer one request from `peer_ip`, which presented `fingerprint`
    pub async fn handle(
        &self,
        request: &DirectoryRequest,
        peer_ip: IpAddr,
        fingerprint: Option<Fingerprint>,
    ) -> DirectoryResponse {
        match request {
            DirectoryRequest::Update(username) => {
                if let Some(pins) = &self.pins {
                    let Some(fingerprint) = fingerprint else {
                        warn!("Update for {} from {} without a certificate", username, peer_ip);
                        return DirectoryResponse::Error;
                    };
                    // the pin store may be file backed
                    let pins = pins.clone();
                    let owner = username.clone();
                    let decision =
                        tokio::task::spawn_blocking(move || pins.verify_or_pin(&owner, fingerprint)).await;

                    match decision {
                        Ok(Ok(TrustDecision::Mismatch { .. })) => {
                            warn!("Rejected update for {} from {}: certificate mismatch", username, peer_ip);
                            return DirectoryResponse::Error;
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => {
                            error!("Pin check for {} failed: {}", username, e);
                            return DirectoryResponse::Error;
                        }
                        Err(e) => {
                            error!("Pin check for {} panicked: {}", username, e);
                            return DirectoryResponse::Error;
                        }
                    }
                }

                let address = peer_ip.to_canonical();
                let mut table = self.table.write().await;
                match table.insert(username.clone(), address) {
                    Ok(InsertOutcome::Inserted) => {
                        info!("Registered {} at {}", username, address);
                        DirectoryResponse::Ok
                    }
                    Ok(InsertOutcome::Updated) => {
                        info!("Updated {} to {}", username, address);
                        DirectoryResponse::Ok
                    }
                    Err(e) => {
                        warn!("Update for {} failed: {}", username, e);
                        DirectoryResponse::Error
                    }
                }
            }
            DirectoryRequest::Fetch(username) => match self.table.read().await.get(username) {
                Some(address) => {
                    debug!("Fetch {} -> {}", username, address);
                    DirectoryResponse::Address(address)
                }
                None => {
                    debug!("Fetch {}: not found", username);
                    DirectoryResponse::Error
                }
            },
        }
    }
}

/// TLS directory server: one request and one response per connection
pub struct DirectoryService {
    listener: Listener,
    handler: DirectoryHandler,
    table: Arc<RwLock<AddressTable>>,
    poll_interval: Duration,
    io_timeout: Duration,
}

impl DirectoryService {
    /// Bind the listening socket. Any failure here is fatal to the caller.
    pub async fn bind(
        config: &DirectoryConfig,
        table: AddressTable,
        identity: &TlsIdentity,
        pins: Option<Arc<TrustStore>>,
    ) -> Result<Self, DirectoryError> {
        let tls = server_config(identity)?;
        let listener = Listener::bind(config.listen_socket(), tls, config.io_timeout()).await?;
        let table = Arc::new(RwLock::new(table));

        info!(
            "Directory listening on {} (pinning {})",
            listener.local_addr(),
            if pins.is_some() { "on" } else { "off" }
        );

        Ok(Self {
            listener,
            handler: DirectoryHandler::new(table.clone(), pins),
            table,
            poll_interval: config.accept_poll_interval(),
            io_timeout: config.io_timeout(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Shared table handle, valid after [`run`](Self::run) returns
    pub fn table(&self) -> Arc<RwLock<AddressTable>> {
        self.table.clone()
    }

    /// Serve until `shutdown` triggers, then wait for in-flight connections
    pub async fn run(self, shutdown: Shutdown) -> Result<(), DirectoryError> {
        let mut tasks = JoinSet::new();

        while !shutdown.is_triggered() {
            // reap finished connections so the set stays small
            while tasks.try_join_next().is_some() {}

            let Some((stream, remote)) = self.listener.next_connection(self.poll_interval).await else {
                continue;
            };

            debug!("Accepted directory connection from {}", remote);
            let pending = self.listener.handshake(stream, remote);
            let handler = self.handler.clone();
            let io_timeout = self.io_timeout;

            tasks.spawn(async move {
                if let Err(e) = serve_connection(pending, handler, io_timeout).await {
                    debug!("Directory connection from {} dropped: {}", remote, e);
                }
            });
        }

        info!("Directory shutting down, draining {} connection(s)", tasks.len());
        while tasks.join_next().await.is_some() {}
        Ok(())
    }
}

async fn serve_connection(
    pending: PendingHandshake,
    handler: DirectoryHandler,
    io_timeout: Duration,
) -> Result<(), DirectoryError> {
    let mut conn = pending.complete().await?;
    let line = conn.read_frame(MAX_DIRECTORY_FRAME, io_timeout).await?;

    let response = match DirectoryRequest::parse(&line) {
        Ok(request) => {
            handler
                .handle(&request, conn.remote_addr().ip(), conn.peer_fingerprint())
                .await
        }
        Err(e) => {
            debug!("Malformed directory request from {}: {}", conn.remote_addr(), e);
            DirectoryResponse::Error
        }
    };

    conn.write_frame(&response.encode(), io_timeout).await?;
    conn.close().await;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{HistoryStore, JsonHistory, MemoryHistory};
    use peerchat_common::Username;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn name(s: &str) -> Username {
        Username::new(s).unwrap()
    }

    fn handler(pinning: bool) -> DirectoryHandler {
        let pins = pinning.then(|| Arc::new(TrustStore::new(Arc::new(MemoryHistory::new()))));
        DirectoryHandler::new(Arc::new(RwLock::new(AddressTable::new())), pins)
    }

    #[tokio::test]
    async fn test_update_then_fetch() {
        let handler = handler(false);
        let ip: IpAddr = "203.0.113.5".parse().unwrap();

        let reply = handler.handle(&DirectoryRequest::Update(name("alice")), ip, None).await;
        assert_eq!(reply, DirectoryResponse::Ok);

        let reply = handler.handle(&DirectoryRequest::Fetch(name("alice")), ip, None).await;
        assert_eq!(reply.encode(), "4|203.0.113.5");

        let reply = handler.handle(&DirectoryRequest::Fetch(name("bob")), ip, None).await;
        assert_eq!(reply, DirectoryResponse::Error);
    }

    #[tokio::test]
    async fn test_last_update_wins() {
        let handler = handler(false);
        let first = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let second = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));

        handler.handle(&DirectoryRequest::Update(name("alice")), first, None).await;
        handler.handle(&DirectoryRequest::Update(name("alice")), second, None).await;

        let reply = handler.handle(&DirectoryRequest::Fetch(name("alice")), first, None).await;
        assert_eq!(reply.encode(), "6|2001:db8::1");
        assert_eq!(handler.table.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_mapped_ipv4_is_stored_as_ipv4() {
        let handler = handler(false);
        let mapped = IpAddr::V6(Ipv4Addr::new(198, 51, 100, 7).to_ipv6_mapped());

        handler.handle(&DirectoryRequest::Update(name("carol")), mapped, None).await;
        let reply = handler.handle(&DirectoryRequest::Fetch(name("carol")), mapped, None).await;
        assert_eq!(reply.encode(), "4|198.51.100.7");
    }

    #[tokio::test]
    async fn test_full_table_replies_error() {
        let table = AddressTable::with_limits(2, 2);
        let handler = DirectoryHandler::new(Arc::new(RwLock::new(table)), None);
        let ip: IpAddr = "192.0.2.1".parse().unwrap();

        let mut replies = Vec::new();
        for user in ["a", "b", "c"] {
            replies.push(handler.handle(&DirectoryRequest::Update(name(user)), ip, None).await);
        }
        assert!(replies.contains(&DirectoryResponse::Error));

        // the table is still usable
        let reply = handler.handle(&DirectoryRequest::Fetch(name("a")), ip, None).await;
        assert_eq!(reply, DirectoryResponse::Address(ip));
    }

    #[tokio::test]
    async fn test_update_pinning() {
        let handler = handler(true);
        let ip: IpAddr = "192.0.2.9".parse().unwrap();
        let owner = Fingerprint::from_bytes([1; 32]);
        let intruder = Fingerprint::from_bytes([2; 32]);
        let update = DirectoryRequest::Update(name("alice"));

        assert_eq!(handler.handle(&update, ip, None).await, DirectoryResponse::Error);
        assert_eq!(handler.handle(&update, ip, Some(owner)).await, DirectoryResponse::Ok);

        let other_ip: IpAddr = "192.0.2.66".parse().unwrap();
        assert_eq!(
            handler.handle(&update, other_ip, Some(intruder)).await,
            DirectoryResponse::Error
        );

        let reply = handler.handle(&DirectoryRequest::Fetch(name("alice")), ip, None).await;
        assert_eq!(reply, DirectoryResponse::Address(ip));
    }

    #[tokio::test]
    async fn test_update_pinning_with_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pins.json");
        let store = Arc::new(JsonHistory::open(&path).unwrap());
        let handler = DirectoryHandler::new(
            Arc::new(RwLock::new(AddressTable::new())),
            Some(Arc::new(TrustStore::new(store))),
        );
        let ip: IpAddr = "192.0.2.10".parse().unwrap();
        let update = DirectoryRequest::Update(name("alice"));

        let owner = Some(Fingerprint::from_bytes([1; 32]));
        assert_eq!(handler.handle(&update, ip, owner).await, DirectoryResponse::Ok);
        assert_eq!(
            handler.handle(&update, ip, Some(Fingerprint::from_bytes([2; 32]))).await,
            DirectoryResponse::Error
        );

        // the pin outlives the handler
        let reopened = JsonHistory::open(&path).unwrap();
        assert_eq!(reopened.pinned_fingerprint(&name("alice")).unwrap(), owner);
    }
}
