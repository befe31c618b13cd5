pub mod directory;
pub mod history;
pub mod messaging;
pub mod shutdown;
pub mod transport;
pub mod trust;

// Re-export directory types
pub use directory::{
    AddressTable, DirectoryClient, DirectoryEntry, DirectoryError, DirectoryHandler,
    DirectoryRequest, DirectoryResponse, DirectoryService, InsertOutcome, ProtocolError,
    StoreError, TableError,
};

// Re-export messaging types
pub use messaging::{
    MessageError, MessageHandler, MessagingError, PeerMessagingClient, PeerMessagingService,
    SendRequest, SendResponse,
};

pub use history::{HistoryEntry, HistoryError, HistoryStore, JsonHistory, MemoryHistory, MessageId};
pub use shutdown::Shutdown;
pub use transport::{fingerprint, Connection, Connector, EndpointError, Listener, TlsIdentity};
pub use trust::{TrustDecision, TrustError, TrustStore};
