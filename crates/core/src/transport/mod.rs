/// Transport layer for peerchat: TLS over TCP
///
/// Provides short-lived encrypted connections with:
/// - Mutual certificate presentation (no chain validation, no CA)
/// - Handshake signature checks, so a presented certificate proves key possession
/// - Newline-terminated text frames
/// - Accept waits bounded by a timeout

mod connection;
mod endpoint;

pub use connection::{fingerprint, read_frame, Connection, ConnectionError, FRAME_TERMINATOR};
pub use endpoint::{
    client_config, server_config, Connector, EndpointError, Listener, PendingHandshake,
    TlsIdentity,
};
