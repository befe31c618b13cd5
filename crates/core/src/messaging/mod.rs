/// Peer-to-peer chat messages
///
/// Each peer runs a [`PeerMessagingService`] that accepts one
/// `<username>|<content>` line per TLS connection and admits it only when the
/// sender's certificate matches the fingerprint pinned for that username.
/// [`PeerMessagingClient`] resolves a recipient through the directory and
/// delivers to it.

mod client;
mod protocol;
mod service;

pub use client::PeerMessagingClient;
pub use protocol::{MessageError, SendRequest, SendResponse};
pub use service::{MessageHandler, MessagingError, PeerMessagingService};
