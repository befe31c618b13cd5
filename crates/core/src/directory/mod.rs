/// Directory (lookup) service
///
/// Maps usernames to the network address each peer last registered from:
/// - `table`: open-addressed hash table with tombstones and growth
/// - `store`: flat-file persistence of the table between runs
/// - `protocol`: the `U|`/`F|` line codec
/// - `service` / `client`: the TLS server loop and its short-lived client

mod client;
mod protocol;
mod service;
mod table;

pub mod store;

pub use client::DirectoryClient;
pub(crate) use client::{connection_error, endpoint_error};
pub use protocol::{
    DirectoryRequest, DirectoryResponse, ProtocolError, ERR_RESPONSE, FIELD_SEPARATOR, OK_RESPONSE,
};
pub use service::{DirectoryError, DirectoryHandler, DirectoryService};
pub use store::StoreError;
pub use table::{hash_username, AddressTable, DirectoryEntry, InsertOutcome, TableError};
