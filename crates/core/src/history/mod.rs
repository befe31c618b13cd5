//! Local message history.
//!
//! The history store keeps, per chat username, the pinned certificate
//! fingerprint and the ordered list of exchanged messages. It backs both the
//! [`TrustStore`](crate::trust::TrustStore) and the display history.

mod json;

pub use json::JsonHistory;

use peerchat_common::{Direction, Fingerprint, Timestamp, Username};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Identifier assigned to a stored message
pub type MessageId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: MessageId,
    pub direction: Direction,
    pub content: String,
    pub timestamp: Timestamp,
}

/// Keyed append/query store for chats.
///
/// Implementations synchronize internally; every method takes `&self`.
pub trait HistoryStore: Send + Sync {
    /// Fingerprint pinned for `chat`, if one was ever recorded
    fn pinned_fingerprint(&self, chat: &Username) -> Result<Option<Fingerprint>, HistoryError>;

    /// Record the fingerprint for `chat`. Fails if one is already pinned.
    fn pin_fingerprint(&self, chat: &Username, fingerprint: Fingerprint) -> Result<(), HistoryError>;

    /// Append a message to `chat`, creating the chat if needed
    fn append(&self, chat: &Username, direction: Direction, content: &str) -> Result<MessageId, HistoryError>;

    /// Messages of `chat` in insertion order
    fn query(&self, chat: &Username) -> Result<Vec<HistoryEntry>, HistoryError>;

    /// Every known chat
    fn chats(&self) -> Result<Vec<Username>, HistoryError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ChatRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fingerprint: Option<Fingerprint>,
    #[serde(default)]
    messages: Vec<HistoryEntry>,
}

/// The complete contents of a history store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct HistoryState {
    next_id: MessageId,
    chats: BTreeMap<Username, ChatRecord>,
}

impl HistoryState {
    fn pinned_fingerprint(&self, chat: &Username) -> Option<Fingerprint> {
        self.chats.get(chat).and_then(|record| record.fingerprint)
    }

    fn pin_fingerprint(&mut self, chat: &Username, fingerprint: Fingerprint) -> Result<(), HistoryError> {
        let record = self.chats.entry(chat.clone()).or_default();
        if record.fingerprint.is_some() {
            return Err(HistoryError::AlreadyPinned(chat.to_string()));
        }
        record.fingerprint = Some(fingerprint);
        Ok(())
    }

    fn append(&mut self, chat: &Username, direction: Direction, content: &str) -> MessageId {
        let id = self.next_id;
        self.next_id += 1;
        self.chats
            .entry(chat.clone())
            .or_default()
            .messages
            .push(HistoryEntry {
                id,
                direction,
                content: content.to_string(),
                timestamp: Timestamp::now(),
            });
        id
    }

    fn query(&self, chat: &Username) -> Vec<HistoryEntry> {
        self.chats
            .get(chat)
            .map(|record| record.messages.clone())
            .unwrap_or_default()
    }

    fn chats(&self) -> Vec<Username> {
        self.chats.keys().cloned().collect()
    }
}

/// In-memory history, lost on exit
#[derive(Debug, Default)]
pub struct MemoryHistory {
    state: Mutex<HistoryState>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HistoryState>, HistoryError> {
        self.state.lock().map_err(|_| HistoryError::Poisoned)
    }
}

impl HistoryStore for MemoryHistory {
    fn pinned_fingerprint(&self, chat: &Username) -> Result<Option<Fingerprint>, HistoryError> {
        Ok(self.lock()?.pinned_fingerprint(chat))
    }

    fn pin_fingerprint(&self, chat: &Username, fingerprint: Fingerprint) -> Result<(), HistoryError> {
        self.lock()?.pin_fingerprint(chat, fingerprint)
    }

    fn append(&self, chat: &Username, direction: Direction, content: &str) -> Result<MessageId, HistoryError> {
        Ok(self.lock()?.append(chat, direction, content))
    }

    fn query(&self, chat: &Username) -> Result<Vec<HistoryEntry>, HistoryError> {
        Ok(self.lock()?.query(chat))
    }

    fn chats(&self) -> Result<Vec<Username>, HistoryError> {
        Ok(self.lock()?.chats())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("fingerprint already pinned for {0}")]
    AlreadyPinned(String),

    #[error("history lock poisoned")]
    Poisoned,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
