//! Per-device remembered chat.
//!
//! Each device keeps a bounded, ordered log of user/assistant messages that
//! seeds the next model request. When an append would exceed the cap, the
//! oldest user/assistant pair is evicted so turn pairing is preserved.
//!
//! Storage is behind [`HistoryStore`]: [`JsonFileHistoryStore`] keeps every
//! device in one JSON file written atomically (temp file, fsync, rename),
//! [`MemoryHistoryStore`] keeps nothing on disk.

use crate::error::{KgError, Result};
use crate::llm::ChatMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// Default message cap per device.
pub const DEFAULT_MAX_MESSAGES: usize = 16;

/// Remembered messages for one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RememberedChat {
    pub device_id: String,
    pub messages: Vec<ChatMessage>,
}

impl RememberedChat {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            messages: Vec::new(),
        }
    }

    /// Append one exchange, evicting the oldest pairs until it fits in `cap`.
    pub fn push_exchange(&mut self, user: ChatMessage, assistant: ChatMessage, cap: usize) {
        while self.messages.len() >= 2 && self.messages.len() + 2 > cap {
            self.messages.drain(..2);
        }
        self.messages.push(user);
        self.messages.push(assistant);
    }
}

/// Persistence for the full set of remembered chats.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Load every remembered chat. A store with nothing saved yet returns an empty list.
    async fn load(&self) -> Result<Vec<RememberedChat>>;

    /// Replace the stored set.
    async fn save(&self, chats: &[RememberedChat]) -> Result<()>;
}

/// Stores all chats in a single JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileHistoryStore {
    path: PathBuf,
}

impl JsonFileHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl HistoryStore for JsonFileHistoryStore {
    async fn load(&self) -> Result<Vec<RememberedChat>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&bytes).map_err(|e| {
            KgError::History(format!("failed to parse {}: {e}", self.path.display()))
        })
    }

    async fn save(&self, chats: &[RememberedChat]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(chats)
            .map_err(|e| KgError::History(format!("failed to serialize chats: {e}")))?;

        let tmp_path = self.path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.path).await.map_err(|e| {
            KgError::History(format!(
                "failed to rename temp file to {}: {e}",
                self.path.display()
            ))
        })
    }
}

/// Keeps saved chats in memory only.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    saved: Mutex<Vec<RememberedChat>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn load(&self) -> Result<Vec<RememberedChat>> {
        Ok(self.saved.lock().await.clone())
    }

    async fn save(&self, chats: &[RememberedChat]) -> Result<()> {
        *self.saved.lock().await = chats.to_vec();
        Ok(())
    }
}

/// Remembered chats for every device, backed by a [`HistoryStore`].
pub struct ChatHistory {
    chats: Mutex<Vec<RememberedChat>>,
    store: Arc<dyn HistoryStore>,
    max_messages: usize,
}

impl std::fmt::Debug for ChatHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatHistory")
            .field("max_messages", &self.max_messages)
            .finish_non_exhaustive()
    }
}

impl ChatHistory {
    /// Load the remembered chats from `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn open(store: Arc<dyn HistoryStore>, max_messages: usize) -> Result<Self> {
        let chats = store.load().await?;
        debug!(devices = chats.len(), "loaded remembered chats");
        Ok(Self {
            chats: Mutex::new(chats),
            store,
            max_messages,
        })
    }

    /// Empty history that is never written to disk.
    pub fn in_memory(max_messages: usize) -> Self {
        Self {
            chats: Mutex::new(Vec::new()),
            store: Arc::new(MemoryHistoryStore::new()),
            max_messages,
        }
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    /// Remembered chat for `device_id`, empty if the device has none yet.
    pub async fn get(&self, device_id: &str) -> RememberedChat {
        self.chats
            .lock()
            .await
            .iter()
            .find(|c| c.device_id == device_id)
            .cloned()
            .unwrap_or_else(|| RememberedChat::new(device_id))
    }

    /// Append one exchange for `device_id` and persist the full set.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the write. The in-memory copy
    /// keeps the new exchange either way.
    pub async fn append(
        &self,
        device_id: &str,
        user_message: &str,
        assistant_message: &str,
    ) -> Result<()> {
        let mut chats = self.chats.lock().await;
        let index = match chats.iter().position(|c| c.device_id == device_id) {
            Some(index) => index,
            None => {
                chats.push(RememberedChat::new(device_id));
                chats.len() - 1
            }
        };
        chats[index].push_exchange(
            ChatMessage::user(user_message),
            ChatMessage::assistant(assistant_message),
            self.max_messages,
        );
        debug!(
            device_id,
            messages = chats[index].messages.len(),
            "remembered exchange"
        );
        self.store.save(&chats).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    async fn fill(history: &ChatHistory, device: &str, exchanges: usize) {
        for i in 0..exchanges {
            history
                .append(device, &format!("q{i}"), &format!("a{i}"))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn unknown_device_has_empty_chat() {
        let history = ChatHistory::in_memory(DEFAULT_MAX_MESSAGES);
        let chat = history.get("esn-1").await;
        assert_eq!(chat.device_id, "esn-1");
        assert!(chat.messages.is_empty());
    }

    #[tokio::test]
    async fn ninth_exchange_evicts_oldest_pair() {
        let history = ChatHistory::in_memory(DEFAULT_MAX_MESSAGES);
        fill(&history, "esn", 8).await;
        assert_eq!(history.get("esn").await.messages.len(), 16);

        history.append("esn", "q8", "a8").await.unwrap();
        let chat = history.get("esn").await;
        assert_eq!(chat.messages.len(), 16);
        assert_eq!(chat.messages[0], ChatMessage::user("q1"));
        assert_eq!(chat.messages[1], ChatMessage::assistant("a1"));
        assert_eq!(chat.messages[14], ChatMessage::user("q8"));
        assert_eq!(chat.messages[15], ChatMessage::assistant("a8"));
    }

    #[tokio::test]
    async fn devices_are_independent() {
        let history = ChatHistory::in_memory(4);
        fill(&history, "a", 3).await;
        fill(&history, "b", 1).await;
        assert_eq!(history.get("a").await.messages.len(), 4);
        assert_eq!(history.get("b").await.messages.len(), 2);
    }

    #[test]
    fn push_exchange_trims_oversized_log() {
        let mut chat = RememberedChat::new("esn");
        for i in 0..10 {
            chat.messages.push(ChatMessage::user(format!("m{i}")));
        }
        chat.push_exchange(ChatMessage::user("u"), ChatMessage::assistant("a"), 6);
        assert_eq!(chat.messages.len(), 6);
        assert_eq!(chat.messages[0].content, "m6");
    }

    #[tokio::test]
    async fn json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileHistoryStore::new(dir.path().join("nested").join("chats.json"));
        assert!(store.load().await.unwrap().is_empty());

        let mut chat = RememberedChat::new("esn");
        chat.push_exchange(ChatMessage::user("hi"), ChatMessage::assistant("hello"), 16);
        store.save(&[chat.clone()]).await.unwrap();

        assert_eq!(store.load().await.unwrap(), vec![chat]);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn json_store_corrupt_file_is_history_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chats.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = JsonFileHistoryStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, KgError::History(_)));
    }
}
