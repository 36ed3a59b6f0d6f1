use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::domain::{ChatMessage, MessageStatus, RoomId};
use storage::Storage;

/// How many messages are kept per room in the warm-start cache, matching
/// the cap the original web client used for its reload cache.
pub const MESSAGE_CACHE_LIMIT: usize = 200;

pub const PROVIDER_SETTINGS_KEY: &str = "chat.provider_settings";
pub const AI_REQUEST_COUNT_KEY: &str = "chat.ai_request_count";

/// Key/value persistence port. The core depends only on this interface;
/// anything that can hold strings by key (SQLite, a browser's localStorage,
/// a test map) can back it.
#[async_trait]
pub trait ChatPersistence: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<String>>;
    async fn save(&self, key: &str, value: &str) -> Result<()>;
}

/// No-op persistence for clients that run without local state.
pub struct NullPersistence;

#[async_trait]
impl ChatPersistence for NullPersistence {
    async fn load(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn save(&self, _key: &str, _value: &str) -> Result<()> {
        Ok(())
    }
}

/// SQLite-backed persistence over the storage crate.
pub struct DurableChatCache {
    storage: Storage,
}

impl DurableChatCache {
    pub async fn initialize(database_url: &str) -> Result<Arc<Self>> {
        let storage = Storage::new(database_url)
            .await
            .with_context(|| format!("failed to initialize chat cache at '{database_url}'"))?;
        Ok(Arc::new(Self { storage }))
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

#[async_trait]
impl ChatPersistence for DurableChatCache {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        self.storage.load_value(key).await
    }

    async fn save(&self, key: &str, value: &str) -> Result<()> {
        self.storage.save_value(key, value).await
    }
}

pub fn message_cache_key(room_id: RoomId) -> String {
    format!("chat.messages.{}", room_id.0)
}

/// Serializes the confirmed tail of a room's log for the warm-start cache.
/// Pending entries are never persisted.
pub fn encode_message_cache(messages: &[ChatMessage]) -> Result<String> {
    let confirmed: Vec<&ChatMessage> = messages
        .iter()
        .filter(|message| message.status == MessageStatus::Confirmed)
        .collect();
    let tail_start = confirmed.len().saturating_sub(MESSAGE_CACHE_LIMIT);
    serde_json::to_string(&confirmed[tail_start..]).context("failed to serialize message cache")
}

/// Decodes a cached message tail. An unparseable cache, or entries for a
/// different room, are discarded; the next full fetch repopulates it.
pub fn decode_message_cache(raw: &str, room_id: RoomId) -> Vec<ChatMessage> {
    let parsed: Vec<ChatMessage> = serde_json::from_str(raw).unwrap_or_default();
    parsed
        .into_iter()
        .filter(|message| {
            message.room_id == room_id && message.status == MessageStatus::Confirmed
        })
        .collect()
}

#[cfg(test)]
#[path = "tests/persistence_tests.rs"]
mod tests;
