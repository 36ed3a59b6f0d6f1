use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{MessageId, ProviderKind, Role, RoomId, UserId};

/// One persisted message as the backend serves it from
/// `GET /rooms/{room_id}/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostMessageRequest {
    pub content: String,
    pub role: Role,
}

/// Provider-specific half of the completion payload. Untagged: the backend
/// discriminates on the sibling `provider` field, not on this object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProviderWireConfig {
    OpenAi {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
        model: String,
    },
    Ollama {
        base_url: String,
        model: String,
    },
}

/// Body of `POST /chat/chat`. The reply payload is deliberately untyped
/// (`serde_json::Value` on the client side); see the reply extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub message: String,
    pub provider: ProviderKind,
    pub config: ProviderWireConfig,
    pub temperature: f32,
    pub room_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaModelsResponse {
    #[serde(default)]
    pub models: Vec<String>,
}
