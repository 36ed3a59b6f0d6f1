use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);
    };
}

id_newtype!(RoomId);
id_newtype!(UserId);
id_newtype!(MessageId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    System,
    Group,
    Dm,
}

/// Failed sends are rolled back and never retained, so there is no
/// observable `Failed` status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Confirmed,
}

/// Identity of a chat message. Server-assigned ids and locally fabricated
/// provisional ids live in separate variants and can never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKey {
    Confirmed(MessageId),
    Provisional(Uuid),
}

impl MessageKey {
    pub fn confirmed_id(&self) -> Option<MessageId> {
        match self {
            MessageKey::Confirmed(id) => Some(*id),
            MessageKey::Provisional(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub key: MessageKey,
    pub room_id: RoomId,
    pub role: Role,
    pub author_tag: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
}

/// Room metadata as served by the backend. Opaque to the sync core except
/// for the id and the assistant display initials used for author tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub slug: String,
    pub name: String,
    pub kind: RoomKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_initials: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    Ollama,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub provider: ProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub ollama_base_url: String,
    pub ollama_model: String,
    pub temperature: f32,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenAi,
            openai_api_key: None,
            openai_model: "gpt-4o".into(),
            ollama_base_url: "http://localhost:11434".into(),
            ollama_model: "llama3".into(),
            temperature: 0.7,
        }
    }
}

/// What the router may rely on when picking a provider. Derived from
/// settings plus the latest Ollama model discovery, never from the network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderAvailability {
    pub openai_key_present: bool,
    pub ollama_models: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProvider {
    pub provider: ProviderKind,
    pub model: String,
}
