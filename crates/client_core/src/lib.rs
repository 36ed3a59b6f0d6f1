use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use shared::{
    domain::{
        ChatMessage, MessageId, MessageKey, MessageStatus, ProviderAvailability, ProviderKind,
        ProviderSettings, ResolvedProvider, Role, RoomId, RoomSummary, UserId,
    },
    protocol::{ChatCompletionRequest, MessageRecord, OllamaModelsResponse, PostMessageRequest,
        ProviderWireConfig},
};
use tokio::{sync::broadcast, sync::Mutex, task::JoinHandle};
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

pub mod error;
pub mod persistence;
pub mod poller;
pub mod provider;
pub mod store;

pub use error::SendError;
pub use persistence::{ChatPersistence, DurableChatCache, NullPersistence};
pub use store::MessageStore;

use persistence::{AI_REQUEST_COUNT_KEY, PROVIDER_SETTINGS_KEY};

/// Upper bound on the whole optimistic send round-trip (persist user echo,
/// completion, persist assistant reply).
pub const SEND_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-request timeout of the HTTP backend.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
/// The source console kept the ten most recent errors for its toast list.
const RECENT_ERROR_LIMIT: usize = 10;

const DEFAULT_USER_TAG: &str = "CC";
const DEFAULT_ASSISTANT_TAG: &str = "TL";
const SYSTEM_TAG: &str = "SYS";

/// Where a room's synchronization currently stands. A delta fetch is
/// simply an in-flight request while `Steady`, not a separate observable
/// phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Loading,
    Steady,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    MessagesUpdated { room_id: RoomId },
    SyncPhaseChanged { room_id: RoomId, phase: SyncPhase },
    ProviderModelsUpdated { models: Vec<String> },
    Error(String),
}

#[derive(Debug, Clone)]
pub struct RecordedError {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Transport to the chat backend. One implementation speaks the real REST
/// API; tests substitute scripted fakes.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn fetch_messages(&self, room_id: RoomId) -> Result<Vec<MessageRecord>>;
    async fn fetch_messages_since(
        &self,
        room_id: RoomId,
        since_id: MessageId,
    ) -> Result<Vec<MessageRecord>>;
    async fn post_message(
        &self,
        room_id: RoomId,
        request: PostMessageRequest,
    ) -> Result<MessageRecord>;
    async fn chat_completion(&self, request: &ChatCompletionRequest) -> Result<serde_json::Value>;
    async fn list_ollama_models(&self, base_url: &str) -> Result<Vec<String>>;
}

/// reqwest-backed implementation of the backend REST contract.
pub struct HttpChatBackend {
    http: Client,
    server_url: String,
}

impl HttpChatBackend {
    pub fn new(server_url: &str) -> Result<Self> {
        Url::parse(server_url).with_context(|| format!("invalid backend url '{server_url}'"))?;
        let http = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            http,
            server_url: server_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn fetch_messages(&self, room_id: RoomId) -> Result<Vec<MessageRecord>> {
        let records = self
            .http
            .get(format!("{}/rooms/{}/messages", self.server_url, room_id.0))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(records)
    }

    async fn fetch_messages_since(
        &self,
        room_id: RoomId,
        since_id: MessageId,
    ) -> Result<Vec<MessageRecord>> {
        let records = self
            .http
            .get(format!("{}/rooms/{}/messages", self.server_url, room_id.0))
            .query(&[("since_id", since_id.0)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(records)
    }

    async fn post_message(
        &self,
        room_id: RoomId,
        request: PostMessageRequest,
    ) -> Result<MessageRecord> {
        let record = self
            .http
            .post(format!("{}/rooms/{}/messages", self.server_url, room_id.0))
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(record)
    }

    async fn chat_completion(&self, request: &ChatCompletionRequest) -> Result<serde_json::Value> {
        let reply = self
            .http
            .post(format!("{}/chat/chat", self.server_url))
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(reply)
    }

    async fn list_ollama_models(&self, base_url: &str) -> Result<Vec<String>> {
        let response: OllamaModelsResponse = self
            .http
            .get(format!("{}/chat/ollama/models", self.server_url))
            .query(&[("base_url", base_url)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.models)
    }
}

struct ActiveRoom {
    room: RoomSummary,
    store: MessageStore,
    phase: SyncPhase,
    pending_send: Option<MessageKey>,
    poll_task: Option<JoinHandle<()>>,
}

struct ClientState {
    active: Option<ActiveRoom>,
    /// Bumped on every room switch; in-flight work tagged with an older
    /// epoch discards its result instead of writing into the new room.
    epoch: u64,
    user_id: Option<UserId>,
    settings: ProviderSettings,
    ollama_models: Vec<String>,
    ai_request_count: u64,
    recent_errors: Vec<RecordedError>,
}

/// The chat synchronization core: optimistic sends with rollback, poll-based
/// incremental fetch, provider routing, and a broadcast event stream for
/// whatever UI sits on top.
pub struct ChatSyncClient {
    backend: Arc<dyn ChatBackend>,
    cache: Arc<dyn ChatPersistence>,
    inner: Mutex<ClientState>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatSyncClient {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Arc<Self> {
        Self::new_with_persistence(backend, Arc::new(NullPersistence))
    }

    pub fn new_with_persistence(
        backend: Arc<dyn ChatBackend>,
        cache: Arc<dyn ChatPersistence>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            backend,
            cache,
            inner: Mutex::new(ClientState {
                active: None,
                epoch: 0,
                user_id: None,
                settings: ProviderSettings::default(),
                ollama_models: Vec::new(),
                ai_request_count: 0,
                recent_errors: Vec::new(),
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Restores persisted provider settings and the AI request counter.
    /// Call once at startup; missing or unparseable state is ignored.
    pub async fn load_persisted_state(&self) -> Result<()> {
        if let Some(raw) = self.cache.load(PROVIDER_SETTINGS_KEY).await? {
            match serde_json::from_str::<ProviderSettings>(&raw) {
                Ok(settings) => self.inner.lock().await.settings = settings,
                Err(err) => warn!("ignoring unparseable persisted provider settings: {err}"),
            }
        }
        if let Some(raw) = self.cache.load(AI_REQUEST_COUNT_KEY).await? {
            if let Ok(count) = raw.parse::<u64>() {
                self.inner.lock().await.ai_request_count = count;
            }
        }
        Ok(())
    }

    /// Makes `room` the active room: cancels the previous room's poller,
    /// resets the store and watermark, seeds the display from the local
    /// cache, and starts the full-then-delta fetch loop.
    pub async fn select_room(self: &Arc<Self>, room: RoomSummary) -> Result<()> {
        let room_id = room.room_id;
        let epoch = {
            let mut guard = self.inner.lock().await;
            guard.epoch += 1;
            if let Some(previous) = guard.active.take() {
                if let Some(task) = previous.poll_task {
                    task.abort();
                }
            }
            guard.active = Some(ActiveRoom {
                room,
                store: MessageStore::new(room_id),
                phase: SyncPhase::Loading,
                pending_send: None,
                poll_task: None,
            });
            guard.epoch
        };
        info!(room_id = room_id.0, "room selected; starting sync");
        self.emit(ClientEvent::SyncPhaseChanged {
            room_id,
            phase: SyncPhase::Loading,
        });

        // Warm start: cached confirmed messages are shown immediately, but
        // the watermark stays unset so the first fetch is always full.
        match self.cache.load(&persistence::message_cache_key(room_id)).await {
            Ok(Some(raw)) => {
                let cached = persistence::decode_message_cache(&raw, room_id);
                if !cached.is_empty() {
                    let seeded = {
                        let mut guard = self.inner.lock().await;
                        if guard.epoch == epoch {
                            if let Some(active) = guard.active.as_mut() {
                                for message in cached {
                                    active.store.append(message);
                                }
                            }
                            true
                        } else {
                            false
                        }
                    };
                    if seeded {
                        self.emit(ClientEvent::MessagesUpdated { room_id });
                    }
                }
            }
            Ok(None) => {}
            Err(err) => warn!(
                room_id = room_id.0,
                "failed to load cached messages: {err}"
            ),
        }

        let task = poller::spawn_room_sync(Arc::clone(self), room_id, epoch);
        let mut guard = self.inner.lock().await;
        if guard.epoch == epoch {
            if let Some(active) = guard.active.as_mut() {
                active.poll_task = Some(task);
                return Ok(());
            }
        }
        task.abort();
        Ok(())
    }

    /// Leaves the active room, cancelling its poller. Any fetch or send
    /// response still in flight is discarded by the epoch check.
    pub async fn close_room(&self) {
        let closed = {
            let mut guard = self.inner.lock().await;
            guard.epoch += 1;
            guard.active.take().map(|active| {
                if let Some(task) = active.poll_task {
                    task.abort();
                }
                active.room.room_id
            })
        };
        if let Some(room_id) = closed {
            self.emit(ClientEvent::SyncPhaseChanged {
                room_id,
                phase: SyncPhase::Idle,
            });
        }
    }

    /// Optimistic send: the message appears immediately as `pending`, is
    /// swapped for the server's confirmed echo on success, and is removed
    /// entirely on failure. At most one send may be pending per room.
    pub async fn send_message(&self, text: &str) -> Result<(), SendError> {
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(SendError::EmptyMessage);
        }

        let (room_id, epoch, key, request) = {
            let mut guard = self.inner.lock().await;
            let epoch = guard.epoch;
            let settings = guard.settings.clone();
            let availability = availability_of(&settings, &guard.ollama_models);
            let user_id = guard.user_id;
            let Some(active) = guard.active.as_mut() else {
                return Err(SendError::NoActiveRoom);
            };
            let room_id = active.room.room_id;
            if active.pending_send.is_some() {
                return Err(SendError::Busy(room_id.0));
            }

            let resolved = provider::resolve(&settings, &availability);
            let key = MessageKey::Provisional(Uuid::new_v4());
            active.store.append(ChatMessage {
                key,
                room_id,
                role: Role::User,
                author_tag: DEFAULT_USER_TAG.into(),
                text: text.clone(),
                created_at: Utc::now(),
                status: MessageStatus::Pending,
            });
            active.pending_send = Some(key);

            let request = ChatCompletionRequest {
                message: text.clone(),
                provider: resolved.provider,
                config: wire_config(&settings, &resolved),
                temperature: settings.temperature,
                room_id,
                user_id,
            };
            (room_id, epoch, key, request)
        };
        self.emit(ClientEvent::MessagesUpdated { room_id });

        let outcome =
            tokio::time::timeout(SEND_TIMEOUT, self.dispatch_send(room_id, &text, request)).await;
        match outcome {
            Ok(Ok((user_record, assistant_record))) => {
                self.commit_send(epoch, &key, user_record, assistant_record)
                    .await
            }
            Ok(Err(err)) => {
                let reason = err.to_string();
                if self.rollback_send(room_id, epoch, &key, &reason).await {
                    Err(SendError::Network(reason))
                } else {
                    Err(SendError::Superseded)
                }
            }
            Err(_) => {
                let reason = format!("send for room {} timed out", room_id.0);
                if self.rollback_send(room_id, epoch, &key, &reason).await {
                    Err(SendError::Timeout)
                } else {
                    Err(SendError::Superseded)
                }
            }
        }
    }

    /// The network half of a send: persist the user's message, obtain the
    /// assistant reply, persist it too. Each confirmed record flows back
    /// into the store via `commit_send`.
    async fn dispatch_send(
        &self,
        room_id: RoomId,
        text: &str,
        request: ChatCompletionRequest,
    ) -> Result<(MessageRecord, MessageRecord)> {
        let user_record = self
            .backend
            .post_message(
                room_id,
                PostMessageRequest {
                    content: text.to_string(),
                    role: Role::User,
                },
            )
            .await?;

        let reply = self.backend.chat_completion(&request).await?;
        let reply_text = provider::extract_reply_text(&reply);

        let assistant_record = self
            .backend
            .post_message(
                room_id,
                PostMessageRequest {
                    content: reply_text,
                    role: Role::Assistant,
                },
            )
            .await?;

        Ok((user_record, assistant_record))
    }

    async fn commit_send(
        &self,
        epoch: u64,
        key: &MessageKey,
        user_record: MessageRecord,
        assistant_record: MessageRecord,
    ) -> Result<(), SendError> {
        let (room_id, snapshot, count) = {
            let mut guard = self.inner.lock().await;
            if guard.epoch != epoch {
                return Err(SendError::Superseded);
            }
            let Some(active) = guard.active.as_mut() else {
                return Err(SendError::Superseded);
            };
            let room = active.room.clone();
            active.pending_send = None;

            let max_id = user_record.id.max(assistant_record.id);
            active
                .store
                .replace(key, chat_message_from_record(&room, &user_record));
            active
                .store
                .append(chat_message_from_record(&room, &assistant_record));
            active.store.advance_watermark(max_id);
            let snapshot = active.store.snapshot();

            guard.ai_request_count += 1;
            (room.room_id, snapshot, guard.ai_request_count)
        };

        self.emit(ClientEvent::MessagesUpdated { room_id });
        self.persist_room_cache(room_id, &snapshot).await;
        if let Err(err) = self.cache.save(AI_REQUEST_COUNT_KEY, &count.to_string()).await {
            warn!("failed to persist ai request counter: {err}");
        }
        Ok(())
    }

    /// Excises the provisional message after a failed send. Returns whether
    /// the rollback applied; a stale epoch means the room changed mid-send
    /// and there is nothing left to roll back.
    async fn rollback_send(
        &self,
        room_id: RoomId,
        epoch: u64,
        key: &MessageKey,
        reason: &str,
    ) -> bool {
        let applied = {
            let mut guard = self.inner.lock().await;
            if guard.epoch != epoch {
                false
            } else if let Some(active) = guard.active.as_mut() {
                active.store.remove_by_key(key);
                active.pending_send = None;
                true
            } else {
                false
            }
        };
        if applied {
            self.record_error(format!("send failed: {reason}")).await;
            self.emit(ClientEvent::MessagesUpdated { room_id });
        }
        applied
    }

    /// Re-discovers the locally served model list and auto-selects the
    /// first model when the configured one is no longer offered. Failures
    /// clear the list, which routes subsequent sends away from Ollama.
    pub async fn refresh_ollama_models(&self) -> Result<Vec<String>> {
        let base_url = { self.inner.lock().await.settings.ollama_base_url.clone() };
        match self.backend.list_ollama_models(&base_url).await {
            Ok(models) => {
                let settings = {
                    let mut guard = self.inner.lock().await;
                    guard.ollama_models = models.clone();
                    if !models.is_empty() && !models.contains(&guard.settings.ollama_model) {
                        guard.settings.ollama_model = models[0].clone();
                    }
                    guard.settings.clone()
                };
                self.emit(ClientEvent::ProviderModelsUpdated {
                    models: models.clone(),
                });
                self.persist_settings(&settings).await;
                Ok(models)
            }
            Err(err) => {
                self.inner.lock().await.ollama_models.clear();
                self.record_error(format!("ollama model discovery failed: {err}"))
                    .await;
                Err(err)
            }
        }
    }

    pub async fn update_provider_settings(&self, settings: ProviderSettings) {
        {
            let mut guard = self.inner.lock().await;
            guard.settings = settings.clone();
        }
        self.persist_settings(&settings).await;
    }

    pub async fn set_user_id(&self, user_id: UserId) {
        self.inner.lock().await.user_id = Some(user_id);
    }

    pub async fn snapshot(&self) -> Vec<ChatMessage> {
        let guard = self.inner.lock().await;
        guard
            .active
            .as_ref()
            .map(|active| active.store.snapshot())
            .unwrap_or_default()
    }

    pub async fn sync_phase(&self) -> SyncPhase {
        let guard = self.inner.lock().await;
        guard
            .active
            .as_ref()
            .map(|active| active.phase)
            .unwrap_or(SyncPhase::Idle)
    }

    pub async fn last_seen_id(&self) -> Option<MessageId> {
        let guard = self.inner.lock().await;
        guard.active.as_ref().and_then(|a| a.store.last_seen_id())
    }

    pub async fn provider_settings(&self) -> ProviderSettings {
        self.inner.lock().await.settings.clone()
    }

    pub async fn provider_availability(&self) -> ProviderAvailability {
        let guard = self.inner.lock().await;
        availability_of(&guard.settings, &guard.ollama_models)
    }

    pub async fn ai_request_count(&self) -> u64 {
        self.inner.lock().await.ai_request_count
    }

    pub async fn recent_errors(&self) -> Vec<RecordedError> {
        self.inner.lock().await.recent_errors.clone()
    }

    /// Applies a fetched batch to the active room. Returns `false` if the
    /// epoch went stale, which stops the polling loop.
    pub(crate) async fn apply_fetched_batch(
        &self,
        room_id: RoomId,
        epoch: u64,
        records: Vec<MessageRecord>,
    ) -> bool {
        let (appended, phase_change, snapshot) = {
            let mut guard = self.inner.lock().await;
            if guard.epoch != epoch {
                return false;
            }
            let Some(active) = guard.active.as_mut() else {
                return false;
            };
            if active.room.room_id != room_id {
                return false;
            }

            let room = active.room.clone();
            let batch: Vec<ChatMessage> = records
                .iter()
                .map(|record| chat_message_from_record(&room, record))
                .collect();
            let appended = active.store.merge_confirmed_batch(batch);
            let phase_change = if active.phase != SyncPhase::Steady {
                active.phase = SyncPhase::Steady;
                true
            } else {
                false
            };
            let snapshot = (appended > 0).then(|| active.store.snapshot());
            (appended, phase_change, snapshot)
        };

        if phase_change {
            self.emit(ClientEvent::SyncPhaseChanged {
                room_id,
                phase: SyncPhase::Steady,
            });
        }
        if appended > 0 {
            self.emit(ClientEvent::MessagesUpdated { room_id });
        }
        if let Some(snapshot) = snapshot {
            self.persist_room_cache(room_id, &snapshot).await;
        }
        true
    }

    /// A failed fetch is non-fatal: it is recorded, the watermark stays
    /// put, and the next tick retries. Returns `false` on a stale epoch.
    pub(crate) async fn note_fetch_failure(
        &self,
        room_id: RoomId,
        epoch: u64,
        reason: String,
    ) -> bool {
        {
            let guard = self.inner.lock().await;
            if guard.epoch != epoch {
                return false;
            }
        }
        warn!(room_id = room_id.0, "{reason}");
        self.record_error(reason).await;
        true
    }

    async fn record_error(&self, message: String) {
        {
            let mut guard = self.inner.lock().await;
            guard.recent_errors.insert(
                0,
                RecordedError {
                    message: message.clone(),
                    at: Utc::now(),
                },
            );
            guard.recent_errors.truncate(RECENT_ERROR_LIMIT);
        }
        self.emit(ClientEvent::Error(message));
    }

    async fn persist_room_cache(&self, room_id: RoomId, snapshot: &[ChatMessage]) {
        match persistence::encode_message_cache(snapshot) {
            Ok(payload) => {
                if let Err(err) = self
                    .cache
                    .save(&persistence::message_cache_key(room_id), &payload)
                    .await
                {
                    warn!(room_id = room_id.0, "failed to persist message cache: {err}");
                }
            }
            Err(err) => warn!(room_id = room_id.0, "failed to encode message cache: {err}"),
        }
    }

    async fn persist_settings(&self, settings: &ProviderSettings) {
        match serde_json::to_string(settings) {
            Ok(payload) => {
                if let Err(err) = self.cache.save(PROVIDER_SETTINGS_KEY, &payload).await {
                    warn!("failed to persist provider settings: {err}");
                }
            }
            Err(err) => warn!("failed to encode provider settings: {err}"),
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

fn availability_of(settings: &ProviderSettings, ollama_models: &[String]) -> ProviderAvailability {
    ProviderAvailability {
        openai_key_present: settings
            .openai_api_key
            .as_deref()
            .is_some_and(|key| !key.is_empty()),
        ollama_models: ollama_models.to_vec(),
    }
}

fn wire_config(settings: &ProviderSettings, resolved: &ResolvedProvider) -> ProviderWireConfig {
    match resolved.provider {
        ProviderKind::OpenAi => ProviderWireConfig::OpenAi {
            api_key: settings.openai_api_key.clone(),
            model: resolved.model.clone(),
        },
        ProviderKind::Ollama => ProviderWireConfig::Ollama {
            base_url: settings.ollama_base_url.clone(),
            model: resolved.model.clone(),
        },
    }
}

fn chat_message_from_record(room: &RoomSummary, record: &MessageRecord) -> ChatMessage {
    let author_tag = match record.role {
        Role::Assistant => room
            .assistant_initials
            .clone()
            .unwrap_or_else(|| DEFAULT_ASSISTANT_TAG.into()),
        Role::System => SYSTEM_TAG.into(),
        Role::User => record
            .user_name
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_TAG.into()),
    };
    ChatMessage {
        key: MessageKey::Confirmed(record.id),
        room_id: room.room_id,
        role: record.role,
        author_tag,
        text: record.content.clone(),
        created_at: record.created_at,
        status: MessageStatus::Confirmed,
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
