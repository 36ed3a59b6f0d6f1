use std::collections::HashSet;

use shared::domain::{ChatMessage, MessageId, MessageKey, MessageStatus, RoomId};

/// In-memory ordered log of one room's chat messages.
///
/// The store carries the room watermark (`last_seen_id`): the highest
/// server-assigned id known to be merged. Delta fetches request only ids
/// above it, and it never decreases. Confirmed ids are de-duplicated so the
/// polling path and the send-confirmation path can observe the same server
/// message twice without producing duplicates.
#[derive(Debug)]
pub struct MessageStore {
    room_id: RoomId,
    messages: Vec<ChatMessage>,
    confirmed_ids: HashSet<MessageId>,
    last_seen_id: Option<MessageId>,
}

impl MessageStore {
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            messages: Vec::new(),
            confirmed_ids: HashSet::new(),
            last_seen_id: None,
        }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    /// Appends a message preserving arrival order. A confirmed message whose
    /// id is already present is a no-op; returns whether anything changed.
    pub fn append(&mut self, message: ChatMessage) -> bool {
        if let Some(id) = message.key.confirmed_id() {
            if !self.confirmed_ids.insert(id) {
                return false;
            }
        }
        self.messages.push(message);
        true
    }

    /// Removes exactly one message by key. Errors silently if the key is
    /// absent (idempotent); used to roll back a failed optimistic send.
    pub fn remove_by_key(&mut self, key: &MessageKey) -> bool {
        let Some(index) = self.messages.iter().position(|m| m.key == *key) else {
            return false;
        };
        let removed = self.messages.remove(index);
        if let Some(id) = removed.key.confirmed_id() {
            self.confirmed_ids.remove(&id);
        }
        true
    }

    /// Swaps a pending message for its confirmed counterpart in place.
    /// Falls back to `append` if the key is not found. If the confirmed id
    /// already arrived through polling, the pending entry is simply dropped
    /// so the log never holds two copies of one server message.
    pub fn replace(&mut self, key: &MessageKey, message: ChatMessage) {
        let Some(index) = self.messages.iter().position(|m| m.key == *key) else {
            self.append(message);
            return;
        };

        if let Some(id) = message.key.confirmed_id() {
            if self.confirmed_ids.contains(&id) {
                self.messages.remove(index);
                return;
            }
            self.confirmed_ids.insert(id);
        }
        if let Some(old_id) = self.messages[index].key.confirmed_id() {
            self.confirmed_ids.remove(&old_id);
        }
        self.messages[index] = message;
    }

    /// Merges a batch of confirmed messages in ascending id order and
    /// advances the watermark to the highest id observed. Returns the
    /// number of messages that were actually new.
    pub fn merge_confirmed_batch(&mut self, mut batch: Vec<ChatMessage>) -> usize {
        batch.sort_by_key(|message| message.key.confirmed_id());

        let mut appended = 0;
        let mut max_id = None;
        for message in batch {
            debug_assert_eq!(message.status, MessageStatus::Confirmed);
            let id = message.key.confirmed_id();
            if self.append(message) {
                appended += 1;
            }
            max_id = max_id.max(id);
        }
        if let Some(id) = max_id {
            self.advance_watermark(id);
        }
        appended
    }

    pub fn highest_confirmed_id(&self) -> Option<MessageId> {
        self.confirmed_ids.iter().copied().max()
    }

    pub fn last_seen_id(&self) -> Option<MessageId> {
        self.last_seen_id
    }

    /// Watermark only ever moves forward.
    pub fn advance_watermark(&mut self, id: MessageId) {
        if self.last_seen_id.map_or(true, |current| id > current) {
            self.last_seen_id = Some(id);
        }
    }

    /// Ordered copy of the log for rendering. Callers never see the
    /// internal buffer.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn has_pending(&self) -> bool {
        self.messages
            .iter()
            .any(|message| message.status == MessageStatus::Pending)
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
