//! Canonical ordered conversation state.
//!
//! Messages are unique by id and always sorted by `(timestamp, id)`
//! ascending. Deleted messages stay in place as tombstones; the only entries
//! ever removed are provisional ones whose send failed or which were
//! superseded by their authoritative copy.

use std::sync::Arc;

use chatline_shared::{Message, MessageId};

use crate::event_bus::Snapshot;

#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    messages: Vec<Message>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.position(id).is_some()
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.position(id).map(|idx| &self.messages[idx])
    }

    /// Mutable access for in-place edits. Callers must not change `id` or
    /// `timestamp`; those determine the position.
    pub(crate) fn get_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        let idx = self.position(id)?;
        Some(&mut self.messages[idx])
    }

    fn position(&self, id: MessageId) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    /// Insert at the sorted position. Returns false if the id is taken.
    pub fn insert(&mut self, message: Message) -> bool {
        if self.contains(message.id) {
            return false;
        }
        let key = message.ordering_key();
        let pos = self
            .messages
            .binary_search_by(|m| m.ordering_key().cmp(&key))
            .unwrap_or_else(|pos| pos);
        self.messages.insert(pos, message);
        true
    }

    /// Remove an entry entirely.
    pub(crate) fn remove(&mut self, id: MessageId) -> Option<Message> {
        let idx = self.position(id)?;
        Some(self.messages.remove(idx))
    }

    /// Replace the entry `id` with `message`, re-sorting if the ordering key
    /// changed. Hands `message` back if `id` is absent or `message.id`
    /// belongs to a different existing entry.
    pub(crate) fn replace(&mut self, id: MessageId, message: Message) -> Result<(), Message> {
        let Some(idx) = self.position(id) else {
            return Err(message);
        };
        if message.id != id && self.contains(message.id) {
            return Err(message);
        }
        if self.messages[idx].ordering_key() == message.ordering_key() {
            self.messages[idx] = message;
        } else {
            self.messages.remove(idx);
            self.insert(message);
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Snapshot {
        Arc::new(self.messages.clone())
    }
}
