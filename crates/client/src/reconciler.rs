//! Merges inbound message events into the conversation state.
//!
//! Rules, per event:
//! - `Created`: drop if the id is known. Otherwise, if a provisional entry
//!   carries the same fingerprint within the delivery window, the new message
//!   takes its place; else it is inserted.
//! - `Edited`: drop if the id is unknown or tombstoned; otherwise set content
//!   and edit time, never the timestamp.
//! - `Deleted`: drop if the id is unknown; otherwise tombstone it.
//!
//! Because the state order is a total order on `(timestamp, id)`, applying
//! the same set of events in any arrival order converges to the same
//! sequence.

use std::time::Duration;

use chatline_shared::{Message, MessageEvent, MessageId, UserId};
use chrono::{DateTime, Utc};

use crate::conversation::ConversationState;

/// Identity of a message independent of its id: who sent what to whom.
/// Timestamps are compared separately against the delivery window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    sender: UserId,
    /// `None` is the broadcast marker.
    receiver: Option<UserId>,
    content: String,
}

impl Fingerprint {
    pub fn of(message: &Message) -> Self {
        Self {
            sender: message.sender_id.clone(),
            receiver: message.receiver_id.clone(),
            content: message.content.clone(),
        }
    }
}

/// Why an event left the state untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    /// The id is already present (redelivery).
    Duplicate,
    /// Edit or delete for a message never observed.
    UnknownTarget,
    /// Edit of a deleted message.
    Tombstoned,
    /// The event matches what is already stored.
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Inserted(MessageId),
    /// A provisional entry was superseded by its authoritative copy.
    Replaced {
        provisional: MessageId,
        id: MessageId,
    },
    Edited(MessageId),
    Deleted(MessageId),
    Discarded(MessageId, Discard),
}

impl Outcome {
    pub fn changed(&self) -> bool {
        !matches!(self, Outcome::Discarded(..))
    }
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    delivery_window: chrono::Duration,
    deletion_marker: String,
}

impl Reconciler {
    pub fn new(delivery_window: Duration, deletion_marker: impl Into<String>) -> Self {
        Self {
            delivery_window: chrono::Duration::from_std(delivery_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(1)),
            deletion_marker: deletion_marker.into(),
        }
    }

    pub fn deletion_marker(&self) -> &str {
        &self.deletion_marker
    }

    pub fn apply(&self, state: &mut ConversationState, event: MessageEvent) -> Outcome {
        match event {
            MessageEvent::Created(message) => self.created(state, message),
            MessageEvent::Edited {
                id,
                content,
                edited_at,
            } => self.edited(state, id, content, edited_at),
            MessageEvent::Deleted { id } => self.deleted(state, id),
        }
    }

    fn created(&self, state: &mut ConversationState, mut message: Message) -> Outcome {
        let id = message.id;
        if state.contains(id) {
            return Outcome::Discarded(id, Discard::Duplicate);
        }

        if !message.is_provisional() {
            if let Some(provisional) = self.find_provisional_match(state, &message) {
                match state.replace(provisional, message) {
                    Ok(()) => return Outcome::Replaced { provisional, id },
                    Err(rejected) => message = rejected,
                }
            }
        }

        state.insert(message);
        Outcome::Inserted(id)
    }

    /// Oldest provisional entry with the same fingerprint whose timestamp is
    /// within the delivery window of `message`.
    fn find_provisional_match(
        &self,
        state: &ConversationState,
        message: &Message,
    ) -> Option<MessageId> {
        let fingerprint = Fingerprint::of(message);
        state
            .iter()
            .filter(|m| m.is_provisional() && !m.deleted)
            .filter(|m| (m.timestamp - message.timestamp).abs() <= self.delivery_window)
            .find(|m| Fingerprint::of(m) == fingerprint)
            .map(|m| m.id)
    }

    fn edited(
        &self,
        state: &mut ConversationState,
        id: MessageId,
        content: String,
        edited_at: DateTime<Utc>,
    ) -> Outcome {
        let Some(message) = state.get_mut(id) else {
            return Outcome::Discarded(id, Discard::UnknownTarget);
        };
        if message.deleted {
            return Outcome::Discarded(id, Discard::Tombstoned);
        }
        if message.content == content && message.last_edited_at == Some(edited_at) {
            return Outcome::Discarded(id, Discard::Unchanged);
        }
        apply_edit(message, content, edited_at);
        Outcome::Edited(id)
    }

    fn deleted(&self, state: &mut ConversationState, id: MessageId) -> Outcome {
        let Some(message) = state.get_mut(id) else {
            return Outcome::Discarded(id, Discard::UnknownTarget);
        };
        if message.deleted {
            return Outcome::Discarded(id, Discard::Unchanged);
        }
        self.tombstone(message);
        Outcome::Deleted(id)
    }

    /// Mark deleted and hide the content. `last_edited_at` is left alone.
    pub fn tombstone(&self, message: &mut Message) {
        message.deleted = true;
        message.content = self.deletion_marker.clone();
    }
}

/// Set new content and edit time. Ordering fields are untouched.
pub fn apply_edit(message: &mut Message, content: String, edited_at: DateTime<Utc>) {
    message.content = content;
    message.last_edited_at = Some(edited_at);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: u32, millis: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, secs).unwrap()
            + chrono::Duration::milliseconds(millis)
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(Duration::from_secs(1), "[deleted]")
    }

    fn created(id: MessageId, content: &str, ts: DateTime<Utc>) -> MessageEvent {
        MessageEvent::Created(Message::new(id, "alice", None, content, ts))
    }

    #[test]
    fn duplicate_created_is_absorbed() {
        let r = reconciler();
        let mut state = ConversationState::new();
        assert_eq!(r.apply(&mut state, created(5, "A", at(0, 0))), Outcome::Inserted(5));
        assert_eq!(
            r.apply(&mut state, created(5, "A", at(0, 0))),
            Outcome::Discarded(5, Discard::Duplicate)
        );
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn edit_keeps_timestamp_and_sets_edit_time() {
        let r = reconciler();
        let mut state = ConversationState::new();
        r.apply(&mut state, created(5, "A", at(0, 0)));
        let outcome = r.apply(
            &mut state,
            MessageEvent::Edited {
                id: 5,
                content: "B".into(),
                edited_at: at(30, 0),
            },
        );
        assert_eq!(outcome, Outcome::Edited(5));
        let m = state.get(5).unwrap();
        assert_eq!(m.content, "B");
        assert_eq!(m.last_edited_at, Some(at(30, 0)));
        assert_eq!(m.timestamp, at(0, 0));
    }

    #[test]
    fn edit_and_delete_of_unknown_ids_are_dropped() {
        let r = reconciler();
        let mut state = ConversationState::new();
        let edit = MessageEvent::Edited {
            id: 9,
            content: "x".into(),
            edited_at: at(0, 0),
        };
        assert_eq!(
            r.apply(&mut state, edit),
            Outcome::Discarded(9, Discard::UnknownTarget)
        );
        assert_eq!(
            r.apply(&mut state, MessageEvent::Deleted { id: 9 }),
            Outcome::Discarded(9, Discard::UnknownTarget)
        );
        assert!(state.is_empty());
    }

    #[test]
    fn tombstone_blocks_later_edits() {
        let r = reconciler();
        let mut state = ConversationState::new();
        r.apply(&mut state, created(5, "A", at(0, 0)));
        assert_eq!(
            r.apply(&mut state, MessageEvent::Deleted { id: 5 }),
            Outcome::Deleted(5)
        );
        let edit = MessageEvent::Edited {
            id: 5,
            content: "C".into(),
            edited_at: at(1, 0),
        };
        assert_eq!(
            r.apply(&mut state, edit),
            Outcome::Discarded(5, Discard::Tombstoned)
        );
        let m = state.get(5).unwrap();
        assert!(m.deleted);
        assert_eq!(m.content, "[deleted]");
        assert_eq!(m.last_edited_at, None);
        assert_eq!(
            r.apply(&mut state, MessageEvent::Deleted { id: 5 }),
            Outcome::Discarded(5, Discard::Unchanged)
        );
    }

    #[test]
    fn authoritative_copy_replaces_provisional_entry() {
        let r = reconciler();
        let mut state = ConversationState::new();
        state.insert(Message::new(-1, "alice", Some("bob".into()), "hello", at(0, 100)));
        r.apply(&mut state, created(3, "earlier", at(0, 500)));

        let authoritative = Message::new(42, "alice", Some("bob".into()), "hello", at(0, 700));
        let outcome = r.apply(&mut state, MessageEvent::Created(authoritative));
        assert_eq!(
            outcome,
            Outcome::Replaced {
                provisional: -1,
                id: 42
            }
        );
        let ids: Vec<_> = state.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![3, 42]);
    }

    #[test]
    fn fingerprint_outside_window_inserts_separately() {
        let r = reconciler();
        let mut state = ConversationState::new();
        state.insert(Message::new(-1, "alice", None, "hi", at(0, 0)));
        let late = Message::new(42, "alice", None, "hi", at(5, 0));
        assert_eq!(
            r.apply(&mut state, MessageEvent::Created(late)),
            Outcome::Inserted(42)
        );
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn fingerprint_distinguishes_receivers() {
        let r = reconciler();
        let mut state = ConversationState::new();
        state.insert(Message::new(-1, "alice", Some("bob".into()), "hi", at(0, 0)));
        let broadcast = Message::new(42, "alice", None, "hi", at(0, 10));
        assert_eq!(
            r.apply(&mut state, MessageEvent::Created(broadcast)),
            Outcome::Inserted(42)
        );
        assert!(state.contains(-1));
    }

    #[test]
    fn server_entries_are_never_fingerprint_targets() {
        let r = reconciler();
        let mut state = ConversationState::new();
        r.apply(&mut state, created(7, "ok", at(0, 0)));
        assert_eq!(
            r.apply(&mut state, created(8, "ok", at(0, 200))),
            Outcome::Inserted(8)
        );
        assert_eq!(state.len(), 2);
    }
}
