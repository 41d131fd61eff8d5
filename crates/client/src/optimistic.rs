//! Local-first send, edit and delete.
//!
//! Every user action is applied to the conversation state at once and
//! recorded as a [`PendingOperation`] holding what is needed to undo it.
//! When the durable request resolves the operation is removed exactly once:
//! confirmed on success, rolled back on failure.

use std::collections::HashMap;

use chatline_shared::{
    CreateMessageRequest, EditMessageRequest, Message, MessageEvent, MessageId, UserId,
};
use chrono::{DateTime, Utc};

use crate::conversation::ConversationState;
use crate::error::{ChatError, ValidationError};
use crate::reconciler::{apply_edit, Reconciler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Send,
    Edit,
    Delete,
}

/// An optimistic mutation awaiting its durable result.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    /// Negative, unique per session. For sends it is also the provisional
    /// message id.
    pub local_id: i64,
    pub kind: OperationKind,
    /// Entry as it was before the mutation; `None` for sends.
    pub original_snapshot: Option<Message>,
    pub target_id: MessageId,
}

/// Request to issue against the durable backend.
#[derive(Debug, Clone, PartialEq)]
pub enum DurableRequest {
    Create(CreateMessageRequest),
    Edit {
        id: MessageId,
        request: EditMessageRequest,
    },
    Delete {
        id: MessageId,
        acting_user_id: UserId,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Begun {
    pub op_id: i64,
    pub request: DurableRequest,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Confirmed {
        kind: OperationKind,
        message: Message,
        changed: bool,
    },
    RolledBack {
        kind: OperationKind,
        target: MessageId,
        error: ChatError,
        changed: bool,
    },
    /// The operation was already resolved.
    Stale,
}

impl Resolution {
    pub fn changed(&self) -> bool {
        match self {
            Resolution::Confirmed { changed, .. } | Resolution::RolledBack { changed, .. } => {
                *changed
            }
            Resolution::Stale => false,
        }
    }
}

#[derive(Debug)]
pub struct OptimisticCoordinator {
    user_id: UserId,
    next_local_id: i64,
    pending: HashMap<i64, PendingOperation>,
    /// Newest confirmed edit or delete per target, kept while other
    /// operations on that target are still pending.
    confirmed: HashMap<MessageId, i64>,
}

impl OptimisticCoordinator {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            next_local_id: -1,
            pending: HashMap::new(),
            confirmed: HashMap::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingOperation> {
        self.pending.values()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn allocate_id(&mut self) -> i64 {
        let id = self.next_local_id;
        self.next_local_id -= 1;
        id
    }

    /// Insert a provisional message through the reconciler's create path.
    pub fn begin_send(
        &mut self,
        state: &mut ConversationState,
        reconciler: &Reconciler,
        content: String,
        receiver: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Result<Begun, ChatError> {
        if content.trim().is_empty() {
            return Err(ValidationError::EmptyContent.into());
        }

        let local_id = self.allocate_id();
        let provisional = Message::new(
            local_id,
            self.user_id.clone(),
            receiver.clone(),
            content.clone(),
            now,
        );
        reconciler.apply(state, MessageEvent::Created(provisional));

        self.pending.insert(
            local_id,
            PendingOperation {
                local_id,
                kind: OperationKind::Send,
                original_snapshot: None,
                target_id: local_id,
            },
        );

        Ok(Begun {
            op_id: local_id,
            request: DurableRequest::Create(CreateMessageRequest {
                content,
                sender: self.user_id.clone(),
                receiver,
                timestamp: now,
            }),
        })
    }

    pub fn begin_edit(
        &mut self,
        state: &mut ConversationState,
        id: MessageId,
        content: String,
        now: DateTime<Utc>,
    ) -> Result<Begun, ChatError> {
        if content.trim().is_empty() {
            return Err(ValidationError::EmptyContent.into());
        }
        let current = self.check_mutable(state, id)?;
        if current.content == content {
            return Err(ValidationError::NoOpEdit.into());
        }
        let snapshot = current.clone();

        if let Some(message) = state.get_mut(id) {
            apply_edit(message, content.clone(), now);
        }
        let op_id = self.record(OperationKind::Edit, id, snapshot);

        Ok(Begun {
            op_id,
            request: DurableRequest::Edit {
                id,
                request: EditMessageRequest {
                    content,
                    acting_user_id: self.user_id.clone(),
                },
            },
        })
    }

    pub fn begin_delete(
        &mut self,
        state: &mut ConversationState,
        reconciler: &Reconciler,
        id: MessageId,
    ) -> Result<Begun, ChatError> {
        let snapshot = self.check_mutable(state, id)?.clone();

        if let Some(message) = state.get_mut(id) {
            reconciler.tombstone(message);
        }
        let op_id = self.record(OperationKind::Delete, id, snapshot);

        Ok(Begun {
            op_id,
            request: DurableRequest::Delete {
                id,
                acting_user_id: self.user_id.clone(),
            },
        })
    }

    fn record(&mut self, kind: OperationKind, target_id: MessageId, snapshot: Message) -> i64 {
        let local_id = self.allocate_id();
        self.pending.insert(
            local_id,
            PendingOperation {
                local_id,
                kind,
                original_snapshot: Some(snapshot),
                target_id,
            },
        );
        local_id
    }

    /// Local preconditions for edit and delete.
    fn check_mutable<'a>(
        &self,
        state: &'a ConversationState,
        id: MessageId,
    ) -> Result<&'a Message, ChatError> {
        let message = state
            .get(id)
            .ok_or_else(|| ChatError::NotFound(format!("message {id}")))?;
        if message.is_provisional() {
            return Err(ValidationError::NotDelivered(id).into());
        }
        if message.sender_id != self.user_id {
            return Err(ChatError::Authorization(format!(
                "message {id} belongs to another user"
            )));
        }
        if message.deleted {
            return Err(ChatError::Authorization(format!("message {id} is deleted")));
        }
        Ok(message)
    }

    /// The operation on the same target recorded right after `op`, if any.
    fn successor(&mut self, op: &PendingOperation) -> Option<&mut PendingOperation> {
        self.pending
            .values_mut()
            .filter(|p| p.kind != OperationKind::Send)
            .filter(|p| p.target_id == op.target_id && p.local_id < op.local_id)
            .max_by_key(|p| p.local_id)
    }

    /// True once an operation recorded after `op` on the same target has been
    /// confirmed; the server already holds a newer value.
    fn superseded(&self, op: &PendingOperation) -> bool {
        self.confirmed
            .get(&op.target_id)
            .is_some_and(|&newest| newest < op.local_id)
    }

    /// Fold the durable result of `op_id` back into the state.
    pub fn resolve(
        &mut self,
        state: &mut ConversationState,
        reconciler: &Reconciler,
        op_id: i64,
        result: Result<Message, ChatError>,
    ) -> Resolution {
        let Some(op) = self.pending.remove(&op_id) else {
            return Resolution::Stale;
        };
        let target = op.target_id;
        let resolution = match result {
            Ok(message) => self.confirm(state, reconciler, op, message),
            Err(error) => self.rollback(state, op, error),
        };
        if !self.pending.values().any(|p| p.target_id == target) {
            self.confirmed.remove(&target);
        }
        resolution
    }

    fn confirm(
        &mut self,
        state: &mut ConversationState,
        reconciler: &Reconciler,
        op: PendingOperation,
        message: Message,
    ) -> Resolution {
        let changed = match op.kind {
            OperationKind::Send => {
                if state.contains(op.local_id) {
                    if state.replace(op.local_id, message.clone()).is_err() {
                        // The authoritative copy arrived through the broker first.
                        state.remove(op.local_id);
                    }
                    true
                } else {
                    // Already superseded through the broker.
                    reconciler
                        .apply(state, MessageEvent::Created(message.clone()))
                        .changed()
                }
            }
            // A later change on this target is already durable.
            OperationKind::Edit | OperationKind::Delete if self.superseded(&op) => false,
            OperationKind::Edit | OperationKind::Delete => {
                self.confirmed.insert(op.target_id, op.local_id);
                if let Some(next) = self.successor(&op) {
                    // A later local change is still in flight; it must roll
                    // back to the confirmed value, not to the stale one.
                    next.original_snapshot = Some(message.clone());
                    false
                } else if op.kind == OperationKind::Edit {
                    let edited_at = message
                        .last_edited_at
                        .or_else(|| state.get(op.target_id).and_then(|m| m.last_edited_at))
                        .unwrap_or(message.timestamp);
                    reconciler
                        .apply(
                            state,
                            MessageEvent::Edited {
                                id: op.target_id,
                                content: message.content.clone(),
                                edited_at,
                            },
                        )
                        .changed()
                } else {
                    reconciler
                        .apply(state, MessageEvent::Deleted { id: op.target_id })
                        .changed()
                }
            }
        };

        Resolution::Confirmed {
            kind: op.kind,
            message,
            changed,
        }
    }

    fn rollback(
        &mut self,
        state: &mut ConversationState,
        op: PendingOperation,
        error: ChatError,
    ) -> Resolution {
        crate::log_warn!(
            "Rolling back {:?} of message {}: {}",
            op.kind,
            op.target_id,
            error
        );

        let changed = match (op.kind, op.original_snapshot.clone()) {
            (OperationKind::Send, _) => state.remove(op.local_id).is_some(),
            (_, Some(snapshot)) => {
                if self.superseded(&op) {
                    false
                } else if let Some(next) = self.successor(&op) {
                    next.original_snapshot = Some(snapshot);
                    false
                } else if op.kind == OperationKind::Edit
                    && state.get(op.target_id).is_some_and(|m| m.deleted)
                {
                    // Deleted meanwhile; the tombstone wins over the rollback.
                    false
                } else {
                    state.replace(op.target_id, snapshot).is_ok()
                }
            }
            (_, None) => false,
        };

        Resolution::RolledBack {
            kind: op.kind,
            target: op.target_id,
            error,
            changed,
        }
    }
}
