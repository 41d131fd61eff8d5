//! The sync engine: sole owner of the conversation state.
//!
//! Inbound broker events and commands (user actions, durable completions,
//! history results) arrive on two queues. After each wake-up the engine
//! drains both without awaiting, then publishes at most one snapshot and one
//! `Changed` notification, followed by any rejections and action replies.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chatline_shared::{encode_envelope, EnvelopeTag, Message, MessageEvent, MessageId, UserId};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};

use crate::api_client::MessageApi;
use crate::config::{ClientConfig, Destinations};
use crate::connection::Publisher;
use crate::conversation::ConversationState;
use crate::error::ChatError;
use crate::event_bus::{ConversationEvent, EventBus, Snapshot};
use crate::optimistic::{Begun, DurableRequest, OperationKind, OptimisticCoordinator, Resolution};
use crate::reconciler::{Outcome, Reconciler};

pub type Reply<T> = oneshot::Sender<Result<T, ChatError>>;

pub enum EngineCommand {
    Send {
        content: String,
        receiver: Option<UserId>,
        reply: Reply<Message>,
    },
    Edit {
        id: MessageId,
        content: String,
        reply: Reply<Message>,
    },
    Delete {
        id: MessageId,
        reply: Reply<Message>,
    },
    LoadHistory {
        reply: Reply<usize>,
    },
    /// Durable result of an optimistic operation.
    Resolved {
        op_id: i64,
        result: Result<Option<Message>, ChatError>,
    },
    HistoryLoaded {
        result: Result<Vec<Message>, ChatError>,
        reply: Reply<usize>,
    },
}

/// Queues the engine is fed through.
pub struct EngineChannels {
    pub inbound: mpsc::UnboundedReceiver<MessageEvent>,
    pub commands: mpsc::UnboundedReceiver<EngineCommand>,
    /// Handed to durable request tasks; weak so the engine does not keep
    /// its own command queue open.
    pub resubmit: mpsc::WeakUnboundedSender<EngineCommand>,
}

struct Waiter {
    kind: OperationKind,
    target: MessageId,
    reply: Reply<Message>,
}

/// Work deferred until the snapshot of the current drain is published.
enum Deferred {
    Notice(ConversationEvent),
    Message(Reply<Message>, Result<Message, ChatError>),
    Count(Reply<usize>, Result<usize, ChatError>),
}

pub struct SyncEngine {
    state: ConversationState,
    reconciler: Reconciler,
    coordinator: OptimisticCoordinator,
    api: Arc<dyn MessageApi>,
    publisher: Weak<dyn Publisher>,
    destinations: Destinations,
    user_id: UserId,
    relay_confirmed: bool,
    bus: EventBus,
    snapshot: watch::Sender<Snapshot>,
    channels: EngineChannels,
    waiters: HashMap<i64, Waiter>,
    outbox: Vec<Deferred>,
    dirty: bool,
}

impl SyncEngine {
    pub fn new(
        config: &ClientConfig,
        api: Arc<dyn MessageApi>,
        publisher: Weak<dyn Publisher>,
        bus: EventBus,
        channels: EngineChannels,
    ) -> (Self, watch::Receiver<Snapshot>) {
        let (snapshot, snapshot_rx) = watch::channel(Snapshot::default());
        let engine = Self {
            state: ConversationState::new(),
            reconciler: Reconciler::new(config.delivery_window, config.deletion_marker.clone()),
            coordinator: OptimisticCoordinator::new(config.user_id.clone()),
            api,
            publisher,
            destinations: config.destinations.clone(),
            user_id: config.user_id.clone(),
            relay_confirmed: config.relay_confirmed,
            bus,
            snapshot,
            channels,
            waiters: HashMap::new(),
            outbox: Vec::new(),
            dirty: false,
        };
        (engine, snapshot_rx)
    }

    /// Run until both queues are closed.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                Some(command) = self.channels.commands.recv() => self.handle_command(command),
                Some(event) = self.channels.inbound.recv() => self.handle_event(event),
                else => break,
            }
            self.drain();
            self.flush();
        }
        crate::log_debug!("Sync engine stopped");
    }

    fn drain(&mut self) {
        loop {
            let mut progressed = false;
            while let Ok(event) = self.channels.inbound.try_recv() {
                self.handle_event(event);
                progressed = true;
            }
            while let Ok(command) = self.channels.commands.try_recv() {
                self.handle_command(command);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    fn flush(&mut self) {
        if std::mem::take(&mut self.dirty) {
            let snapshot = self.state.snapshot();
            self.snapshot.send_replace(snapshot.clone());
            self.bus
                .conversation
                .emit(&ConversationEvent::Changed(snapshot));
        }
        for deferred in std::mem::take(&mut self.outbox) {
            match deferred {
                Deferred::Notice(event) => self.bus.conversation.emit(&event),
                Deferred::Message(reply, result) => {
                    let _ = reply.send(result);
                }
                Deferred::Count(reply, result) => {
                    let _ = reply.send(result);
                }
            }
        }
    }

    fn handle_event(&mut self, event: MessageEvent) {
        let outcome = self.reconciler.apply(&mut self.state, event);
        match outcome {
            Outcome::Discarded(id, reason) => {
                crate::log_debug!("Discarded event for message {}: {:?}", id, reason)
            }
            Outcome::Replaced { provisional, id } => {
                crate::log_debug!("Provisional message {} superseded by {}", provisional, id)
            }
            _ => {}
        }
        self.dirty |= outcome.changed();
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Send {
                content,
                receiver,
                reply,
            } => {
                let begun = self.coordinator.begin_send(
                    &mut self.state,
                    &self.reconciler,
                    content,
                    receiver,
                    Utc::now(),
                );
                self.start(OperationKind::Send, begun, None, reply);
            }
            EngineCommand::Edit { id, content, reply } => {
                let begun = self
                    .coordinator
                    .begin_edit(&mut self.state, id, content, Utc::now());
                self.start(OperationKind::Edit, begun, Some(id), reply);
            }
            EngineCommand::Delete { id, reply } => {
                let begun = self
                    .coordinator
                    .begin_delete(&mut self.state, &self.reconciler, id);
                self.start(OperationKind::Delete, begun, Some(id), reply);
            }
            EngineCommand::LoadHistory { reply } => self.fetch_history(reply),
            EngineCommand::Resolved { op_id, result } => self.resolve(op_id, result),
            EngineCommand::HistoryLoaded { result, reply } => {
                let result = result.map(|messages| self.merge_history(messages));
                self.outbox.push(Deferred::Count(reply, result));
            }
        }
    }

    /// Record the optimistic change and issue its durable request.
    fn start(
        &mut self,
        kind: OperationKind,
        begun: Result<Begun, ChatError>,
        target: Option<MessageId>,
        reply: Reply<Message>,
    ) {
        let begun = match begun {
            Ok(begun) => begun,
            Err(error) => {
                crate::log_warn!("Rejected {:?} locally: {}", kind, error);
                self.outbox.push(Deferred::Message(reply, Err(error)));
                return;
            }
        };

        self.dirty = true;
        let op_id = begun.op_id;
        self.waiters.insert(
            op_id,
            Waiter {
                kind,
                target: target.unwrap_or(op_id),
                reply,
            },
        );

        let Some(resubmit) = self.channels.resubmit.upgrade() else {
            // Client handle is gone; nobody is left to observe the result.
            self.resolve(op_id, Err(ChatError::EngineStopped));
            return;
        };
        let api = self.api.clone();
        tokio::spawn(async move {
            let result = match begun.request {
                DurableRequest::Create(request) => api.create_message(&request).await.map(Some),
                DurableRequest::Edit { id, request } => {
                    api.edit_message(id, &request).await.map(Some)
                }
                DurableRequest::Delete { id, acting_user_id } => {
                    api.delete_message(id, &acting_user_id).await
                }
            }
            .map_err(ChatError::from);
            let _ = resubmit.send(EngineCommand::Resolved { op_id, result });
        });
    }

    fn resolve(&mut self, op_id: i64, result: Result<Option<Message>, ChatError>) {
        let Some(waiter) = self.waiters.remove(&op_id) else {
            crate::log_warn!("Result for unknown operation {}", op_id);
            return;
        };

        let result = result.and_then(|message| match message {
            Some(message) => Ok(message),
            // Bodiless delete: the local tombstone is the authoritative state.
            None => self
                .state
                .get(waiter.target)
                .cloned()
                .map(|mut message| {
                    self.reconciler.tombstone(&mut message);
                    message
                })
                .ok_or_else(|| ChatError::NotFound(format!("message {}", waiter.target))),
        });

        let resolution = self
            .coordinator
            .resolve(&mut self.state, &self.reconciler, op_id, result);
        self.dirty |= resolution.changed();

        match resolution {
            Resolution::Confirmed { kind, message, .. } => {
                self.relay(kind, &message);
                self.outbox.push(Deferred::Message(waiter.reply, Ok(message)));
            }
            Resolution::RolledBack {
                kind,
                target,
                error,
                ..
            } => {
                self.outbox.push(Deferred::Notice(ConversationEvent::Rejected {
                    kind,
                    target,
                    error: error.clone(),
                }));
                self.outbox.push(Deferred::Message(waiter.reply, Err(error)));
            }
            Resolution::Stale => {
                crate::log_warn!("{:?} operation {} was already resolved", waiter.kind, op_id);
            }
        }
    }

    /// Publish a confirmed mutation to the broker's outbound destination.
    fn relay(&self, kind: OperationKind, message: &Message) {
        if !self.relay_confirmed {
            return;
        }
        let (tag, template) = match kind {
            OperationKind::Send if message.receiver_id.is_some() => {
                (EnvelopeTag::Created, &self.destinations.publish_direct)
            }
            OperationKind::Send => (EnvelopeTag::Created, &self.destinations.publish_broadcast),
            OperationKind::Edit => (EnvelopeTag::Edited, &self.destinations.publish_edit),
            OperationKind::Delete => (EnvelopeTag::Deleted, &self.destinations.publish_delete),
        };
        let destination = Destinations::resolve(template, &self.user_id);

        let body = match encode_envelope(tag, message) {
            Ok(body) => body,
            Err(e) => {
                crate::log_error!("Could not encode message {} for relay: {}", message.id, e);
                return;
            }
        };
        let Some(publisher) = self.publisher.upgrade() else {
            crate::log_warn!("Skipping relay of message {}: connection gone", message.id);
            return;
        };
        match publisher.publish(&destination, body) {
            Ok(()) => crate::log_debug!(
                "Relayed {:?} of message {} to {}",
                kind,
                message.id,
                destination
            ),
            Err(e) => crate::log_warn!("Skipping relay of message {}: {}", message.id, e),
        }
    }

    fn fetch_history(&mut self, reply: Reply<usize>) {
        let Some(resubmit) = self.channels.resubmit.upgrade() else {
            self.outbox.push(Deferred::Count(reply, Err(ChatError::EngineStopped)));
            return;
        };
        let api = self.api.clone();
        tokio::spawn(async move {
            let result = api.list_messages().await.map_err(ChatError::from);
            let _ = resubmit.send(EngineCommand::HistoryLoaded { result, reply });
        });
    }

    /// Fold REST history through the create path. Returns the number of
    /// entries that were not known yet.
    fn merge_history(&mut self, messages: Vec<Message>) -> usize {
        let mut inserted = 0;
        for mut message in messages {
            if message.deleted {
                self.reconciler.tombstone(&mut message);
            }
            let outcome = self
                .reconciler
                .apply(&mut self.state, MessageEvent::Created(message));
            if outcome.changed() {
                inserted += 1;
            }
        }
        crate::log_info!("Merged history: {} new messages", inserted);
        self.dirty |= inserted > 0;
        inserted
    }
}
