//! Notification fan-out to the presentation layer.
//!
//! Two independent channels: connection-state transitions and
//! conversation-state changes. Handlers run synchronously on the emitting
//! task and may subscribe or unsubscribe (themselves included) while a
//! notification is being delivered.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chatline_shared::{Message, MessageId};

use crate::connection::ConnectionState;
use crate::error::ChatError;
use crate::optimistic::OperationKind;

/// Ordered, immutable view of the conversation.
pub type Snapshot = Arc<Vec<Message>>;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    /// A retry has been scheduled after a transport failure.
    ReconnectScheduled { attempt: u32, delay: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    /// The conversation changed; carries the full ordered snapshot.
    Changed(Snapshot),
    /// A user action failed on the server and its local effect was undone.
    Rejected {
        kind: OperationKind,
        target: MessageId,
        error: ChatError,
    },
    /// Frame received on the per-user error queue.
    ServerError { message: String },
}

/// Identifies a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct ListenerTable<E> {
    next_id: u64,
    entries: Vec<(ListenerId, Handler<E>)>,
}

/// A list of handlers for one event type.
pub struct Listeners<E> {
    table: Arc<Mutex<ListenerTable<E>>>,
}

impl<E> Clone for Listeners<E> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
        }
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            table: Arc::new(Mutex::new(ListenerTable {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }
}

impl<E> Listeners<E> {
    fn lock(&self) -> MutexGuard<'_, ListenerTable<E>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> ListenerId {
        let mut table = self.lock();
        let id = ListenerId(table.next_id);
        table.next_id += 1;
        table.entries.push((id, Arc::new(handler)));
        id
    }

    /// Returns false if the handler was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut table = self.lock();
        let before = table.entries.len();
        table.entries.retain(|(entry, _)| *entry != id);
        table.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every handler registered when the call started.
    ///
    /// The lock is never held while a handler runs. A handler removed during
    /// delivery is skipped if it has not been called yet; handlers added
    /// during delivery only see later events.
    pub fn emit(&self, event: &E) {
        let handlers: Vec<(ListenerId, Handler<E>)> = self.lock().entries.clone();
        for (id, handler) in handlers {
            let still_registered = self.lock().entries.iter().any(|(entry, _)| *entry == id);
            if still_registered {
                handler(event);
            }
        }
    }
}

/// The two notification channels of the core.
#[derive(Clone, Default)]
pub struct EventBus {
    pub connection: Listeners<ConnectionEvent>,
    pub conversation: Listeners<ConversationEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delivers_to_all_and_stops_after_unsubscribe() {
        let listeners = Listeners::<u32>::default();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let first = listeners.subscribe(move |v| {
            h.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let h = hits.clone();
        listeners.subscribe(move |v| {
            h.fetch_add(*v as usize, Ordering::SeqCst);
        });

        listeners.emit(&1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        assert!(listeners.unsubscribe(first));
        assert!(!listeners.unsubscribe(first));
        listeners.emit(&10);
        assert_eq!(hits.load(Ordering::SeqCst), 12);
    }

    #[test]
    fn handler_can_unsubscribe_itself_and_others() {
        let listeners = Listeners::<()>::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let own_id = Arc::new(Mutex::new(None::<ListenerId>));
        let victim_id = Arc::new(Mutex::new(None::<ListenerId>));

        let (l, c, own, victim) = (
            listeners.clone(),
            calls.clone(),
            own_id.clone(),
            victim_id.clone(),
        );
        let id = listeners.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *own.lock().unwrap() {
                l.unsubscribe(id);
            }
            if let Some(id) = *victim.lock().unwrap() {
                l.unsubscribe(id);
            }
        });
        *own_id.lock().unwrap() = Some(id);

        let c = calls.clone();
        let victim = listeners.subscribe(move |_| {
            c.fetch_add(100, Ordering::SeqCst);
        });
        *victim_id.lock().unwrap() = Some(victim);

        listeners.emit(&());
        listeners.emit(&());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(listeners.is_empty());
    }

    #[test]
    fn handler_can_subscribe_during_delivery() {
        let listeners = Listeners::<()>::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let (l, c) = (listeners.clone(), calls.clone());
        listeners.subscribe(move |_| {
            let c = c.clone();
            l.subscribe(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });
        });

        listeners.emit(&());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(listeners.len(), 2);
        listeners.emit(&());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
