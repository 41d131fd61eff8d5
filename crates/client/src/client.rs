//! Entry point for the presentation layer.
//!
//! [`ChatClient`] wires the connection manager, subscription router and sync
//! engine together. Every action returns immediately with an
//! [`ActionHandle`]; results and state changes are also published on the
//! [`EventBus`].

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use chatline_shared::{Message, MessageId, UserId};
use tokio::sync::{mpsc, oneshot, watch};
use url::Url;

use crate::api_client::{ApiClient, MessageApi};
use crate::config::{ClientConfig, Credentials};
use crate::connection::{ConnectionManager, ConnectionState, Publisher};
use crate::directory::UserDirectory;
use crate::engine::{EngineChannels, EngineCommand, Reply, SyncEngine};
use crate::error::ChatError;
use crate::event_bus::{EventBus, Snapshot};
use crate::router::SubscriptionRouter;
use crate::transport::{Transport, WebSocketTransport};

/// Pending result of a user action. Dropping it does not cancel the action.
#[must_use = "the action runs regardless; await the handle to observe its result"]
pub struct ActionHandle<T> {
    rx: oneshot::Receiver<Result<T, ChatError>>,
}

impl<T> ActionHandle<T> {
    fn channel() -> (Reply<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }
}

impl<T> Future for ActionHandle<T> {
    type Output = Result<T, ChatError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ChatError::EngineStopped)))
    }
}

pub struct ChatClient {
    config: ClientConfig,
    bus: EventBus,
    connection: Arc<ConnectionManager>,
    commands: mpsc::UnboundedSender<EngineCommand>,
    snapshots: watch::Receiver<Snapshot>,
    directory: UserDirectory,
}

impl ChatClient {
    /// Client over WebSocket and the HTTP backend named in `config`.
    pub fn from_config(config: ClientConfig) -> Self {
        let api = ApiClient::new()
            .with_base_url(config.api_base_url.clone())
            .with_token(config.credentials.token.clone());
        Self::new(config, Arc::new(WebSocketTransport), Arc::new(api))
    }

    /// Must be called inside a Tokio runtime; spawns the sync engine.
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        api: Arc<dyn MessageApi>,
    ) -> Self {
        let bus = EventBus::new();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let router = Arc::new(SubscriptionRouter::new(&config, inbound_tx, bus.clone()));
        let connection = Arc::new(ConnectionManager::new(&config, transport, router, bus.clone()));
        let publisher: Arc<dyn Publisher> = connection.clone();
        let publisher: Weak<dyn Publisher> = Arc::downgrade(&publisher);

        let (engine, snapshots) = SyncEngine::new(
            &config,
            api.clone(),
            publisher,
            bus.clone(),
            EngineChannels {
                inbound: inbound_rx,
                commands: commands_rx,
                resubmit: commands_tx.downgrade(),
            },
        );
        tokio::spawn(engine.run());

        Self {
            config,
            bus,
            connection,
            commands: commands_tx,
            snapshots,
            directory: UserDirectory::new(api),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.config.user_id
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn directory(&self) -> &UserDirectory {
        &self.directory
    }

    /// Connect to the configured endpoint with the configured credentials.
    pub fn connect(&self) -> Result<(), ChatError> {
        self.connect_to(self.config.endpoint.clone(), self.config.credentials.clone())
    }

    pub fn connect_to(&self, endpoint: Url, credentials: Credentials) -> Result<(), ChatError> {
        self.connection.connect(endpoint, credentials)
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Latest ordered view of the conversation.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver that is notified whenever a new snapshot is published.
    pub fn snapshots(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }

    /// Send to everyone, or to `receiver` only.
    pub fn send_message(
        &self,
        content: impl Into<String>,
        receiver: Option<UserId>,
    ) -> ActionHandle<Message> {
        let content = content.into();
        self.submit(|reply| EngineCommand::Send {
            content,
            receiver,
            reply,
        })
    }

    pub fn edit_message(&self, id: MessageId, content: impl Into<String>) -> ActionHandle<Message> {
        let content = content.into();
        self.submit(|reply| EngineCommand::Edit { id, content, reply })
    }

    pub fn delete_message(&self, id: MessageId) -> ActionHandle<Message> {
        self.submit(|reply| EngineCommand::Delete { id, reply })
    }

    /// Fetch the history over REST and merge it. Resolves with the number of
    /// messages that were new.
    pub fn load_history(&self) -> ActionHandle<usize> {
        self.submit(|reply| EngineCommand::LoadHistory { reply })
    }

    fn submit<T>(&self, command: impl FnOnce(Reply<T>) -> EngineCommand) -> ActionHandle<T> {
        let (reply, handle) = ActionHandle::channel();
        if self.commands.send(command(reply)).is_err() {
            crate::log_error!("Sync engine is not running");
        }
        handle
    }
}
