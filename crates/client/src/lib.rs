//! Chatline client - real-time synchronization core
//!
//! Keeps a live STOMP-over-WebSocket session to the chat broker and merges
//! broker events, REST results and optimistic local edits into one ordered
//! conversation view for the presentation layer.

pub mod api_client;
pub mod client;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod directory;
pub mod engine;
pub mod error;
pub mod event_bus;
pub mod logging;
pub mod optimistic;
pub mod reconciler;
pub mod router;
pub mod transport;

pub use api_client::{ApiClient, MessageApi};
pub use client::{ActionHandle, ChatClient};
pub use config::{ClientConfig, Credentials, HeartbeatConfig, ReconnectConfig, ReconnectStrategy};
pub use connection::{ConnectionManager, ConnectionState};
pub use conversation::ConversationState;
pub use directory::UserDirectory;
pub use error::{ChatError, ConfigError, TransportError, ValidationError};
pub use event_bus::{ConnectionEvent, ConversationEvent, EventBus, ListenerId, Snapshot};
pub use optimistic::OperationKind;
pub use reconciler::{Discard, Outcome, Reconciler};
pub use transport::{FrameSink, FrameStream, Transport, WebSocketTransport};
