//! Error taxonomy of the synchronization core.

use chatline_shared::{ApiError, EnvelopeError, FrameError, MessageId};
use thiserror::Error;

/// Socket, handshake or liveness failure. Recovered by reconnecting.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("could not open transport: {0}")]
    Connect(String),
    #[error("transport i/o failed: {0}")]
    Io(String),
    #[error("transport closed by peer")]
    Closed,
    #[error("broker rejected the handshake: {0}")]
    Handshake(String),
    #[error("broker reported an error: {0}")]
    Broker(String),
    #[error("no frame from broker within {0:?}")]
    HeartbeatTimeout(std::time::Duration),
}

/// Why a local request was refused before any network call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message content is empty")]
    EmptyContent,
    #[error("edit does not change the message")]
    NoOpEdit,
    #[error("message {0} has not been acknowledged by the server yet")]
    NotDelivered(MessageId),
    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("protocol error: {0}")]
    ProtocolParse(String),
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),
    #[error("not permitted: {0}")]
    Authorization(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("a connection is already active")]
    AlreadyConnected,
    #[error("not connected to the broker")]
    NotConnected,
    #[error("request failed: {0}")]
    Api(String),
    #[error("sync engine has stopped")]
    EngineStopped,
}

impl From<EnvelopeError> for ChatError {
    fn from(err: EnvelopeError) -> Self {
        ChatError::ProtocolParse(err.to_string())
    }
}

impl From<FrameError> for ChatError {
    fn from(err: FrameError) -> Self {
        ChatError::ProtocolParse(err.to_string())
    }
}

impl From<ApiError> for ChatError {
    fn from(err: ApiError) -> Self {
        match err.status() {
            Some(400) => ChatError::Validation(ValidationError::Rejected(err.reason())),
            Some(403) => ChatError::Authorization(err.reason()),
            Some(404) => ChatError::NotFound(err.reason()),
            _ => ChatError::Api(err.to_string()),
        }
    }
}

/// Invalid or missing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}
