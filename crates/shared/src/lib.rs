//! Shared types for chatline clients: message models, the chat envelope and
//! the broker frame codec.

pub mod error;
pub mod frame;
pub mod models;
pub mod protocol;

pub use error::*;
pub use frame::{Command, Frame, HEARTBEAT};
pub use models::*;
pub use protocol::*;
