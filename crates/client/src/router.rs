//! Logical subscriptions multiplexed over one broker session.
//!
//! The router declares the broadcast, direct and error channels, produces the
//! SUBSCRIBE frames for every new session (the broker forgets subscriptions
//! when a connection drops) and routes MESSAGE frames by their subscription
//! id: message events go to the sync engine, error-queue frames straight to
//! the notification bus.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chatline_shared::{Command, Envelope, Frame, MessageEvent, UserId};
use chrono::Utc;
use tokio::sync::mpsc;

use crate::config::{ClientConfig, Destinations};
use crate::event_bus::{ConversationEvent, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Broadcast,
    Direct,
    Errors,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Broadcast, Channel::Direct, Channel::Errors];

    /// Subscription id used on the wire.
    pub fn subscription_id(&self) -> &'static str {
        match self {
            Channel::Broadcast => "sub-broadcast",
            Channel::Direct => "sub-direct",
            Channel::Errors => "sub-errors",
        }
    }
}

/// What became of an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Handed to the sync engine.
    Reconcile(Channel),
    /// Published as a server error notification.
    ServerError,
    /// Dropped; the reason has been logged.
    Dropped,
    /// The sync engine is gone; nothing can consume events any more.
    Closed,
}

pub struct SubscriptionRouter {
    user_id: UserId,
    destinations: Destinations,
    inbound: mpsc::UnboundedSender<MessageEvent>,
    bus: EventBus,
    active: Mutex<HashMap<String, Channel>>,
}

impl SubscriptionRouter {
    pub fn new(
        config: &ClientConfig,
        inbound: mpsc::UnboundedSender<MessageEvent>,
        bus: EventBus,
    ) -> Self {
        Self {
            user_id: config.user_id.clone(),
            destinations: config.destinations.clone(),
            inbound,
            bus,
            active: Mutex::new(HashMap::new()),
        }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, Channel>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn destination(&self, channel: Channel) -> String {
        let template = match channel {
            Channel::Broadcast => &self.destinations.broadcast,
            Channel::Direct => &self.destinations.direct,
            Channel::Errors => &self.destinations.errors,
        };
        Destinations::resolve(template, &self.user_id)
    }

    /// SUBSCRIBE frames for all channels of a fresh session.
    pub fn subscribe_frames(&self) -> Vec<Frame> {
        let mut active = self.active();
        active.clear();
        Channel::ALL
            .iter()
            .map(|channel| {
                active.insert(channel.subscription_id().to_string(), *channel);
                Frame::new(Command::Subscribe)
                    .header("id", channel.subscription_id())
                    .header("destination", self.destination(*channel))
                    .header("ack", "auto")
            })
            .collect()
    }

    /// UNSUBSCRIBE frames for the channels of the current session. Clears the
    /// routing table.
    pub fn unsubscribe_frames(&self) -> Vec<Frame> {
        let mut active = self.active();
        let frames = Channel::ALL
            .iter()
            .filter(|channel| active.contains_key(channel.subscription_id()))
            .map(|channel| Frame::new(Command::Unsubscribe).header("id", channel.subscription_id()))
            .collect();
        active.clear();
        frames
    }

    /// Forget all subscriptions without producing frames.
    pub fn reset(&self) {
        self.active().clear();
    }

    pub fn is_subscribed(&self, channel: Channel) -> bool {
        self.active().contains_key(channel.subscription_id())
    }

    /// Route one MESSAGE frame. Malformed bodies are dropped and logged.
    pub fn route(&self, frame: &Frame) -> Routed {
        let channel = frame
            .get("subscription")
            .and_then(|id| self.active().get(id).copied());
        let Some(channel) = channel else {
            crate::log_warn!(
                "Dropping frame for unknown subscription {:?} (destination {:?})",
                frame.get("subscription"),
                frame.get("destination")
            );
            return Routed::Dropped;
        };

        let parsed = Envelope::parse(&frame.body, Utc::now());

        if channel == Channel::Errors {
            let message = match parsed {
                Ok(Envelope::Error { message }) => message,
                _ => frame.body.trim().to_string(),
            };
            self.notify_error(message);
            return Routed::ServerError;
        }

        match parsed {
            Ok(Envelope::Message(event)) => {
                crate::log_debug!("Routing {:?} event for message {}", channel, event.message_id());
                if self.inbound.send(event).is_err() {
                    crate::log_error!("Sync engine stopped, cannot deliver inbound event");
                    return Routed::Closed;
                }
                Routed::Reconcile(channel)
            }
            Ok(Envelope::Error { message }) => {
                self.notify_error(message);
                Routed::ServerError
            }
            Err(e) => {
                crate::log_warn!("Dropping malformed frame on {:?}: {}", channel, e);
                Routed::Dropped
            }
        }
    }

    fn notify_error(&self, message: String) {
        crate::log_warn!("Server error notification: {}", message);
        self.bus
            .conversation
            .emit(&ConversationEvent::ServerError { message });
    }
}
