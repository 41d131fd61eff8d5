//! Chat message envelope carried in broker frame bodies.
//!
//! The wire format is a flat JSON object whose `type` field selects the event:
//!
//! ```json
//! { "id": 5, "content": "hi", "sender": "alice", "receiver": "bob",
//!   "type": "Created", "timestamp": "2024-05-01T10:00:00Z", "lastEdited": null }
//! ```
//!
//! It is resolved exactly once, at the parse boundary, into [`Envelope`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EnvelopeError;
use crate::models::{Message, MessageId, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum WireEnvelope {
    Created {
        #[serde(default)]
        id: Option<MessageId>,
        content: String,
        sender: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receiver: Option<UserId>,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default, rename = "lastEdited")]
        last_edited: Option<DateTime<Utc>>,
    },
    Edited {
        #[serde(default)]
        id: Option<MessageId>,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<UserId>,
        #[serde(default, rename = "lastEdited")]
        last_edited: Option<DateTime<Utc>>,
    },
    Deleted {
        #[serde(default)]
        id: Option<MessageId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<UserId>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
}

/// A message lifecycle event after parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageEvent {
    Created(Message),
    Edited {
        id: MessageId,
        content: String,
        edited_at: DateTime<Utc>,
    },
    Deleted {
        id: MessageId,
    },
}

impl MessageEvent {
    /// Id of the message the event refers to.
    pub fn message_id(&self) -> MessageId {
        match self {
            MessageEvent::Created(message) => message.id,
            MessageEvent::Edited { id, .. } | MessageEvent::Deleted { id } => *id,
        }
    }
}

/// Closed set of envelopes the broker can deliver.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Message(MessageEvent),
    Error { message: String },
}

impl Envelope {
    /// Parse a frame body. Missing timestamps default to `received_at`.
    pub fn parse(body: &str, received_at: DateTime<Utc>) -> Result<Self, EnvelopeError> {
        let wire: WireEnvelope =
            serde_json::from_str(body).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

        let envelope = match wire {
            WireEnvelope::Created {
                id,
                content,
                sender,
                receiver,
                timestamp,
                last_edited,
            } => {
                let id = id.ok_or(EnvelopeError::MissingField("id"))?;
                let mut message =
                    Message::new(id, sender, receiver, content, timestamp.unwrap_or(received_at));
                message.last_edited_at = last_edited;
                Envelope::Message(MessageEvent::Created(message))
            }
            WireEnvelope::Edited {
                id,
                content,
                last_edited,
                ..
            } => Envelope::Message(MessageEvent::Edited {
                id: id.ok_or(EnvelopeError::MissingField("id"))?,
                content,
                edited_at: last_edited.unwrap_or(received_at),
            }),
            WireEnvelope::Deleted { id, .. } => Envelope::Message(MessageEvent::Deleted {
                id: id.ok_or(EnvelopeError::MissingField("id"))?,
            }),
            WireEnvelope::Error { message, content } => Envelope::Error {
                message: message
                    .or(content)
                    .unwrap_or_else(|| "unspecified broker error".to_string()),
            },
        };

        Ok(envelope)
    }
}

/// Envelope tags used when publishing a confirmed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeTag {
    Created,
    Edited,
    Deleted,
}

/// Serialize an authoritative message as an envelope of the given tag.
pub fn encode_envelope(tag: EnvelopeTag, message: &Message) -> Result<String, EnvelopeError> {
    let wire = match tag {
        EnvelopeTag::Created => WireEnvelope::Created {
            id: Some(message.id),
            content: message.content.clone(),
            sender: message.sender_id.clone(),
            receiver: message.receiver_id.clone(),
            timestamp: Some(message.timestamp),
            last_edited: message.last_edited_at,
        },
        EnvelopeTag::Edited => WireEnvelope::Edited {
            id: Some(message.id),
            content: message.content.clone(),
            sender: Some(message.sender_id.clone()),
            last_edited: message.last_edited_at,
        },
        EnvelopeTag::Deleted => WireEnvelope::Deleted {
            id: Some(message.id),
            sender: Some(message.sender_id.clone()),
        },
    };
    serde_json::to_string(&wire).map_err(|e| EnvelopeError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn parses_created_direct_message() {
        let body = r#"{"id":5,"content":"A","sender":"alice","receiver":"bob","type":"Created","timestamp":"2024-05-01T10:00:00Z","lastEdited":null}"#;
        let Envelope::Message(MessageEvent::Created(message)) =
            Envelope::parse(body, now()).unwrap()
        else {
            panic!("expected Created");
        };
        assert_eq!(message.id, 5);
        assert_eq!(message.receiver_id.as_deref(), Some("bob"));
        assert_eq!(
            message.timestamp,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn created_without_timestamp_uses_receipt_time() {
        let body = r#"{"id":1,"content":"x","sender":"a","type":"Created"}"#;
        let envelope = Envelope::parse(body, now()).unwrap();
        match envelope {
            Envelope::Message(MessageEvent::Created(m)) => assert_eq!(m.timestamp, now()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn created_without_id_is_rejected() {
        let body = r#"{"content":"x","sender":"a","type":"Created"}"#;
        assert_eq!(
            Envelope::parse(body, now()),
            Err(EnvelopeError::MissingField("id"))
        );
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let body = r#"{"id":1,"content":"x","sender":"a","type":"Pinned"}"#;
        assert!(matches!(
            Envelope::parse(body, now()),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn error_envelope_prefers_message_field() {
        let body = r#"{"type":"Error","message":"not allowed","content":"ignored"}"#;
        assert_eq!(
            Envelope::parse(body, now()).unwrap(),
            Envelope::Error {
                message: "not allowed".into()
            }
        );
    }

    #[test]
    fn edited_envelope_keeps_server_edit_time() {
        let body = r#"{"id":5,"content":"B","sender":"alice","type":"Edited","lastEdited":"2024-05-01T11:00:00Z"}"#;
        assert_eq!(
            Envelope::parse(body, now()).unwrap(),
            Envelope::Message(MessageEvent::Edited {
                id: 5,
                content: "B".into(),
                edited_at: Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap(),
            })
        );
    }

    #[test]
    fn encoded_delete_parses_back() {
        let message = Message::new(9, "alice", None, "gone", now());
        let json = encode_envelope(EnvelopeTag::Deleted, &message).unwrap();
        assert!(json.contains(r#""type":"Deleted""#));
        assert_eq!(
            Envelope::parse(&json, now()).unwrap(),
            Envelope::Message(MessageEvent::Deleted { id: 9 })
        );
    }
}
