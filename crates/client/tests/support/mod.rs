//! In-memory broker and REST backend for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chatline_client::{
    ChatClient, ClientConfig, ConnectionEvent, ConversationEvent, HeartbeatConfig, MessageApi,
    ReconnectConfig, Transport, TransportError,
};
use chatline_client::{FrameSink, FrameStream};
use chatline_shared::{
    ApiError, Command, CreateMessageRequest, EditMessageRequest, Frame, Message, MessageId,
    UserProfile,
};
use chrono::{DateTime, Utc};
use futures_channel::mpsc::{unbounded, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use url::Url;

pub const USER: &str = "alice";

/// Poll `condition` until it holds, advancing (paused) time in small steps.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Let spawned tasks run without moving the clock.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

pub fn config() -> ClientConfig {
    let mut config = ClientConfig::new(Url::parse("ws://broker.test/ws").unwrap(), USER);
    config.heartbeat = HeartbeatConfig::disabled();
    config.reconnect = ReconnectConfig::fixed(Duration::from_millis(500));
    config.handshake_timeout = Duration::from_secs(2);
    config
}

// --- Broker ---

#[derive(Debug, Clone, PartialEq)]
pub enum Handshake {
    Accept,
    Reject(String),
    /// Never answer CONNECT.
    Silent,
}

/// One transport session as seen from the broker side.
#[derive(Clone)]
pub struct Session {
    to_client: UnboundedSender<Result<String, TransportError>>,
    received: Arc<Mutex<Vec<Frame>>>,
    heartbeats: Arc<AtomicUsize>,
    closed: Arc<Mutex<bool>>,
}

impl Session {
    pub fn frames(&self) -> Vec<Frame> {
        self.received.lock().unwrap().clone()
    }

    pub fn frames_of(&self, command: Command) -> Vec<Frame> {
        self.frames()
            .into_iter()
            .filter(|f| f.command == command)
            .collect()
    }

    pub fn heartbeats(&self) -> usize {
        self.heartbeats.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }

    pub fn push(&self, frame: Frame) {
        let _ = self.to_client.unbounded_send(Ok(frame.encode()));
    }

    pub fn push_heartbeat(&self) {
        let _ = self.to_client.unbounded_send(Ok("\n".to_string()));
    }

    /// Deliver `body` on one of the client's subscriptions.
    pub fn deliver(&self, subscription: &str, body: &str) {
        self.push(
            Frame::new(Command::Message)
                .header("subscription", subscription)
                .header("message-id", "m-1")
                .with_body(body),
        );
    }

    /// Simulate the network dropping the session.
    pub fn drop_connection(&self) {
        let _ = self.to_client.unbounded_send(Err(TransportError::Closed));
    }
}

#[derive(Default)]
struct BrokerState {
    opens: usize,
    failures_left: usize,
    handshake: Option<Handshake>,
    /// `heart-beat` value answered on CONNECTED; `0,0` when unset.
    heart_beat: Option<String>,
    sessions: Vec<Session>,
}

#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_opens(&self, count: usize) {
        self.state.lock().unwrap().failures_left = count;
    }

    pub fn set_handshake(&self, handshake: Handshake) {
        self.state.lock().unwrap().handshake = Some(handshake);
    }

    pub fn set_heart_beat(&self, value: &str) {
        self.state.lock().unwrap().heart_beat = Some(value.to_string());
    }

    /// Transport open attempts, failed ones included.
    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.state.lock().unwrap().sessions.clone()
    }

    pub fn latest(&self) -> Session {
        self.sessions().pop().expect("no session opened")
    }
}

#[async_trait]
impl Transport for FakeBroker {
    async fn open(&self, _endpoint: &Url) -> Result<(FrameSink, FrameStream), TransportError> {
        let (handshake, heart_beat) = {
            let mut state = self.state.lock().unwrap();
            state.opens += 1;
            if state.failures_left > 0 {
                state.failures_left -= 1;
                return Err(TransportError::Connect("connection refused".into()));
            }
            (
                state.handshake.clone().unwrap_or(Handshake::Accept),
                state.heart_beat.clone().unwrap_or_else(|| "0,0".to_string()),
            )
        };

        let (client_tx, mut client_rx) = unbounded::<String>();
        let (server_tx, server_rx) = unbounded::<Result<String, TransportError>>();
        let session = Session {
            to_client: server_tx.clone(),
            received: Arc::new(Mutex::new(Vec::new())),
            heartbeats: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(Mutex::new(false)),
        };
        self.state.lock().unwrap().sessions.push(session.clone());

        tokio::spawn(async move {
            while let Some(text) = client_rx.next().await {
                let frame = match Frame::decode(&text) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        session.heartbeats.fetch_add(1, Ordering::SeqCst);
                        continue;
                    }
                    Err(e) => panic!("client sent an invalid frame: {e}"),
                };
                match (&frame.command, &handshake) {
                    (Command::Connect, Handshake::Accept) => session.push(
                        Frame::new(Command::Connected)
                            .header("version", "1.2")
                            .header("heart-beat", heart_beat.as_str()),
                    ),
                    (Command::Connect, Handshake::Reject(reason)) => session.push(
                        Frame::new(Command::Error)
                            .header("message", reason.as_str())
                            .with_body(reason.as_str()),
                    ),
                    (Command::Disconnect, _) => {
                        if let Some(receipt) = frame.get("receipt") {
                            session
                                .push(Frame::new(Command::Receipt).header("receipt-id", receipt));
                        }
                    }
                    _ => {}
                }
                session.received.lock().unwrap().push(frame);
            }
            *session.closed.lock().unwrap() = true;
        });

        let sink = client_tx.sink_map_err(|_| TransportError::Closed);
        Ok((Box::pin(sink), Box::pin(server_rx)))
    }
}

// --- REST backend ---

#[derive(Default)]
struct ApiState {
    next_id: MessageId,
    messages: HashMap<MessageId, Message>,
    failures: VecDeque<ApiError>,
    delete_returns_body: bool,
    creates: Vec<CreateMessageRequest>,
    edits: Vec<(MessageId, EditMessageRequest)>,
    deletes: Vec<(MessageId, String)>,
    users: HashMap<String, UserProfile>,
    user_lookups: usize,
}

/// Backend holding messages in memory. Requests wait while the gate is closed.
pub struct FakeApi {
    state: Mutex<ApiState>,
    gate: watch::Sender<bool>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ApiState {
                next_id: 42,
                ..Default::default()
            }),
            gate: watch::channel(true).0,
        })
    }

    pub fn with_history(messages: Vec<Message>) -> Arc<Self> {
        let api = Self::new();
        {
            let mut state = api.state.lock().unwrap();
            for message in messages {
                state.messages.insert(message.id, message);
            }
        }
        api
    }

    pub fn add_user(&self, id: &str, display_name: &str) {
        self.state.lock().unwrap().users.insert(
            id.to_string(),
            UserProfile {
                id: id.to_string(),
                display_name: Some(display_name.to_string()),
            },
        );
    }

    pub fn fail_next(&self, error: ApiError) {
        self.state.lock().unwrap().failures.push_back(error);
    }

    pub fn delete_returns_body(&self, yes: bool) {
        self.state.lock().unwrap().delete_returns_body = yes;
    }

    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn creates(&self) -> usize {
        self.state.lock().unwrap().creates.len()
    }

    pub fn edits(&self) -> usize {
        self.state.lock().unwrap().edits.len()
    }

    pub fn deletes(&self) -> usize {
        self.state.lock().unwrap().deletes.len()
    }

    pub fn user_lookups(&self) -> usize {
        self.state.lock().unwrap().user_lookups
    }

    async fn admit(&self) -> Result<(), ApiError> {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        match self.state.lock().unwrap().failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

pub fn http(status: u16, detail: &str) -> ApiError {
    ApiError::Http {
        status,
        body: format!(r#"{{"title":"Error","status":{status},"detail":"{detail}"}}"#),
    }
}

fn not_found(id: MessageId) -> ApiError {
    http(404, &format!("message {id} not found"))
}

#[async_trait]
impl MessageApi for FakeApi {
    async fn create_message(&self, request: &CreateMessageRequest) -> Result<Message, ApiError> {
        self.admit().await?;
        let mut state = self.state.lock().unwrap();
        state.creates.push(request.clone());
        let id = state.next_id;
        state.next_id += 1;
        let message = Message::new(
            id,
            request.sender.clone(),
            request.receiver.clone(),
            request.content.clone(),
            request.timestamp + chrono::Duration::milliseconds(150),
        );
        state.messages.insert(id, message.clone());
        Ok(message)
    }

    async fn edit_message(
        &self,
        id: MessageId,
        request: &EditMessageRequest,
    ) -> Result<Message, ApiError> {
        self.admit().await?;
        let mut state = self.state.lock().unwrap();
        state.edits.push((id, request.clone()));
        let message = state.messages.get_mut(&id).ok_or_else(|| not_found(id))?;
        if message.sender_id != request.acting_user_id {
            return Err(http(403, "You can only edit your own messages"));
        }
        message.content = request.content.clone();
        message.last_edited_at = Some(Utc::now());
        Ok(message.clone())
    }

    async fn delete_message(
        &self,
        id: MessageId,
        acting_user_id: &str,
    ) -> Result<Option<Message>, ApiError> {
        self.admit().await?;
        let mut state = self.state.lock().unwrap();
        state.deletes.push((id, acting_user_id.to_string()));
        let with_body = state.delete_returns_body;
        let message = state.messages.get_mut(&id).ok_or_else(|| not_found(id))?;
        message.deleted = true;
        message.content = "This message was deleted".to_string();
        Ok(with_body.then(|| message.clone()))
    }

    async fn list_messages(&self) -> Result<Vec<Message>, ApiError> {
        self.admit().await?;
        let state = self.state.lock().unwrap();
        Ok(state.messages.values().cloned().collect())
    }

    async fn get_user(&self, id: &str) -> Result<UserProfile, ApiError> {
        self.admit().await?;
        let mut state = self.state.lock().unwrap();
        state.user_lookups += 1;
        state
            .users
            .get(id)
            .cloned()
            .ok_or_else(|| http(404, "unknown user"))
    }
}

// --- Recording listeners ---

pub struct Recorded {
    pub connection: Arc<Mutex<Vec<ConnectionEvent>>>,
    pub conversation: Arc<Mutex<Vec<ConversationEvent>>>,
}

impl Recorded {
    pub fn attach(client: &ChatClient) -> Self {
        let connection = Arc::new(Mutex::new(Vec::new()));
        let conversation = Arc::new(Mutex::new(Vec::new()));
        let sink = connection.clone();
        client
            .events()
            .connection
            .subscribe(move |e: &ConnectionEvent| sink.lock().unwrap().push(e.clone()));
        let sink = conversation.clone();
        client
            .events()
            .conversation
            .subscribe(move |e: &ConversationEvent| sink.lock().unwrap().push(e.clone()));
        Self {
            connection,
            conversation,
        }
    }

    pub fn connection(&self) -> Vec<ConnectionEvent> {
        self.connection.lock().unwrap().clone()
    }

    pub fn conversation(&self) -> Vec<ConversationEvent> {
        self.conversation.lock().unwrap().clone()
    }

    pub fn reconnects(&self) -> Vec<(u32, Duration)> {
        self.connection()
            .into_iter()
            .filter_map(|e| match e {
                ConnectionEvent::ReconnectScheduled { attempt, delay } => Some((attempt, delay)),
                _ => None,
            })
            .collect()
    }
}

pub fn message(id: MessageId, sender: &str, content: &str, at: DateTime<Utc>) -> Message {
    Message::new(id, sender, None, content, at)
}

pub fn created_body(
    id: MessageId,
    sender: &str,
    receiver: Option<&str>,
    content: &str,
    at: DateTime<Utc>,
) -> String {
    let mut body = serde_json::json!({
        "type": "Created",
        "id": id,
        "sender": sender,
        "content": content,
        "timestamp": at.to_rfc3339(),
    });
    if let Some(receiver) = receiver {
        body["receiver"] = serde_json::Value::from(receiver);
    }
    body.to_string()
}
