//! Broker connection with state management, heart-beats and auto-reconnect.
//!
//! One background task runs per `connect()`. It opens the transport, performs
//! the CONNECT handshake, lets the [`SubscriptionRouter`] subscribe, then
//! pumps frames until the session fails or `disconnect()` is called. Failed
//! sessions are retried with the configured delay policy, forever.
//!
//! Every state change happens under one mutex and is tagged with the epoch
//! of the `connect()` call that started the task. `disconnect()` bumps the
//! epoch, so a task that finishes a handshake after the disconnect can no
//! longer move the state to `Connected`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chatline_shared::{Command, Frame, HEARTBEAT};
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant, Interval};
use url::Url;

use crate::config::{ClientConfig, Credentials, HeartbeatConfig, ReconnectConfig};
use crate::error::{ChatError, TransportError};
use crate::event_bus::{ConnectionEvent, EventBus};
use crate::router::{Routed, SubscriptionRouter};
use crate::transport::{FrameSink, FrameStream, Transport};

/// Connection state for the broker session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. }
        )
    }
}

/// Capability to publish a body to a broker destination.
pub trait Publisher: Send + Sync {
    fn publish(&self, destination: &str, body: String) -> Result<(), ChatError>;
}

struct Inner {
    state: ConnectionState,
    epoch: u64,
    shutdown: Option<watch::Sender<bool>>,
    outbound: Option<UnboundedSender<Frame>>,
}

struct Shared {
    inner: Mutex<Inner>,
    /// Queued under the lock so listeners observe transitions in order.
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state != state {
            crate::log_info!("Connection state {:?} -> {:?}", inner.state, state);
            inner.state = state.clone();
            let _ = self.events.send(ConnectionEvent::StateChanged(state));
        }
    }

    /// Apply `state` if `epoch` is still current.
    fn transition(&self, epoch: u64, state: ConnectionState) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return false;
        }
        self.set_state(&mut inner, state);
        true
    }

    fn announce(&self, epoch: u64, event: ConnectionEvent) -> bool {
        let inner = self.lock();
        if inner.epoch != epoch {
            return false;
        }
        let _ = self.events.send(event);
        true
    }

    /// Install the session's outbound queue and enter `Connected`.
    fn go_live(&self, epoch: u64, outbound: UnboundedSender<Frame>) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return false;
        }
        inner.outbound = Some(outbound);
        self.set_state(&mut inner, ConnectionState::Connected);
        true
    }

    fn go_offline(&self, epoch: u64) {
        let mut inner = self.lock();
        if inner.epoch == epoch {
            inner.outbound = None;
        }
    }

    /// Terminal stop initiated by the task itself.
    fn finish(&self, epoch: u64) {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return;
        }
        inner.epoch += 1;
        inner.shutdown = None;
        inner.outbound = None;
        self.set_state(&mut inner, ConnectionState::Disconnected);
    }
}

#[derive(Clone)]
struct SessionSettings {
    endpoint: Url,
    credentials: Credentials,
    heartbeat: HeartbeatConfig,
    reconnect: ReconnectConfig,
    handshake_timeout: Duration,
}

/// Owns the transport lifecycle. Must be created inside a Tokio runtime.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    router: Arc<SubscriptionRouter>,
    heartbeat: HeartbeatConfig,
    reconnect: ReconnectConfig,
    handshake_timeout: Duration,
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        config: &ClientConfig,
        transport: Arc<dyn Transport>,
        router: Arc<SubscriptionRouter>,
        bus: EventBus,
    ) -> Self {
        let (events, mut events_rx) = mpsc::unbounded_channel::<ConnectionEvent>();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                bus.connection.emit(&event);
            }
        });

        Self {
            transport,
            router,
            heartbeat: config.heartbeat.clone(),
            reconnect: config.reconnect.clone(),
            handshake_timeout: config.handshake_timeout,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    epoch: 0,
                    shutdown: None,
                    outbound: None,
                }),
                events,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state.clone()
    }

    /// Start connecting. Fails fast if a connection is already active or
    /// being (re)established; progress is reported through events.
    pub fn connect(&self, endpoint: Url, credentials: Credentials) -> Result<(), ChatError> {
        let mut inner = self.shared.lock();
        if inner.state != ConnectionState::Disconnected {
            return Err(ChatError::AlreadyConnected);
        }

        inner.epoch += 1;
        let epoch = inner.epoch;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        inner.shutdown = Some(shutdown_tx);
        self.shared.set_state(&mut inner, ConnectionState::Connecting);
        drop(inner);

        let task = ConnectionTask {
            transport: self.transport.clone(),
            router: self.router.clone(),
            shared: self.shared.clone(),
            settings: SessionSettings {
                endpoint,
                credentials,
                heartbeat: self.heartbeat.clone(),
                reconnect: self.reconnect.clone(),
                handshake_timeout: self.handshake_timeout,
            },
            epoch,
        };
        tokio::spawn(task.run(shutdown_rx));
        Ok(())
    }

    /// Stop the connection and any pending reconnect. Always succeeds and
    /// may be called repeatedly.
    pub fn disconnect(&self) {
        let mut inner = self.shared.lock();
        inner.epoch += 1;

        if let Some(outbound) = inner.outbound.take() {
            for frame in self.router.unsubscribe_frames() {
                let _ = outbound.unbounded_send(frame);
            }
            let receipt = format!("disconnect-{}", inner.epoch);
            let _ = outbound
                .unbounded_send(Frame::new(Command::Disconnect).header("receipt", receipt));
        }
        self.router.reset();

        if let Some(shutdown) = inner.shutdown.take() {
            let _ = shutdown.send(true);
        }
        self.shared.set_state(&mut inner, ConnectionState::Disconnected);
    }
}

impl Publisher for ConnectionManager {
    fn publish(&self, destination: &str, body: String) -> Result<(), ChatError> {
        let inner = self.shared.lock();
        let outbound = inner.outbound.as_ref().ok_or(ChatError::NotConnected)?;
        let frame = Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .with_body(body);
        outbound
            .unbounded_send(frame)
            .map_err(|_| ChatError::NotConnected)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct Session {
    sink: FrameSink,
    stream: FrameStream,
    /// Intervals agreed in the handshake.
    heartbeat: HeartbeatConfig,
}

enum SessionEnd {
    Shutdown,
    Failed(TransportError),
    EngineGone,
}

enum Inbound {
    Continue,
    Failed(TransportError),
    EngineGone,
}

struct ConnectionTask {
    transport: Arc<dyn Transport>,
    router: Arc<SubscriptionRouter>,
    shared: Arc<Shared>,
    settings: SessionSettings,
    epoch: u64,
}

impl ConnectionTask {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt = 0u32;

        loop {
            let established = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                result = self.establish() => result,
            };

            match established {
                Ok(session) => {
                    attempt = 0;
                    let end = self.serve(session, &mut shutdown).await;
                    self.shared.go_offline(self.epoch);
                    self.router.reset();
                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::EngineGone => {
                            self.shared.finish(self.epoch);
                            break;
                        }
                        SessionEnd::Failed(e) => {
                            crate::log_error!(
                                "Session to {} failed: {}",
                                self.settings.endpoint,
                                e
                            );
                        }
                    }
                }
                Err(e) => {
                    crate::log_error!("Connecting to {} failed: {}", self.settings.endpoint, e);
                }
            }

            attempt = attempt.saturating_add(1);
            let delay = self.settings.reconnect.delay_for_attempt(attempt - 1);
            if !self
                .shared
                .transition(self.epoch, ConnectionState::Reconnecting { attempt })
            {
                break;
            }
            self.shared
                .announce(self.epoch, ConnectionEvent::ReconnectScheduled { attempt, delay });
            crate::log_info!(
                "Reconnecting to {} in {}ms (attempt {})",
                self.settings.endpoint,
                delay.as_millis(),
                attempt
            );

            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                _ = sleep(delay) => {}
            }
        }

        crate::log_debug!("Connection task for epoch {} stopped", self.epoch);
    }

    /// Open the transport, handshake and subscribe.
    async fn establish(&self) -> Result<Session, TransportError> {
        let (mut sink, mut stream) = self.transport.open(&self.settings.endpoint).await?;

        sink.send(self.connect_frame().encode()).await?;
        let reply = timeout(self.settings.handshake_timeout, next_frame(&mut stream))
            .await
            .map_err(|_| {
                TransportError::Handshake("timed out waiting for CONNECTED".to_string())
            })??;

        let heartbeat = match reply.command {
            Command::Connected => self.settings.heartbeat.negotiate(reply.get("heart-beat")),
            Command::Error => {
                let reason = reply
                    .get("message")
                    .map(str::to_string)
                    .unwrap_or_else(|| reply.body.clone());
                return Err(TransportError::Handshake(reason));
            }
            other => {
                return Err(TransportError::Handshake(format!(
                    "unexpected {} frame",
                    other.as_str()
                )))
            }
        };
        crate::log_debug!(
            "Heart-beats agreed: send every {}ms, expect every {}ms",
            heartbeat.outgoing.as_millis(),
            heartbeat.incoming.as_millis()
        );

        for frame in self.router.subscribe_frames() {
            sink.send(frame.encode()).await?;
        }

        Ok(Session {
            sink,
            stream,
            heartbeat,
        })
    }

    fn connect_frame(&self) -> Frame {
        let host = self.settings.endpoint.host_str().unwrap_or("localhost");
        let mut frame = Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", self.settings.heartbeat.header_value());
        let credentials = &self.settings.credentials;
        if let Some(login) = &credentials.login {
            frame = frame.header("login", login.as_str());
        }
        if let Some(passcode) = &credentials.passcode {
            frame = frame.header("passcode", passcode.as_str());
        }
        if let Some(token) = &credentials.token {
            frame = frame.header("Authorization", format!("Bearer {token}"));
        }
        frame
    }

    async fn serve(&self, session: Session, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        let Session {
            mut sink,
            mut stream,
            heartbeat,
        } = session;
        let (outbound_tx, mut outbound_rx) = unbounded::<Frame>();

        if !self.shared.go_live(self.epoch, outbound_tx) {
            // Disconnected while the handshake was in flight.
            let _ = sink.send(Frame::new(Command::Disconnect).encode()).await;
            let _ = sink.close().await;
            return SessionEnd::Shutdown;
        }
        crate::log_info!("Connected to {}", self.settings.endpoint);

        let liveness = heartbeat.liveness_window();
        let mut ticker = (!heartbeat.outgoing.is_zero())
            .then(|| interval_at(Instant::now() + heartbeat.outgoing, heartbeat.outgoing));
        let mut last_seen = Instant::now();

        loop {
            let deadline = liveness.map(|window| last_seen + window);

            tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => {
                    self.drain_and_close(&mut sink, &mut outbound_rx).await;
                    return SessionEnd::Shutdown;
                }
                frame = outbound_rx.next() => match frame {
                    Some(frame) => {
                        if let Err(e) = sink.send(frame.encode()).await {
                            return SessionEnd::Failed(e);
                        }
                    }
                    None => {
                        // Queue dropped by disconnect() after its final frames.
                        let _ = sink.close().await;
                        return SessionEnd::Shutdown;
                    }
                },
                _ = tick(&mut ticker) => {
                    if let Err(e) = sink.send(HEARTBEAT.to_string()).await {
                        return SessionEnd::Failed(e);
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    return SessionEnd::Failed(TransportError::HeartbeatTimeout(
                        liveness.unwrap_or_default(),
                    ));
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(text)) => {
                        last_seen = Instant::now();
                        match self.handle_inbound(&text) {
                            Inbound::Continue => {}
                            Inbound::Failed(e) => return SessionEnd::Failed(e),
                            Inbound::EngineGone => {
                                let _ = sink.close().await;
                                return SessionEnd::EngineGone;
                            }
                        }
                    }
                    Some(Err(e)) => return SessionEnd::Failed(e),
                    None => return SessionEnd::Failed(TransportError::Closed),
                },
            }
        }
    }

    fn handle_inbound(&self, text: &str) -> Inbound {
        let frame = match Frame::decode(text) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Inbound::Continue,
            Err(e) => {
                crate::log_warn!("Dropping undecodable frame: {}", e);
                return Inbound::Continue;
            }
        };

        match frame.command {
            Command::Message => match self.router.route(&frame) {
                Routed::Closed => Inbound::EngineGone,
                _ => Inbound::Continue,
            },
            Command::Error => {
                let reason = frame
                    .get("message")
                    .map(str::to_string)
                    .unwrap_or_else(|| frame.body.clone());
                Inbound::Failed(TransportError::Broker(reason))
            }
            Command::Receipt => {
                crate::log_debug!("Receipt {:?}", frame.get("receipt-id"));
                Inbound::Continue
            }
            other => {
                crate::log_debug!("Ignoring {} frame", other.as_str());
                Inbound::Continue
            }
        }
    }

    /// Flush frames queued by `disconnect()` and close, bounded in time.
    async fn drain_and_close(&self, sink: &mut FrameSink, outbound: &mut UnboundedReceiver<Frame>) {
        let flush = async {
            while let Ok(Some(frame)) = outbound.try_next() {
                if sink.send(frame.encode()).await.is_err() {
                    return;
                }
            }
            let _ = sink.close().await;
        };
        if timeout(self.settings.handshake_timeout, flush).await.is_err() {
            crate::log_warn!("Timed out flushing final frames to {}", self.settings.endpoint);
        }
    }
}

/// Resolves once shutdown has been requested or the manager is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// First non-heart-beat frame of the stream.
async fn next_frame(stream: &mut FrameStream) -> Result<Frame, TransportError> {
    while let Some(text) = stream.next().await {
        match Frame::decode(&text?) {
            Ok(Some(frame)) => return Ok(frame),
            Ok(None) => continue,
            Err(e) => return Err(TransportError::Handshake(e.to_string())),
        }
    }
    Err(TransportError::Closed)
}
