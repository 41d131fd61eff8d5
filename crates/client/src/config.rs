//! Client configuration, with environment variable loading.

use std::time::Duration;

use chatline_shared::UserId;
use url::Url;

use crate::error::ConfigError;

/// Credentials presented to the broker and the REST backend.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub login: Option<String>,
    pub passcode: Option<String>,
    /// Bearer token for REST calls.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStrategy {
    Fixed,
    Exponential,
}

/// Configuration for auto-reconnect behavior. Retries are unlimited until
/// an explicit disconnect.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub strategy: ReconnectStrategy,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for exponential growth
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            strategy: ReconnectStrategy::Exponential,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30000),
            backoff_multiplier: 1.5,
        }
    }
}

impl ReconnectConfig {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: ReconnectStrategy::Fixed,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
        }
    }

    /// Calculate delay for a given zero-based retry number.
    /// Never decreases as `attempt` grows.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.strategy {
            ReconnectStrategy::Fixed => self.initial_delay,
            ReconnectStrategy::Exponential => {
                let exponent = attempt.min(i32::MAX as u32) as i32;
                let initial = self.initial_delay.as_millis() as f64;
                let max = self.max_delay.as_millis().max(self.initial_delay.as_millis()) as f64;
                let delay = initial * self.backoff_multiplier.max(1.0).powi(exponent);
                Duration::from_millis(delay.min(max) as u64)
            }
        }
    }
}

/// Keep-alive policy. A zero interval disables that direction.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// How often the client sends a heart-beat.
    pub outgoing: Duration,
    /// How often the client expects traffic from the broker.
    pub incoming: Duration,
    /// Extra silence tolerated on top of `incoming` before the link is
    /// declared dead.
    pub grace: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            outgoing: Duration::from_millis(10000),
            incoming: Duration::from_millis(10000),
            grace: Duration::from_millis(5000),
        }
    }
}

impl HeartbeatConfig {
    pub fn disabled() -> Self {
        Self {
            outgoing: Duration::ZERO,
            incoming: Duration::ZERO,
            grace: Duration::ZERO,
        }
    }

    /// Value of the `heart-beat` header sent on CONNECT.
    pub fn header_value(&self) -> String {
        format!("{},{}", self.outgoing.as_millis(), self.incoming.as_millis())
    }

    /// Longest silence allowed from the broker, if liveness is checked.
    pub fn liveness_window(&self) -> Option<Duration> {
        (!self.incoming.is_zero()).then(|| self.incoming + self.grace)
    }

    /// Intervals agreed with the broker's CONNECTED `heart-beat:sx,sy`.
    ///
    /// A direction is off when either side offers zero; otherwise the slower
    /// of the two rates applies. A missing or malformed header counts as
    /// `0,0`.
    pub fn negotiate(&self, server: Option<&str>) -> HeartbeatConfig {
        let (sx, sy) = server.and_then(parse_heart_beat).unwrap_or_default();
        let agree = |ours: Duration, theirs: Duration| {
            if ours.is_zero() || theirs.is_zero() {
                Duration::ZERO
            } else {
                ours.max(theirs)
            }
        };
        HeartbeatConfig {
            outgoing: agree(self.outgoing, sy),
            incoming: agree(self.incoming, sx),
            grace: self.grace,
        }
    }
}

fn parse_heart_beat(value: &str) -> Option<(Duration, Duration)> {
    let (x, y) = value.split_once(',')?;
    let x = x.trim().parse().ok()?;
    let y = y.trim().parse().ok()?;
    Some((Duration::from_millis(x), Duration::from_millis(y)))
}

/// Broker destinations. `{user}` in a subscribe destination is replaced by
/// the connected user id.
#[derive(Debug, Clone)]
pub struct Destinations {
    pub publish_broadcast: String,
    pub publish_direct: String,
    pub publish_edit: String,
    pub publish_delete: String,
    pub broadcast: String,
    pub direct: String,
    pub errors: String,
}

impl Default for Destinations {
    fn default() -> Self {
        Self {
            publish_broadcast: "/app/chat.send".to_string(),
            publish_direct: "/app/chat.private".to_string(),
            publish_edit: "/app/chat.edit".to_string(),
            publish_delete: "/app/chat.delete".to_string(),
            broadcast: "/topic/public".to_string(),
            direct: "/user/{user}/queue/messages".to_string(),
            errors: "/user/{user}/queue/errors".to_string(),
        }
    }
}

impl Destinations {
    pub fn resolve(template: &str, user_id: &str) -> String {
        template.replace("{user}", user_id)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker WebSocket endpoint (ws:// or wss://).
    pub endpoint: Url,
    /// Base URL of the REST backend.
    pub api_base_url: String,
    pub user_id: UserId,
    pub credentials: Credentials,
    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectConfig,
    pub handshake_timeout: Duration,
    pub destinations: Destinations,
    /// Tolerance when matching a provisional entry to its authoritative copy.
    pub delivery_window: Duration,
    /// Content shown in place of a deleted message.
    pub deletion_marker: String,
    /// Publish confirmed mutations to the broker's outbound destinations.
    ///
    /// Only enable this when those destinations fan out notifications. On a
    /// broker that treats `publish_broadcast` or `publish_direct` as a create
    /// command, every relayed send is stored a second time.
    pub relay_confirmed: bool,
}

impl ClientConfig {
    pub fn new(endpoint: Url, user_id: impl Into<UserId>) -> Self {
        let api_base_url = derive_api_base(&endpoint);
        Self {
            endpoint,
            api_base_url,
            user_id: user_id.into(),
            credentials: Credentials::default(),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            handshake_timeout: Duration::from_millis(10000),
            destinations: Destinations::default(),
            delivery_window: Duration::from_millis(1000),
            deletion_marker: "This message was deleted".to_string(),
            relay_confirmed: false,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `CHATLINE_ENDPOINT` (required): broker WebSocket URL
    /// - `CHATLINE_USER_ID` (required): id of the connecting user
    /// - `CHATLINE_API_URL`: REST base URL (default: endpoint with http(s) scheme)
    /// - `CHATLINE_LOGIN`, `CHATLINE_PASSCODE`, `CHATLINE_TOKEN`: credentials
    /// - `CHATLINE_HEARTBEAT_MS` (default 10000, 0 disables); the broker's
    ///   CONNECTED offer can lower this to off
    /// - `CHATLINE_HEARTBEAT_GRACE_MS` (default 5000)
    /// - `CHATLINE_HANDSHAKE_TIMEOUT_MS` (default 10000)
    /// - `CHATLINE_RECONNECT`: "fixed" | "exponential" (default "exponential")
    /// - `CHATLINE_RECONNECT_DELAY_MS` (default 1000)
    /// - `CHATLINE_RECONNECT_MAX_DELAY_MS` (default 30000)
    /// - `CHATLINE_DELIVERY_WINDOW_MS` (default 1000)
    /// - `CHATLINE_RELAY`: "true" | "false" (default "false")
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let endpoint =
            lookup("CHATLINE_ENDPOINT").ok_or(ConfigError::Missing("CHATLINE_ENDPOINT"))?;
        let endpoint = Url::parse(&endpoint).map_err(|e| ConfigError::Invalid {
            name: "CHATLINE_ENDPOINT",
            reason: e.to_string(),
        })?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(ConfigError::Invalid {
                name: "CHATLINE_ENDPOINT",
                reason: format!("unsupported scheme `{}`", endpoint.scheme()),
            });
        }
        let user_id = lookup("CHATLINE_USER_ID")
            .filter(|id| !id.trim().is_empty())
            .ok_or(ConfigError::Missing("CHATLINE_USER_ID"))?;

        let mut config = Self::new(endpoint, user_id);

        if let Some(api) = lookup("CHATLINE_API_URL") {
            config.api_base_url = api;
        }
        config.credentials = Credentials {
            login: lookup("CHATLINE_LOGIN"),
            passcode: lookup("CHATLINE_PASSCODE"),
            token: lookup("CHATLINE_TOKEN"),
        };

        if let Some(ms) = millis(&lookup, "CHATLINE_HEARTBEAT_MS")? {
            config.heartbeat.outgoing = ms;
            config.heartbeat.incoming = ms;
        }
        if let Some(ms) = millis(&lookup, "CHATLINE_HEARTBEAT_GRACE_MS")? {
            config.heartbeat.grace = ms;
        }
        if let Some(ms) = millis(&lookup, "CHATLINE_HANDSHAKE_TIMEOUT_MS")? {
            config.handshake_timeout = ms;
        }

        let strategy = lookup("CHATLINE_RECONNECT")
            .unwrap_or_else(|| "exponential".to_string())
            .to_lowercase();
        config.reconnect.strategy = match strategy.as_str() {
            "fixed" => ReconnectStrategy::Fixed,
            "exponential" => ReconnectStrategy::Exponential,
            other => {
                return Err(ConfigError::Invalid {
                    name: "CHATLINE_RECONNECT",
                    reason: format!("expected `fixed` or `exponential`, got `{other}`"),
                })
            }
        };
        if let Some(ms) = millis(&lookup, "CHATLINE_RECONNECT_DELAY_MS")? {
            config.reconnect.initial_delay = ms;
        }
        if let Some(ms) = millis(&lookup, "CHATLINE_RECONNECT_MAX_DELAY_MS")? {
            config.reconnect.max_delay = ms;
        }
        if let Some(ms) = millis(&lookup, "CHATLINE_DELIVERY_WINDOW_MS")? {
            config.delivery_window = ms;
        }
        if let Some(relay) = lookup("CHATLINE_RELAY") {
            config.relay_confirmed = relay.parse().map_err(|_| ConfigError::Invalid {
                name: "CHATLINE_RELAY",
                reason: format!("expected `true` or `false`, got `{relay}`"),
            })?;
        }

        Ok(config)
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| ConfigError::Invalid {
                    name,
                    reason: e.to_string(),
                })
        })
        .transpose()
}

/// REST base for a broker endpoint: same host, http(s) scheme, root path.
fn derive_api_base(endpoint: &Url) -> String {
    let mut base = endpoint.clone();
    let scheme = if endpoint.scheme() == "wss" { "https" } else { "http" };
    if base.set_scheme(scheme).is_err() {
        return endpoint.to_string();
    }
    base.set_path("");
    base.set_query(None);
    base.to_string().trim_end_matches('/').to_string()
}
