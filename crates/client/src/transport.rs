//! Text-frame transport to the broker.
//!
//! The connection manager only needs a sink and a stream of text messages;
//! [`WebSocketTransport`] provides them over tokio-tungstenite, tests plug in
//! an in-memory broker.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::error::TransportError;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a fresh session to `endpoint`.
    async fn open(&self, endpoint: &Url) -> Result<(FrameSink, FrameStream), TransportError>;
}

/// Native WebSocket transport using tokio-tungstenite.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, endpoint: &Url) -> Result<(FrameSink, FrameStream), TransportError> {
        let (ws_stream, _response) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        crate::log_debug!("WebSocket opened to {}", endpoint);

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|e| TransportError::Io(e.to_string()))
            .with(|text: String| {
                future::ready(Ok::<_, TransportError>(Message::Text(text.into())))
            });

        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                Ok(Message::Close(_)) => Some(Err(TransportError::Closed)),
                // Pong is handled automatically by tungstenite
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::Io(e.to_string()))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}
