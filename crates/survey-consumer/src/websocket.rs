//! WebSocket feed connector
//!
//! Implements the FeedConnector strategy over `tokio-tungstenite`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use survey_core::prelude::*;
use survey_core::strategy::FrameStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};
use url::Url;

/// Connects to the Jetstream WebSocket endpoint
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FeedConnector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<FrameStream> {
        let (mut socket, response) = connect_async(url.as_str())
            .await
            .map_err(|e| IndexerError::transport_with_source("websocket connect failed", e))?;

        debug!(status = %response.status(), "WebSocket handshake complete");

        let frames = async_stream::stream! {
            while let Some(message) = socket.next().await {
                match message {
                    Ok(Message::Text(text)) => yield Ok(Bytes::from(text)),
                    Ok(Message::Binary(data)) => yield Ok(Bytes::from(data)),
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "Server sent close frame");
                        break;
                    }
                    // pings are answered by tungstenite while reading
                    Ok(other) => trace!(kind = ?other, "Skipping control frame"),
                    Err(e) => {
                        yield Err(IndexerError::transport_with_source("websocket read failed", e));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(frames))
    }
}
