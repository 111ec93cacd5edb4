//! Websocket client for an external log relay.

use super::{RelaySource, RelayStream};
use crate::error::TransportError;
use async_trait::async_trait;
use futures::{future, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Reads text frames from a relay websocket endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketRelaySource {
    url: String,
}

impl WebSocketRelaySource {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RelaySource for WebSocketRelaySource {
    async fn connect(&self) -> Result<RelayStream, TransportError> {
        let (ws_stream, response) = connect_async(self.url.as_str()).await?;
        tracing::debug!(
            url = %self.url,
            status = %response.status(),
            "Relay websocket connection established"
        );

        let frames = ws_stream
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(_) => None,
                    Err(e) => Some(Err(TransportError::from(e))),
                })
            });
        Ok(frames.boxed())
    }
}
