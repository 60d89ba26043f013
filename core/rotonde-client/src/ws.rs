//! WebSocket channel (tokio-tungstenite).

use crate::error::{ClientError, ClientResult};
use crate::transport::{Channel, Connector};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, warn};

/// Opens WebSocket channels with `connect_async`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> ClientResult<Box<dyn Channel>> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ClientError::Connection(format!("{url}: {e}")))?;
        Ok(Box::new(WsChannel::new(stream)))
    }
}

/// A WebSocket carrying one packet per text frame.
pub struct WsChannel<S> {
    stream: WebSocketStream<S>,
}

impl<S> WsChannel<S> {
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }

    /// Consumes the channel and returns the underlying stream.
    pub fn into_inner(self) -> WebSocketStream<S> {
        self.stream
    }
}

#[async_trait]
impl<S> Channel for WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_text(&mut self, text: String) -> ClientResult<()> {
        self.stream
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))
    }

    async fn next_text(&mut self) -> Option<ClientResult<String>> {
        loop {
            match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(text.to_string())),
                Ok(WsMessage::Binary(data)) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(e) => warn!("Dropping binary frame that is not UTF-8: {e}"),
                },
                Ok(WsMessage::Close(frame)) => {
                    debug!("received close frame: {frame:?}");
                    return None;
                }
                // Pongs are queued by tungstenite itself.
                Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => continue,
                Err(e) => return Some(Err(ClientError::Connection(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) -> ClientResult<()> {
        self.stream
            .close(None)
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))
    }
}
