//! WebSocket push channel over `tokio-tungstenite`.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::protocol::{encode_client, ClientMessage, MAX_FRAME_SIZE};
use super::{ChannelEvent, Connector, PushChannel, TransportError, TransportResult};

/// Opens WebSocket connections with the credential as a bearer header
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, credential: &str) -> TransportResult<Box<dyn PushChannel>> {
        let mut request = self.url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential))
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, response) = connect_async(request).await?;
        debug!("WebSocket handshake with {} returned {}", self.url, response.status());

        Ok(Box::new(WsChannel { stream }))
    }
}

/// An open WebSocket connection
pub struct WsChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushChannel for WsChannel {
    async fn send(&mut self, message: &ClientMessage) -> TransportResult<()> {
        let text = encode_client(message)?;
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> ChannelEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return ChannelEvent::Frame(text),
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > MAX_FRAME_SIZE {
                        warn!("Skipping {} byte binary frame", data.len());
                        continue;
                    }
                    match String::from_utf8(data) {
                        Ok(text) => return ChannelEvent::Frame(text),
                        Err(_) => warn!("Skipping non UTF-8 binary frame"),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    return ChannelEvent::ServerClosed(frame.map(|f| f.reason.to_string()));
                }
                // Pings are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => return ChannelEvent::Failed(e.into()),
                None => return ChannelEvent::Failed(TransportError::Closed),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("Error while closing WebSocket: {}", e);
        }
    }
}
