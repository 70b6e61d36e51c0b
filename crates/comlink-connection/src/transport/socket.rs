//! Websocket push channel.

use std::fmt;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::error::{ConnectionError, Result};

const KIND: &str = "socket";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct SocketTransport {
    url: Url,
    stream: Option<WsStream>,
}

impl fmt::Debug for SocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketTransport")
            .field("url", &self.url.as_str())
            .field("open", &self.stream.is_some())
            .finish()
    }
}

impl SocketTransport {
    /// Accepts `ws://` and `wss://` URLs only.
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| ConnectionError::InvalidConfig(format!("{}: {}", url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConnectionError::InvalidConfig(format!(
                "websocket url must be ws:// or wss://, got {}",
                url
            )));
        }
        Ok(Self { url, stream: None })
    }

    pub fn endpoint(&self) -> String {
        self.url.to_string()
    }

    fn stream(&mut self) -> Result<&mut WsStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| ConnectionError::transport(KIND, "socket not open"))
    }

    pub async fn open(&mut self) -> Result<()> {
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ConnectionError::transport(KIND, e))?;
        debug!(url = %self.url, "websocket connected");
        self.stream = Some(stream);
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            // The peer may already be gone; closing is best effort.
            let _ = stream.close(None).await;
        }
        Ok(())
    }

    pub async fn send(&mut self, data: &str) -> Result<()> {
        self.stream()?
            .send(Message::Text(data.to_string()))
            .await
            .map_err(|e| ConnectionError::transport(KIND, e))
    }

    /// Next text (or binary, decoded lossily) frame. Control frames are
    /// skipped; a close frame ends the connection.
    pub async fn receive(&mut self) -> Result<String> {
        let stream = self.stream()?;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Binary(bytes))) => {
                    return Ok(String::from_utf8_lossy(&bytes).into_owned())
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ConnectionError::transport(KIND, "closed by peer"))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ConnectionError::transport(KIND, e)),
            }
        }
    }
}
