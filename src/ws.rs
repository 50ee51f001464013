//! WebSocket connection wrapper for the synthesis backend.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::error::Error;

const CONN_TIMEOUT: Duration = Duration::from_secs(10);
const RECV_TIMEOUT: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// WebSocket connection wrapper.
pub struct WebSocket {
    write: Arc<Mutex<futures_util::stream::SplitSink<WsStream, Message>>>,
    read: Arc<Mutex<futures_util::stream::SplitStream<WsStream>>>,
}

impl WebSocket {
    /// Opens a WebSocket to `url`, authenticating with a bearer token.
    pub async fn connect(url: &str, api_key: &str) -> Result<Self, Error> {
        info!(url = %url, "WebSocket connecting");

        let mut request = url.into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| Error::Connect(format!("invalid api key header: {}", e)))?;
        request.headers_mut().insert("Authorization", bearer);

        let (ws_stream, _) = timeout(CONN_TIMEOUT, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| Error::ConnectionTimeout)??;

        info!(url = %url, "WebSocket connected");

        let (write, read) = ws_stream.split();

        Ok(Self {
            write: Arc::new(Mutex::new(write)),
            read: Arc::new(Mutex::new(read)),
        })
    }

    /// Sends a text message.
    pub async fn send_text(&self, text: &str) -> Result<(), Error> {
        let mut writer = self.write.lock().await;
        writer.send(Message::Text(text.to_string())).await?;
        Ok(())
    }

    /// Sends a JSON-serialized message.
    pub async fn send_json<T: serde::Serialize>(&self, payload: &T) -> Result<(), Error> {
        let json = serde_json::to_string(payload)?;
        debug!(json = %json, "WebSocket sending");
        self.send_text(&json).await
    }

    /// Receives the next message with a timeout.
    pub async fn recv(&self) -> Result<Message, Error> {
        let mut reader = self.read.lock().await;
        match timeout(RECV_TIMEOUT, reader.next()).await {
            Ok(Some(Ok(msg))) => Ok(msg),
            Ok(Some(Err(e))) => Err(Error::WebSocket(e)),
            Ok(None) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::ConnectionTimeout),
        }
    }

    /// Closes the WebSocket connection. Failures are ignored.
    pub async fn close(&self) {
        debug!("WebSocket closing");
        let mut writer = self.write.lock().await;
        let _ = writer.send(Message::Close(None)).await;
        let _ = writer.close().await;
        debug!("WebSocket closed");
    }
}
