//! Frame transport seam between the channel state machine and the socket.
//!
//! [`WsConnector`] is the production implementation (STOMP over a WebSocket
//! via `tokio-tungstenite`); tests plug in-process fakes behind the same
//! traits.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};
use url::Url;

use crate::error::ChannelError;
use crate::stomp::Frame;

/// A bidirectional, frame-oriented connection to one server.
#[async_trait]
pub trait StompTransport: Send {
    async fn send(&mut self, frame: &Frame) -> Result<(), ChannelError>;

    /// Next frame from the server. `None` once the peer has closed.
    async fn next_frame(&mut self) -> Option<Result<Frame, ChannelError>>;

    async fn close(&mut self);
}

/// Opens transports. One call per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn StompTransport>, ChannelError>;
}

/// Messaging endpoint for a server base address: `http→ws`, `https→wss`,
/// with `path` appended to the base path.
pub fn ws_url(base_url: &str, path: &str) -> Result<String, ChannelError> {
    let mut url =
        Url::parse(base_url).map_err(|e| ChannelError::InvalidAddress(format!("{base_url}: {e}")))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ChannelError::InvalidAddress(format!(
                "unsupported scheme {other:?} in {base_url}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ChannelError::InvalidAddress(base_url.to_string()))?;

    let joined = format!("{}{}", url.path().trim_end_matches('/'), path);
    url.set_path(&joined);
    Ok(url.to_string())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn StompTransport>, ChannelError> {
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        debug!(url = %url, status = %response.status(), "websocket opened");
        Ok(Box::new(WsTransport { stream }))
    }
}

struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl StompTransport for WsTransport {
    async fn send(&mut self, frame: &Frame) -> Result<(), ChannelError> {
        trace!(command = %frame.command, "sending frame");
        self.stream
            .send(Message::Text(frame.encode()))
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<Frame, ChannelError>> {
        loop {
            let text = match self.stream.next().await? {
                Ok(Message::Text(text)) => text,
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(e) => return Some(Err(ChannelError::Transport(e.to_string()))),
                },
                Ok(Message::Close(reason)) => {
                    debug!(reason = ?reason, "websocket closed by server");
                    return None;
                }
                Ok(_) => continue,
                Err(e) => return Some(Err(ChannelError::Transport(e.to_string()))),
            };

            match Frame::decode(&text) {
                Ok(Some(frame)) => return Some(Ok(frame)),
                Ok(None) => trace!("heart-beat"),
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "websocket close failed");
        }
    }
}
