// src/live_query/socket.rs

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::ParseError;

/// A text-frame duplex connection to a live-query server.
#[async_trait]
pub trait LiveSocket: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ParseError>;

    /// The next text frame, `None` once the peer has closed the connection.
    ///
    /// Must be cancel-safe: it is polled inside `tokio::select!`.
    async fn recv_text(&mut self) -> Result<Option<String>, ParseError>;

    async fn close(&mut self) -> Result<(), ParseError>;
}

/// Opens [`LiveSocket`]s; called once per (re)connection attempt.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn LiveSocket>, ParseError>;
}

/// WebSocket connector over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    /// `url` may use `ws`, `wss`, `http` or `https`; HTTP schemes are mapped to
    /// their WebSocket counterparts.
    pub fn new(url: &str) -> Result<Self, ParseError> {
        let mut parsed = Url::parse(url)?;
        let scheme = match parsed.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(ParseError::InvalidUrl(format!(
                    "unsupported live query scheme '{}'",
                    other
                )))
            }
        };
        parsed
            .set_scheme(scheme)
            .map_err(|_| ParseError::InvalidUrl(format!("cannot use '{}' as a live query URL", url)))?;
        Ok(WsConnector { url: parsed })
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }
}

#[async_trait]
impl LiveConnector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn LiveSocket>, ParseError> {
        log::debug!("opening live query connection to {}", self.url);
        let (stream, _response) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        Ok(Box::new(WsSocket { stream }))
    }
}

struct WsSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl LiveSocket for WsSocket {
    async fn send_text(&mut self, text: String) -> Result<(), ParseError> {
        self.stream.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn recv_text(&mut self) -> Result<Option<String>, ParseError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                Some(Ok(Message::Close(frame))) => {
                    log::debug!("live query server closed the connection: {:?}", frame);
                    return Ok(None);
                }
                // Pings are answered by tungstenite on the next read or write.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> Result<(), ParseError> {
        self.stream.close(None).await?;
        Ok(())
    }
}
