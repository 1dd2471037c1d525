//! Upbit public WebSocket client for ticker snapshots.

use crate::exchange::error::ExchangeError;
use crate::exchange::traits::PriceStream;
use crate::exchange::types::{PriceTick, TickerMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

const PUBLIC_WS_URL: &str = "wss://api.upbit.com/websocket/v1";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upbit WebSocket client. Holds one connection at a time.
pub struct UpbitWebSocket {
    url: String,
    stream: Option<WsStream>,
}

impl UpbitWebSocket {
    pub fn new() -> Self {
        Self::with_url(PUBLIC_WS_URL)
    }

    pub fn with_url(url: &str) -> Self {
        Self {
            url: url.to_string(),
            stream: None,
        }
    }

    /// Ticker subscription request for a snapshot of each symbol.
    pub fn subscribe_message(symbols: &[String]) -> String {
        serde_json::json!([
            {"ticket": uuid::Uuid::new_v4().to_string()},
            {"type": "ticker", "codes": symbols, "is_only_snapshot": true},
            {"format": "DEFAULT"}
        ])
        .to_string()
    }

    fn parse_frame(payload: &[u8]) -> Result<PriceTick, ExchangeError> {
        let msg: TickerMessage = serde_json::from_slice(payload)?;
        Ok(msg.into())
    }
}

impl Default for UpbitWebSocket {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceStream for UpbitWebSocket {
    async fn connect(&mut self) -> Result<(), ExchangeError> {
        if let Some(mut old) = self.stream.take() {
            let _ = old.close(None).await;
        }

        info!("Connecting to WebSocket: {}", self.url);
        let (ws_stream, _) = connect_async(self.url.as_str()).await?;
        self.stream = Some(ws_stream);
        info!("WebSocket connected");
        Ok(())
    }

    async fn subscribe(&mut self, symbols: &[String]) -> Result<(), ExchangeError> {
        let stream = self.stream.as_mut().ok_or(ExchangeError::NotConnected)?;
        let request = Self::subscribe_message(symbols);
        debug!(count = symbols.len(), "Sending ticker subscription");
        stream.send(Message::Text(request.into())).await?;
        Ok(())
    }

    async fn next_tick(&mut self) -> Result<PriceTick, ExchangeError> {
        let stream = self.stream.as_mut().ok_or(ExchangeError::NotConnected)?;

        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => return Self::parse_frame(&data),
                Some(Ok(Message::Text(text))) => return Self::parse_frame(text.as_bytes()),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // Pong is handled automatically by tungstenite
                    continue;
                }
                Some(Ok(Message::Close(frame))) => {
                    warn!(?frame, "WebSocket closed by server");
                    self.stream = None;
                    return Err(ExchangeError::WebSocket("closed by server".to_string()));
                }
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    self.stream = None;
                    return Err(ExchangeError::WebSocket("stream ended".to_string()));
                }
            }
        }
    }
}
