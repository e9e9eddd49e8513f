//! WebSocket Transport
//!
//! [`Connector`] backed by `tokio-tungstenite`. TLS uses rustls with the
//! webpki root store; the binary installs the ring crypto provider before
//! the first connection.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::application::ports::{
    Connection, Connector, FrameSink, FrameSource, TransportError, WireFrame,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a new connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
        let (ws_stream, response) =
            tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| TransportError::Connect {
                    endpoint: redact_query(url),
                    reason: e.to_string(),
                })?;

        tracing::debug!(
            endpoint = %redact_query(url),
            status = response.status().as_u16(),
            "WebSocket handshake complete"
        );

        let (write, read) = ws_stream.split();
        Ok(Connection {
            sink: Box::new(WsSink { write }),
            source: Box::new(WsSource { read }),
        })
    }
}

struct WsSink {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        let message = match frame {
            WireFrame::Text(text) => Message::Text(text.into()),
            WireFrame::Binary(data) => Message::Binary(data.into()),
            WireFrame::Ping(data) => Message::Ping(data.into()),
            WireFrame::Pong(data) => Message::Pong(data.into()),
            WireFrame::Close => Message::Close(None),
        };
        self.write
            .send(message)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.write
            .close()
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

struct WsSource {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Option<Result<WireFrame, TransportError>> {
        loop {
            let frame = match self.read.next().await? {
                Ok(Message::Text(text)) => WireFrame::Text(text.to_string()),
                Ok(Message::Binary(data)) => WireFrame::Binary(data.to_vec()),
                Ok(Message::Ping(data)) => WireFrame::Ping(data.to_vec()),
                Ok(Message::Pong(data)) => WireFrame::Pong(data.to_vec()),
                Ok(Message::Close(_)) => WireFrame::Close,
                // Raw frames only surface when writing; never on read.
                Ok(Message::Frame(_)) => continue,
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            };
            return Some(Ok(frame));
        }
    }
}

/// Strip the query string, which may carry credentials.
#[must_use]
pub fn redact_query(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{base}?[REDACTED]"),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_query_string() {
        assert_eq!(
            redact_query("wss://ws.finnhub.io?token=secret"),
            "wss://ws.finnhub.io?[REDACTED]"
        );
        assert_eq!(
            redact_query("wss://socket.polygon.io/stocks"),
            "wss://socket.polygon.io/stocks"
        );
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_connect_error() {
        let result = WebSocketConnector::new()
            .connect("ws://127.0.0.1:1/?token=secret")
            .await;

        match result {
            Err(TransportError::Connect { endpoint, .. }) => {
                assert!(!endpoint.contains("secret"));
            }
            other => panic!("expected connect error, got {other:?}"),
        }
    }
}
