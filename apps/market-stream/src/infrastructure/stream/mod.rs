//! Market Data Stream Adapters
//!
//! The stream client and everything it is built from:
//!
//! - **Client**: connection lifecycle, receive loop, callbacks and stats
//! - **Codecs**: Polygon.io and Finnhub wire formats behind [`FeedCodec`]
//! - **Transports**: WebSocket (`tokio-tungstenite`) and in-process loopback
//! - **Supervision**: heartbeat manager and reconnection backoff

pub mod client;
pub mod codec;
pub mod finnhub;
pub mod heartbeat;
pub mod loopback;
pub mod polygon;
pub mod reconnect;
pub mod websocket;

pub use client::{ListenOutcome, StreamClient, StreamClientConfig, StreamError, StreamStats};
pub use codec::{CodecError, FeedCodec, FeedMessage, codec_for};
pub use finnhub::FinnhubCodec;
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
pub use loopback::{LoopbackAcceptor, LoopbackConnector, LoopbackPeer};
pub use polygon::PolygonCodec;
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use websocket::WebSocketConnector;
